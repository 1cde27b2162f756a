// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::arena::ArenaError;

/// Reasons why a single block could not be processed. None of these stop the
/// pipeline; the block is dropped and recorded as invalid in the output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockError {
    #[error("Station {station} polarisation {polarization} is outside the block")]
    OutOfRange { station: usize, polarization: usize },

    #[error("Expected {expected} samples per station and polarisation, but got {got}")]
    SampleCount { expected: usize, got: usize },

    #[error("Expected metadata for {expected} stations, but got {got}")]
    MetadataCount { expected: usize, got: usize },

    #[error("No data arrived for this block")]
    Missing,

    #[error("Block {sequence_number} arrived after block {expected} was expected; it is discarded")]
    OutOfOrder { sequence_number: u64, expected: u64 },

    #[error(transparent)]
    Arena(#[from] ArenaError),
}
