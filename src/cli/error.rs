// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all correlator errors. This should be the *only* error enum
//! that is publicly visible from the binary.

use thiserror::Error;

use crate::{
    arena::ArenaError, block::BlockError, config::ConfigError, filter_bank::FilterBankError,
    output::StorageError, pipeline::PipelineError,
};

#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    FilterBank(#[from] FilterBankError),

    #[error("{0}")]
    Block(#[from] BlockError),

    #[error("{0}")]
    Arena(#[from] ArenaError),

    #[error("{0}")]
    IO(#[from] std::io::Error),

    /// A generic error that can't be clarified further.
    #[error("{0}")]
    Generic(String),
}
