// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::{arena::ArenaError, filter_bank::FilterBankError, output::StorageError};

/// Errors that stop a pipeline. Per-block problems never end up here; those
/// blocks are written as dropped or missing instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("The arena ({available} bytes) can't hold even one block, which needs {needed} bytes")]
    ArenaTooSmall { needed: usize, available: usize },

    #[error("A pipeline needs at least one {0}")]
    Empty(&'static str),

    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error(transparent)]
    FilterBank(#[from] FilterBankError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
