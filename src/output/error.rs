// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Errors from the storage writer. Unlike block errors, these stop the
/// pipeline.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Output records must have increasing sequence numbers, but {got} followed {previous}")]
    NotMonotonic { previous: u64, got: u64 },

    #[error("Couldn't (de)serialise an output record: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
