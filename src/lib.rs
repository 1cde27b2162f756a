// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
A real-time correlator core for station data.

Blocks of raw complex samples flow through a polyphase filter bank, an RFI
flagger, an optional beamformer and a correlator, and come out as one output
record per integration period. All sample memory is carved from a fixed
arena, and every stage is connected to the next by a bounded queue, so a slow
stage stalls ingestion instead of growing memory.
 */

pub mod arena;
pub mod beamformer;
pub mod block;
mod cli;
pub mod config;
pub mod constants;
pub mod correlator;
pub mod filter_bank;
pub mod flagging;
pub mod output;
pub mod params;
pub mod pipeline;
pub mod queue;
pub mod simulate;
pub mod sparse_set;

// Re-exports.
pub use cli::{Correlator, CorrelatorError};
pub use config::CorrelatorConfig;
pub use num_complex::Complex32;
pub use output::{JsonLinesWriter, OutputRecord, StorageWriter};
pub use params::PipelineParams;
pub use pipeline::{Pipeline, RunSummary};

use crossbeam_utils::atomic::AtomicCell;

lazy_static::lazy_static! {
    /// Are progress bars being drawn? This should only ever be enabled by CLI
    /// code.
    static ref PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);
}
