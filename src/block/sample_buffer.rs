// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The hand-off point between station-data ingestion and the pipeline.

use hifitime::Epoch;
use log::trace;

use super::{BlockCounters, InputBlock, SubbandMetaData, TransposedData};
use crate::{
    arena::{Arena, ArenaError},
    params::BlockShape,
    queue::{Producer, QueueClosed},
};

/// Ingestion fills blocks obtained from a `SampleBuffer` and submits them in
/// sequence-number order. Blocks are carved from the pipeline's arena, and
/// submitting blocks when the pipeline's input queue is full stalls until
/// the filter stage catches up.
///
/// Dropping the `SampleBuffer` signals the end of the stream.
pub struct SampleBuffer {
    arena: Arena,
    shape: BlockShape,
    queue: Producer<InputBlock>,
}

impl SampleBuffer {
    pub(crate) fn new(arena: Arena, shape: BlockShape, queue: Producer<InputBlock>) -> SampleBuffer {
        SampleBuffer {
            arena,
            shape,
            queue,
        }
    }

    pub fn shape(&self) -> &BlockShape {
        &self.shape
    }

    /// Get an empty (zeroed, unflagged) block to fill. If the arena is
    /// exhausted, ingestion should skip this block; the pipeline reports it as
    /// missing.
    pub fn allocate_block(
        &self,
        sequence_number: u64,
        timestamp: Epoch,
    ) -> Result<InputBlock, ArenaError> {
        Ok(InputBlock {
            sequence_number,
            timestamp,
            data: TransposedData::new(&self.arena, self.shape)?,
            metadata: vec![SubbandMetaData::default(); self.shape.nr_stations],
            counters: BlockCounters::default(),
        })
    }

    /// Hand a filled block to the pipeline. Blocks while the input queue is
    /// full.
    pub fn submit(&self, block: InputBlock) -> Result<(), QueueClosed<InputBlock>> {
        trace!("Submitting block {}", block.sequence_number);
        self.queue.append(block)
    }
}
