// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Output records and their assembly.
//!
//! Every integration block becomes exactly one [`OutputRecord`]. Blocks can
//! finish correlation out of order (there are several correlator workers),
//! so the [`OutputAssembler`] holds records back until they can be handed to
//! the [`StorageWriter`] in sequence-number order. Sequence numbers that
//! never show up are written as [`BlockStatus::Missing`] records, so the
//! stream handed to storage has no silent gaps.

mod error;
#[cfg(test)]
mod tests;
mod writer;

pub use error::StorageError;
pub use writer::{read_json_lines, JsonLinesWriter, MemoryWriter, StorageWriter};

use std::collections::BTreeMap;

use hifitime::Epoch;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    beamformer::BeamFormedData,
    block::BlockCounters,
    correlator::CorrelatedData,
    flagging::FlagSummary,
    params::{baseline_index, BlockShape},
    Complex32,
};

/// Why a block has (or hasn't) got data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockStatus {
    Valid,

    /// Ingestion never delivered this block.
    Missing,

    /// The block arrived but couldn't be processed.
    Dropped { reason: String },
}

/// One beam's samples of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamRecord {
    /// [channel][time][polarisation]
    pub samples: Vec<Complex32>,

    /// The number of stations summed into each sample, [channel][time].
    pub contributing_stations: Vec<u32>,

    pub flagged_samples: u32,
}

/// Everything the pipeline produced for one integration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub sequence_number: u64,

    /// The start of the block \[GPS seconds\].
    pub gps_time: f64,

    pub status: BlockStatus,

    pub nr_stations: usize,
    pub nr_channels: usize,
    pub nr_polarizations: usize,

    /// Unnormalised sums, [baseline][channel][polarisation][polarisation].
    /// All zero if the block isn't valid.
    pub visibilities: Vec<Complex32>,

    /// The number of contributing samples, [baseline][channel].
    pub weights: Vec<u32>,

    pub flags: FlagSummary,

    /// Empty if no beams were formed.
    pub beams: Vec<BeamRecord>,

    pub counters: BlockCounters,

    /// The number of raw input samples flagged by ingestion, summed over
    /// stations.
    pub input_flagged_samples: u64,
}

impl OutputRecord {
    pub fn new(
        sequence_number: u64,
        timestamp: Epoch,
        correlated: &CorrelatedData,
        flags: FlagSummary,
        beams: Option<&BeamFormedData>,
        counters: BlockCounters,
        input_flagged_samples: u64,
    ) -> OutputRecord {
        let shape = correlated.shape();
        let beams = beams
            .map(|b| {
                b.samples()
                    .outer_iter()
                    .zip(b.contributing_stations().outer_iter())
                    .zip(b.flagged_counts())
                    .map(|((samples, stations), flagged_samples)| BeamRecord {
                        samples: samples.iter().copied().collect(),
                        contributing_stations: stations.iter().copied().collect(),
                        flagged_samples,
                    })
                    .collect()
            })
            .unwrap_or_default();
        OutputRecord {
            sequence_number,
            gps_time: timestamp.to_gpst_seconds(),
            status: BlockStatus::Valid,
            nr_stations: shape.nr_stations,
            nr_channels: shape.nr_channels,
            nr_polarizations: shape.nr_polarizations,
            visibilities: correlated.visibilities().iter().copied().collect(),
            weights: correlated.weights().iter().copied().collect(),
            flags,
            beams,
            counters,
            input_flagged_samples,
        }
    }

    /// A record without data; every weight is zero and everything is
    /// flagged.
    pub fn invalid(
        sequence_number: u64,
        timestamp: Epoch,
        shape: &BlockShape,
        nr_beams: usize,
        status: BlockStatus,
    ) -> OutputRecord {
        let (b, c, p1, p2) = shape.visibility_dim();
        let (_, c_, t, p) = shape.beam_dim(nr_beams);
        OutputRecord {
            sequence_number,
            gps_time: timestamp.to_gpst_seconds(),
            status,
            nr_stations: shape.nr_stations,
            nr_channels: shape.nr_channels,
            nr_polarizations: shape.nr_polarizations,
            visibilities: vec![Complex32::default(); b * c * p1 * p2],
            weights: vec![0; b * c],
            flags: FlagSummary::everything_excluded(shape),
            beams: (0..nr_beams)
                .map(|_| BeamRecord {
                    samples: vec![Complex32::default(); c_ * t * p],
                    contributing_stations: vec![0; c_ * t],
                    flagged_samples: (c_ * t) as u32,
                })
                .collect(),
            counters: BlockCounters::default(),
            input_flagged_samples: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == BlockStatus::Valid
    }

    pub fn timestamp(&self) -> Epoch {
        Epoch::from_gpst_seconds(self.gps_time)
    }

    fn visibility_index(&self, s1: usize, s2: usize, channel: usize) -> usize {
        let p = self.nr_polarizations;
        (baseline_index(s1, s2) * self.nr_channels + channel) * p * p
    }

    /// The unnormalised sum of a station pair, channel and polarisation pair.
    /// `s1` must not be bigger than `s2`.
    pub fn visibility(&self, s1: usize, s2: usize, channel: usize, p1: usize, p2: usize) -> Complex32 {
        self.visibilities[self.visibility_index(s1, s2, channel) + p1 * self.nr_polarizations + p2]
    }

    pub fn weight(&self, s1: usize, s2: usize, channel: usize) -> u32 {
        self.weights[baseline_index(s1, s2) * self.nr_channels + channel]
    }

    /// `None` if no samples contributed.
    pub fn normalised_visibility(
        &self,
        s1: usize,
        s2: usize,
        channel: usize,
        p1: usize,
        p2: usize,
    ) -> Option<Complex32> {
        match self.weight(s1, s2, channel) {
            0 => None,
            w => Some(self.visibility(s1, s2, channel, p1, p2) / w as f32),
        }
    }
}

/// What was handed to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub written: u64,
    pub valid: u64,
    pub missing: u64,
    pub dropped: u64,
    /// Records that arrived after their sequence number had been written.
    pub discarded: u64,
}

/// Puts records back in sequence-number order before writing them.
pub struct OutputAssembler<'a, W: StorageWriter + ?Sized> {
    writer: &'a mut W,
    shape: BlockShape,
    nr_beams: usize,
    next: u64,
    pending: BTreeMap<u64, OutputRecord>,
    /// If more records than this are waiting, the record holding everything
    /// up is declared missing.
    max_pending: usize,
    stats: AssemblyStats,
}

impl<'a, W: StorageWriter + ?Sized> OutputAssembler<'a, W> {
    pub fn new(
        writer: &'a mut W,
        shape: BlockShape,
        nr_beams: usize,
        first_sequence_number: u64,
        max_pending: usize,
    ) -> OutputAssembler<'a, W> {
        OutputAssembler {
            writer,
            shape,
            nr_beams,
            next: first_sequence_number,
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
            stats: AssemblyStats::default(),
        }
    }

    /// The sequence number that will be written next.
    pub fn next_sequence_number(&self) -> u64 {
        self.next
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, record: OutputRecord) -> Result<(), StorageError> {
        let seq = record.sequence_number;
        if seq < self.next || self.pending.contains_key(&seq) {
            warn!("Output record {seq} arrived too late or twice; it is discarded");
            self.stats.discarded += 1;
            return Ok(());
        }
        self.pending.insert(seq, record);
        self.write_ready()?;

        while self.pending.len() > self.max_pending {
            self.write_missing()?;
            self.write_ready()?;
        }
        Ok(())
    }

    /// Write everything still pending, filling gaps, and then missing records
    /// up to (but not including) `end`, if given. Finishes the writer.
    pub fn finish(mut self, end: Option<u64>) -> Result<AssemblyStats, StorageError> {
        while !self.pending.is_empty() {
            self.write_missing()?;
            self.write_ready()?;
        }
        if let Some(end) = end {
            while self.next < end {
                self.write_missing()?;
            }
        }
        self.writer.finish()?;
        Ok(self.stats)
    }

    fn write_ready(&mut self) -> Result<(), StorageError> {
        while let Some(record) = self.pending.remove(&self.next) {
            self.write(record)?;
        }
        Ok(())
    }

    /// Write a missing record for the next sequence number, if it isn't
    /// already waiting.
    fn write_missing(&mut self) -> Result<(), StorageError> {
        if self.pending.contains_key(&self.next) {
            return Ok(());
        }
        debug!("Block {} never arrived", self.next);
        // The timestamp of a block that never arrived isn't known; use the
        // next known one.
        let timestamp = self
            .pending
            .values()
            .next()
            .map(|r| r.timestamp())
            .unwrap_or_else(|| Epoch::from_gpst_seconds(0.0));
        let record = OutputRecord::invalid(
            self.next,
            timestamp,
            &self.shape,
            self.nr_beams,
            BlockStatus::Missing,
        );
        self.write(record)
    }

    fn write(&mut self, record: OutputRecord) -> Result<(), StorageError> {
        self.writer.write(&record)?;
        match record.status {
            BlockStatus::Valid => self.stats.valid += 1,
            BlockStatus::Missing => self.stats.missing += 1,
            BlockStatus::Dropped { .. } => self.stats.dropped += 1,
        }
        self.stats.written += 1;
        self.next = record.sequence_number + 1;
        Ok(())
    }
}
