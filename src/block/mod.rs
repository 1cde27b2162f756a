// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The data that travels through the pipeline, one integration block at a
//! time.
//!
//! Every multi-dimensional container here is a thin wrapper around an
//! [`ArenaBuffer`] and a [`BlockShape`]; views are bounds-checked ndarray
//! views over the arena memory. Each container is owned by exactly one stage
//! at a time and moves between stages through queues.

mod error;
mod sample_buffer;

pub use error::BlockError;
pub use sample_buffer::SampleBuffer;

use std::str::FromStr;

use hifitime::Epoch;
use itertools::Itertools;
use ndarray::prelude::*;
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    arena::{buffer_footprint, Arena, ArenaBuffer, ArenaError},
    params::BlockShape,
    sparse_set::SparseSet,
    Complex32,
};

lazy_static::lazy_static! {
    pub(crate) static ref SAMPLE_FORMATS: String = SampleFormat::iter().join(", ");
}

/// The formats in which station data can be delivered.
#[derive(Debug, Display, Clone, Copy, EnumIter, EnumString, PartialEq, Eq)]
pub enum SampleFormat {
    /// 16-bit signed integer real and imaginary parts.
    #[strum(serialize = "i16")]
    I16,

    /// 8-bit signed integer real and imaginary parts.
    #[strum(serialize = "i8")]
    I8,

    /// Single-precision float real and imaginary parts.
    #[strum(serialize = "f32")]
    F32,
}

impl SampleFormat {
    pub fn parse(value: &str) -> Option<SampleFormat> {
        SampleFormat::from_str(&value.to_lowercase()).ok()
    }

    pub fn bits_per_component(self) -> u32 {
        match self {
            SampleFormat::I16 => 16,
            SampleFormat::I8 => 8,
            SampleFormat::F32 => 32,
        }
    }

    /// The largest magnitude of a sample component, or `None` for
    /// floating-point samples.
    pub fn max_amplitude(self) -> Option<f32> {
        match self {
            SampleFormat::I16 => Some(f32::from(i16::MAX)),
            SampleFormat::I8 => Some(f32::from(i8::MAX)),
            SampleFormat::F32 => None,
        }
    }
}

/// A raw station sample that can be widened to single-precision complex.
pub trait IntoSample: Copy {
    fn into_sample(self) -> Complex32;
}

impl IntoSample for Complex<i16> {
    fn into_sample(self) -> Complex32 {
        Complex32::new(f32::from(self.re), f32::from(self.im))
    }
}

impl IntoSample for Complex<i8> {
    fn into_sample(self) -> Complex32 {
        Complex32::new(f32::from(self.re), f32::from(self.im))
    }
}

impl IntoSample for Complex32 {
    fn into_sample(self) -> Complex32 {
        self
    }
}

/// Per-station information accompanying a block of samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubbandMetaData {
    /// The integer-sample delay already applied by ingestion when it selected
    /// this block's samples.
    pub coarse_delay: i64,

    /// The residual (fine) delay at the start of the block \[s\].
    pub delay_at_begin: f64,

    /// The residual (fine) delay just after the end of the block \[s\].
    pub delay_after_end: f64,

    /// Raw sample indices that are invalid, e.g. because their packets never
    /// arrived.
    pub flags: SparseSet,
}

/// Diagnostic counters reported by ingestion for a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCounters {
    pub packets_received: u64,
    pub packets_rejected: u64,
}

/// Raw station samples of one block, [station][polarisation][time].
#[derive(Debug)]
pub struct TransposedData {
    samples: ArenaBuffer<Complex32>,
    shape: BlockShape,
}

impl TransposedData {
    pub fn new(arena: &Arena, shape: BlockShape) -> Result<TransposedData, ArenaError> {
        let (s, p, t) = shape.input_dim();
        Ok(TransposedData {
            samples: arena.allocate_zeroed(s * p * t)?,
            shape,
        })
    }

    pub fn shape(&self) -> &BlockShape {
        &self.shape
    }

    pub fn samples(&self) -> ArrayView3<Complex32> {
        self.samples
            .view(self.shape.input_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    pub fn samples_mut(&mut self) -> ArrayViewMut3<Complex32> {
        self.samples
            .view_mut(self.shape.input_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    /// Widen and copy one station's polarisation into the block.
    pub fn write_station<S: IntoSample>(
        &mut self,
        station: usize,
        polarization: usize,
        samples: &[S],
    ) -> Result<(), BlockError> {
        let shape = self.shape;
        if station >= shape.nr_stations || polarization >= shape.nr_polarizations {
            return Err(BlockError::OutOfRange {
                station,
                polarization,
            });
        }
        if samples.len() != shape.nr_input_samples() {
            return Err(BlockError::SampleCount {
                expected: shape.nr_input_samples(),
                got: samples.len(),
            });
        }
        let mut all = self.samples_mut();
        let mut dest = all.slice_mut(s![station, polarization, ..]);
        for (d, s) in dest.iter_mut().zip(samples) {
            *d = s.into_sample();
        }
        Ok(())
    }
}

/// Everything ingestion delivers for one integration block.
#[derive(Debug)]
pub struct InputBlock {
    pub sequence_number: u64,
    pub timestamp: Epoch,
    pub data: TransposedData,
    /// One entry per station.
    pub metadata: Vec<SubbandMetaData>,
    pub counters: BlockCounters,
}

/// Channelised samples of one block, [station][channel][time][polarisation],
/// and the per-station channelised times made invalid by bad input samples.
pub struct FilteredData {
    samples: ArenaBuffer<Complex32>,
    shape: BlockShape,
    /// One set of flagged output time indices per station.
    pub flags: Vec<SparseSet>,
}

impl FilteredData {
    pub fn new(arena: &Arena, shape: BlockShape) -> Result<FilteredData, ArenaError> {
        let (s, c, t, p) = shape.filtered_dim();
        Ok(FilteredData {
            samples: arena.allocate_zeroed(s * c * t * p)?,
            shape,
            flags: vec![SparseSet::new(); shape.nr_stations],
        })
    }

    pub fn shape(&self) -> &BlockShape {
        &self.shape
    }

    pub fn samples(&self) -> ArrayView4<Complex32> {
        self.samples
            .view(self.shape.filtered_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    pub fn samples_mut(&mut self) -> ArrayViewMut4<Complex32> {
        self.samples
            .view_mut(self.shape.filtered_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }
}

/// One boolean per station, channel and time; `true` means that the sample
/// must not contribute to correlation or beamforming. Stored as bytes so that
/// it can live in the arena.
pub struct FlagMask {
    flags: ArenaBuffer<u8>,
    shape: BlockShape,
}

impl FlagMask {
    /// A mask with nothing flagged.
    pub fn new(arena: &Arena, shape: BlockShape) -> Result<FlagMask, ArenaError> {
        let (s, c, t) = shape.mask_dim();
        Ok(FlagMask {
            flags: arena.allocate_zeroed(s * c * t)?,
            shape,
        })
    }

    pub(crate) fn footprint(shape: &BlockShape) -> usize {
        let (s, c, t) = shape.mask_dim();
        buffer_footprint::<u8>(s * c * t)
    }

    /// [station][channel][time]; non-zero means flagged.
    pub fn view(&self) -> ArrayView3<u8> {
        self.flags
            .view(self.shape.mask_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    pub fn view_mut(&mut self) -> ArrayViewMut3<u8> {
        self.flags
            .view_mut(self.shape.mask_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    pub fn is_flagged(&self, station: usize, channel: usize, time: usize) -> bool {
        self.view()[(station, channel, time)] != 0
    }

    /// Flag a range of times on every channel of a station.
    pub fn flag_times(&mut self, station: usize, times: std::ops::Range<usize>) {
        self.view_mut()
            .slice_mut(s![station, .., times])
            .fill(1);
    }

    pub fn count_flagged(&self) -> usize {
        self.flags.iter().filter(|&&f| f != 0).count()
    }
}
