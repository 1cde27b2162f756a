// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The polyphase filter bank.
//!
//! Each station's raw samples are split into `nr_channels` subchannels, each
//! of which is FIR filtered with its own set of weights; a forward FFT across
//! the subchannels then yields the channelised spectrum for one time step.
//! The FFT output is reordered so that channels ascend in frequency, with the
//! subband centre in channel `nr_channels / 2`.
//!
//! After channelisation, the residual (fine) delay of each station is
//! compensated by a phase rotation of each channel.

mod coefficients;
mod error;
mod fir;

pub use coefficients::{prototype_filter, FilterCoefficients, FilterWindow};
pub(crate) use coefficients::FILTER_WINDOWS;
pub use error::FilterBankError;
pub use fir::FirFilter;

use std::sync::Arc;

use log::{debug, trace};
use ndarray::prelude::*;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::{
    block::{BlockError, FilteredData, InputBlock, SubbandMetaData},
    constants::TAU,
    params::{BlockShape, PipelineParams},
    sparse_set::SparseSet,
    Complex32,
};

/// Parsed filter bank settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterParams {
    pub window: FilterWindow,

    /// Only used by the Kaiser window.
    pub kaiser_beta: f64,

    /// An explicit prototype filter, used instead of a generated one.
    pub coefficients: Option<Vec<f32>>,

    /// Apply fine delay compensation after channelisation?
    pub delay_compensation: bool,
}

/// Per-station filter state; it persists across blocks.
struct StationState {
    /// [polarisation][channel]
    firs: Vec<FirFilter>,

    /// FFT input/output for one time step.
    spectrum: Vec<Complex32>,

    fft_scratch: Vec<Complex32>,

    /// The number of leading output times of the next block that are flagged
    /// because of bad input samples near the end of this block.
    flag_carry: usize,
}

/// Everything a station's filtering needs that isn't per-station state.
struct Channeliser<'a> {
    shape: BlockShape,
    /// `None` when there's only one channel; samples then pass straight
    /// through.
    polyphase: Option<(&'a FilterCoefficients, &'a Arc<dyn Fft<f32>>)>,
    channel_frequencies: &'a [f64],
    delay_compensation: bool,
}

pub struct PolyphaseFilterBank {
    shape: BlockShape,
    coefficients: Option<FilterCoefficients>,
    fft: Option<Arc<dyn Fft<f32>>>,
    channel_frequencies: Vec<f64>,
    delay_compensation: bool,
    stations: Vec<StationState>,
}

impl PolyphaseFilterBank {
    pub fn new(params: &PipelineParams) -> Result<PolyphaseFilterBank, FilterBankError> {
        let shape = params.shape;
        let nr_channels = shape.nr_channels;
        if !nr_channels.is_power_of_two() {
            return Err(FilterBankError::ChannelsNotPowerOfTwo(nr_channels));
        }
        if shape.nr_taps == 0 {
            return Err(FilterBankError::NoTaps);
        }

        let (coefficients, fft) = if nr_channels == 1 {
            debug!("Only one channel; the polyphase filter bank is bypassed");
            (None, None)
        } else {
            let coefficients = match params.filter.coefficients.as_deref() {
                Some(prototype) => {
                    FilterCoefficients::from_prototype(nr_channels, shape.nr_taps, prototype)?
                }
                None => FilterCoefficients::generate(
                    nr_channels,
                    shape.nr_taps,
                    params.filter.window,
                    params.filter.kaiser_beta,
                )?,
            };
            let fft = FftPlanner::new().plan_fft_forward(nr_channels);
            (Some(coefficients), Some(fft))
        };

        let fft_scratch_len = fft
            .as_ref()
            .map(|f| f.get_inplace_scratch_len())
            .unwrap_or(0);
        let stations = (0..shape.nr_stations)
            .map(|_| StationState {
                firs: (0..shape.nr_polarizations * nr_channels)
                    .map(|_| FirFilter::new(shape.nr_taps))
                    .collect(),
                spectrum: vec![Complex32::default(); nr_channels],
                fft_scratch: vec![Complex32::default(); fft_scratch_len],
                flag_carry: 0,
            })
            .collect();

        Ok(PolyphaseFilterBank {
            shape,
            coefficients,
            fft,
            channel_frequencies: params.channel_frequencies(),
            delay_compensation: params.filter.delay_compensation,
            stations,
        })
    }

    /// `None` if the filter bank is bypassed.
    pub fn coefficients(&self) -> Option<&FilterCoefficients> {
        self.coefficients.as_ref()
    }

    /// Forget the history of every station, e.g. because the input stream has
    /// a gap. The first `nr_taps - 1` outputs after a reset are flagged, as
    /// they're computed from an incomplete delay line.
    pub fn reset(&mut self) {
        let carry = if self.coefficients.is_some() {
            self.shape.nr_taps - 1
        } else {
            0
        };
        for state in &mut self.stations {
            state.firs.iter_mut().for_each(FirFilter::reset);
            state.flag_carry = carry;
        }
    }

    /// Channelise one block. Stations are filtered in parallel.
    pub fn filter(
        &mut self,
        input: &InputBlock,
        output: &mut FilteredData,
    ) -> Result<(), BlockError> {
        let shape = self.shape;
        let (_, _, nr_input) = input.data.samples().dim();
        if nr_input != shape.nr_input_samples() || input.data.shape() != &shape {
            return Err(BlockError::SampleCount {
                expected: shape.nr_input_samples(),
                got: nr_input,
            });
        }
        if input.metadata.len() != shape.nr_stations {
            return Err(BlockError::MetadataCount {
                expected: shape.nr_stations,
                got: input.metadata.len(),
            });
        }
        trace!("Filtering block {}", input.sequence_number);

        let channeliser = Channeliser {
            shape,
            polyphase: self.coefficients.as_ref().zip(self.fft.as_ref()),
            channel_frequencies: &self.channel_frequencies,
            delay_compensation: self.delay_compensation,
        };
        let input_samples = input.data.samples();
        let mut flags = std::mem::take(&mut output.flags);
        flags.resize_with(shape.nr_stations, SparseSet::new);
        let mut output_samples = output.samples_mut();

        self.stations
            .par_iter_mut()
            .zip(input_samples.axis_iter(Axis(0)))
            .zip(output_samples.axis_iter_mut(Axis(0)))
            .zip(input.metadata.par_iter())
            .zip(flags.par_iter_mut())
            .for_each(|((((state, input), output), metadata), flags)| {
                channeliser.filter_station(state, input, output, metadata, flags)
            });
        output.flags = flags;
        Ok(())
    }
}

impl Channeliser<'_> {
    /// `input` is [polarisation][time], `output` is [channel][time][polarisation].
    /// The flagged output times are written to `flags`.
    fn filter_station(
        &self,
        state: &mut StationState,
        input: ArrayView2<Complex32>,
        mut output: ArrayViewMut3<Complex32>,
        metadata: &SubbandMetaData,
        flags: &mut SparseSet,
    ) {
        let nr_channels = self.shape.nr_channels;
        let half = nr_channels / 2;

        for (pol, pol_input) in input.outer_iter().enumerate() {
            let firs = &mut state.firs[pol * nr_channels..(pol + 1) * nr_channels];
            for (time, raw) in pol_input
                .exact_chunks(nr_channels)
                .into_iter()
                .enumerate()
            {
                match self.polyphase {
                    Some((coefficients, fft)) => {
                        for (channel, ((fir, &sample), out)) in firs
                            .iter_mut()
                            .zip(raw.iter())
                            .zip(state.spectrum.iter_mut())
                            .enumerate()
                        {
                            *out = fir.process_next_sample(sample, coefficients.channel(channel));
                        }
                        fft.process_with_scratch(&mut state.spectrum, &mut state.fft_scratch);
                    }

                    None => state.spectrum[0] = raw[0],
                }

                for (bin, &value) in state.spectrum.iter().enumerate() {
                    let channel = (bin + half) % nr_channels;
                    output[(channel, time, pol)] = value;
                }
            }
        }

        if self.delay_compensation {
            self.compensate_delays(output.view_mut(), metadata);
        }

        self.flagged_outputs(state, metadata, flags);
    }

    /// Rotate each channel by `exp(-2πi f τ(t))`, where `τ` is interpolated
    /// linearly across the block.
    fn compensate_delays(&self, mut output: ArrayViewMut3<Complex32>, metadata: &SubbandMetaData) {
        let begin = metadata.delay_at_begin;
        let end = metadata.delay_after_end;
        if begin == 0.0 && end == 0.0 {
            return;
        }
        let nr_samples = self.shape.nr_samples_per_integration as f64;
        for (mut channel, &freq) in output.outer_iter_mut().zip(self.channel_frequencies) {
            for (time, mut pols) in channel.outer_iter_mut().enumerate() {
                let delay = begin + (end - begin) * time as f64 / nr_samples;
                let (im, re) = (-TAU * freq * delay).sin_cos();
                let phasor = Complex32::new(re as f32, im as f32);
                pols.map_inplace(|s| *s *= phasor);
            }
        }
    }

    /// A bad input sample poisons the output it lands in and the following
    /// `nr_taps - 1` outputs, possibly spilling into the next block.
    fn flagged_outputs(
        &self,
        state: &mut StationState,
        metadata: &SubbandMetaData,
        flags: &mut SparseSet,
    ) {
        let nr_channels = self.shape.nr_channels;
        let nr_samples = self.shape.nr_samples_per_integration;
        let memory = if self.polyphase.is_some() {
            self.shape.nr_taps
        } else {
            1
        };

        let nr_inputs = nr_channels * nr_samples;
        flags.clear();
        flags.include(0..state.flag_carry.min(nr_samples));
        let mut carry = state.flag_carry.saturating_sub(nr_samples);
        for r in metadata.flags.iter() {
            let (start, end) = (r.start, r.end.min(nr_inputs));
            if start >= end {
                break;
            }
            let first = start / nr_channels;
            let last = (end - 1) / nr_channels + memory;
            flags.include(first..last.min(nr_samples));
            carry = carry.max(last.saturating_sub(nr_samples));
        }
        state.flag_carry = carry;
    }
}
