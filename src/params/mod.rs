// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parameters of a pipeline run.
//!
//! The code here mirrors the `config` module; `config` is unparsed,
//! user-facing code, whereas these parameters have been validated and are
//! ready to be used directly. They are immutable once a pipeline has been
//! constructed.


use hifitime::Duration;

use crate::{
    arena::buffer_footprint,
    beamformer::BeamformerParams,
    block::{FlagMask, SampleFormat},
    filter_bank::FilterParams,
    flagging::FlaggerParams,
    Complex32,
};

/// The fixed array dimensions of every integration block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockShape {
    pub nr_stations: usize,
    pub nr_polarizations: usize,
    /// The number of channels each subband is split into.
    pub nr_channels: usize,
    /// The number of FIR taps per channel.
    pub nr_taps: usize,
    /// The number of channelised samples in an integration period.
    pub nr_samples_per_integration: usize,
}

impl BlockShape {
    /// The number of raw (un-channelised) samples per station and polarisation
    /// in a block.
    pub fn nr_input_samples(&self) -> usize {
        self.nr_channels * self.nr_samples_per_integration
    }

    /// The number of station pairs, including auto-correlations.
    pub fn nr_baselines(&self) -> usize {
        nr_baselines(self.nr_stations)
    }

    /// [station][polarisation][time]
    pub fn input_dim(&self) -> (usize, usize, usize) {
        (
            self.nr_stations,
            self.nr_polarizations,
            self.nr_input_samples(),
        )
    }

    /// [station][channel][time][polarisation]
    pub fn filtered_dim(&self) -> (usize, usize, usize, usize) {
        (
            self.nr_stations,
            self.nr_channels,
            self.nr_samples_per_integration,
            self.nr_polarizations,
        )
    }

    /// [station][channel][time]
    pub fn mask_dim(&self) -> (usize, usize, usize) {
        (
            self.nr_stations,
            self.nr_channels,
            self.nr_samples_per_integration,
        )
    }

    /// [baseline][channel][polarisation][polarisation]
    pub fn visibility_dim(&self) -> (usize, usize, usize, usize) {
        (
            self.nr_baselines(),
            self.nr_channels,
            self.nr_polarizations,
            self.nr_polarizations,
        )
    }

    /// [baseline][channel]
    pub fn weight_dim(&self) -> (usize, usize) {
        (self.nr_baselines(), self.nr_channels)
    }

    /// [beam][channel][time][polarisation]
    pub fn beam_dim(&self, nr_beams: usize) -> (usize, usize, usize, usize) {
        (
            nr_beams,
            self.nr_channels,
            self.nr_samples_per_integration,
            self.nr_polarizations,
        )
    }
}

/// The number of station pairs (s1, s2) with s1 <= s2.
pub fn nr_baselines(nr_stations: usize) -> usize {
    nr_stations * (nr_stations + 1) / 2
}

/// The index of the (s1, s2) baseline. Baselines are ordered by the second
/// station, i.e. (0,0), (0,1), (1,1), (0,2), (1,2), (2,2), ...
///
/// `s1` must not be bigger than `s2`.
pub fn baseline_index(s1: usize, s2: usize) -> usize {
    debug_assert!(s1 <= s2);
    s2 * (s2 + 1) / 2 + s1
}

/// The inverse of [`baseline_index`].
pub fn baseline_to_stations(baseline: usize) -> (usize, usize) {
    // s2 is the largest integer with s2 * (s2 + 1) / 2 <= baseline.
    let mut s2 = ((((8 * baseline + 1) as f64).sqrt() - 1.0) / 2.0) as usize;
    // Guard against floating-point rounding either way.
    while s2 * (s2 + 1) / 2 > baseline {
        s2 -= 1;
    }
    while (s2 + 1) * (s2 + 2) / 2 <= baseline {
        s2 += 1;
    }
    (baseline - s2 * (s2 + 1) / 2, s2)
}

#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub shape: BlockShape,

    /// The centre frequency of the subband being processed \[Hz\].
    pub subband_frequency: f64,

    /// The bandwidth of the subband \[Hz\].
    pub subband_bandwidth: f64,

    /// The sample format delivered by station-data ingestion.
    pub sample_format: SampleFormat,

    pub filter: FilterParams,

    /// `None` if RFI flagging is disabled.
    pub flagger: Option<FlaggerParams>,

    /// `None` if no beams are to be formed.
    pub beamformer: Option<BeamformerParams>,

    /// The capacity of each queue between pipeline stages.
    pub queue_depth: usize,

    /// The number of threads correlating (and beamforming) blocks.
    pub nr_correlator_workers: usize,

    /// The size of the arena that holds every block buffer \[bytes\].
    pub arena_size: usize,

    /// The sequence number of the first integration block.
    pub first_sequence_number: u64,
}

impl PipelineParams {
    /// The width of each channel \[Hz\].
    pub fn channel_bandwidth(&self) -> f64 {
        self.subband_bandwidth / self.shape.nr_channels as f64
    }

    /// The centre frequency of each channel \[Hz\], ascending. The middle
    /// channel is centred on the subband frequency.
    pub fn channel_frequencies(&self) -> Vec<f64> {
        channel_frequencies(
            self.subband_frequency,
            self.subband_bandwidth,
            self.shape.nr_channels,
        )
    }

    pub fn nr_beams(&self) -> usize {
        self.beamformer.as_ref().map(|b| b.beams.len()).unwrap_or(0)
    }

    /// The time spanned by one block of raw samples.
    pub fn block_duration(&self) -> Duration {
        Duration::from_seconds(self.shape.nr_input_samples() as f64 / self.subband_bandwidth)
    }
}

/// The centre frequency of each channel of a subband \[Hz\].
pub fn channel_frequencies(
    subband_frequency: f64,
    subband_bandwidth: f64,
    nr_channels: usize,
) -> Vec<f64> {
    if nr_channels == 1 {
        return vec![subband_frequency];
    }
    let channel_bandwidth = subband_bandwidth / nr_channels as f64;
    let half = (nr_channels / 2) as f64;
    (0..nr_channels)
        .map(|ch| subband_frequency + (ch as f64 - half) * channel_bandwidth)
        .collect()
}

/// The arena bytes needed by every buffer belonging to one block as it passes
/// through the pipeline.
pub fn block_footprint(shape: &BlockShape, nr_beams: usize) -> usize {
    let (s, p, t) = shape.input_dim();
    let input = buffer_footprint::<Complex32>(s * p * t);
    let filtered = buffer_footprint::<Complex32>(s * p * t);
    let mask = FlagMask::footprint(shape);
    let (b, c, t, p) = shape.beam_dim(nr_beams);
    let beams = if nr_beams > 0 {
        buffer_footprint::<Complex32>(b * c * t * p)
            + buffer_footprint::<u8>(b * c * t)
            + buffer_footprint::<u32>(b * c * t)
    } else {
        0
    };
    let (bl, c, p1, p2) = shape.visibility_dim();
    let correlated =
        buffer_footprint::<Complex32>(bl * c * p1 * p2) + buffer_footprint::<u32>(bl * c);
    input + filtered + mask + beams + correlated
}

/// An upper bound on the number of blocks that can be alive at once: one in
/// each queue slot, one in each stage, plus those waiting to be put back in
/// order before writing.
pub fn max_blocks_in_flight(queue_depth: usize, nr_correlator_workers: usize) -> usize {
    4 * queue_depth + 2 * nr_correlator_workers + 4
}

#[cfg(test)]
impl PipelineParams {
    /// Parameters with flagging and beamforming disabled and an arena large
    /// enough for the default queue layout.
    pub(crate) fn for_testing(shape: BlockShape) -> PipelineParams {
        use crate::{constants::*, filter_bank::FilterWindow};

        PipelineParams {
            shape,
            subband_frequency: DEFAULT_SUBBAND_FREQUENCY,
            subband_bandwidth: DEFAULT_SUBBAND_BANDWIDTH,
            sample_format: SampleFormat::F32,
            filter: FilterParams {
                window: FilterWindow::Kaiser,
                kaiser_beta: DEFAULT_KAISER_BETA,
                coefficients: None,
                delay_compensation: true,
            },
            flagger: None,
            beamformer: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            nr_correlator_workers: DEFAULT_NR_CORRELATOR_WORKERS,
            arena_size: block_footprint(&shape, 0)
                * max_blocks_in_flight(DEFAULT_QUEUE_DEPTH, DEFAULT_NR_CORRELATOR_WORKERS),
            first_sequence_number: 0,
        }
    }
}
