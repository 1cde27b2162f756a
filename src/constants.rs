// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Useful constants.

Defaults here are used when a configuration file doesn't specify a value. The
phase and delay arithmetic is done in double precision; only sample data is
kept in single precision.
 */

pub use std::f64::consts::{PI, TAU};

/// Speed of light in a vacuum \[m/s\].
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// The default number of stations.
pub const DEFAULT_NR_STATIONS: usize = 2;

/// The default number of polarisations per station.
pub const DEFAULT_NR_POLARIZATIONS: usize = 2;

/// The default number of channels each subband is split into by the polyphase
/// filter bank.
pub const DEFAULT_NR_CHANNELS: usize = 64;

/// The default number of FIR taps per channel.
pub const DEFAULT_NR_TAPS: usize = 16;

/// The default number of (channelised) samples per integration period.
pub const DEFAULT_NR_SAMPLES_PER_INTEGRATION: usize = 768;

/// The default subband centre frequency \[Hz\].
pub const DEFAULT_SUBBAND_FREQUENCY: f64 = 150e6;

/// The default subband bandwidth \[Hz\]; this is the 200 MHz clock's subband
/// width.
pub const DEFAULT_SUBBAND_BANDWIDTH: f64 = 195_312.5;

/// The Kaiser window beta used for the prototype low-pass filter.
pub const DEFAULT_KAISER_BETA: f64 = 9.0695;

/// The default RFI flagger cutoff, in multiples of the baseline power
/// estimate.
pub const DEFAULT_FLAGGER_CUTOFF: f64 = 7.0;

/// If more than this fraction of a station (or a station's channel) is
/// flagged during an integration period, the whole station (or channel) is
/// excluded from that period's output.
pub const DEFAULT_MAX_FLAGGED_FRACTION: f64 = 0.9;

/// The default number of samples integrated together by the integrated
/// threshold flagger.
pub const DEFAULT_INTEGRATION_WINDOW: usize = 16;

/// The largest window (in samples) considered by the sum-threshold flagger.
pub const DEFAULT_MAX_SUM_THRESHOLD_WINDOW: usize = 64;

/// Each doubling of the sum-threshold window reduces the per-sample threshold
/// by this factor.
pub const SUM_THRESHOLD_DECAY: f64 = 1.5;

/// The default fraction trimmed from each end when using a winsorized mean.
pub const DEFAULT_WINSORIZE_FRACTION: f64 = 0.1;

/// The default minimum number of contributing stations for a beam sample to be
/// considered valid.
pub const DEFAULT_MIN_BEAM_STATIONS: usize = 1;

/// The default capacity of each bounded queue between pipeline stages.
pub const DEFAULT_QUEUE_DEPTH: usize = 3;

/// The default number of correlator worker threads.
pub const DEFAULT_NR_CORRELATOR_WORKERS: usize = 2;

/// All arena allocations for sample data use this alignment \[bytes\].
pub const BUFFER_ALIGNMENT: usize = 64;

/// The most output records held back waiting for an earlier record before that
/// earlier record is written as missing.
pub const MAX_PENDING_OUTPUT_RECORDS: usize = 1024;
