// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use thiserror::Error;

use crate::{
    block::SAMPLE_FORMATS,
    filter_bank::FILTER_WINDOWS,
    flagging::{BASELINE_ESTIMATORS, FLAGGER_STRATEGIES, FLAG_POLICIES},
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file {0:?} doesn't have a recognised file extension! Valid extensions are: {}", *super::CONFIG_FILE_TYPES)]
    UnknownFileType(PathBuf),

    #[error("Couldn't decode toml structure from {file:?}:\n{err}")]
    Toml { file: PathBuf, err: toml::de::Error },

    #[error("Couldn't decode json structure from {file:?}:\n{err}")]
    Json {
        file: PathBuf,
        err: serde_json::Error,
    },

    #[error("'{0}' must be at least 1")]
    Zero(&'static str),

    #[error("The number of channels ({0}) must be a power of two")]
    ChannelsNotPowerOfTwo(usize),

    #[error("'{name}' must be a positive, finite number, but got {value}")]
    NotPositive { name: &'static str, value: f64 },

    #[error("'{name}' must be between {min} and {max}, but got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Unrecognised sample format '{0}'; supported formats: {}", *SAMPLE_FORMATS)]
    SampleFormat(String),

    #[error("Unrecognised filter window '{0}'; supported windows: {}", *FILTER_WINDOWS)]
    FilterWindow(String),

    #[error("The filter coefficient table has {got} entries, but {expected} (channels x taps) are needed")]
    CoefficientCount { expected: usize, got: usize },

    #[error("Unrecognised flagger strategy '{0}'; supported strategies: {}", *FLAGGER_STRATEGIES)]
    FlaggerStrategy(String),

    #[error("Unrecognised baseline estimator '{0}'; supported estimators: {}", *BASELINE_ESTIMATORS)]
    BaselineEstimator(String),

    #[error("Unrecognised flag policy '{0}'; supported policies: {}", *FLAG_POLICIES)]
    FlagPolicy(String),

    #[error("The flagger cutoff can't be NaN")]
    NanCutoff,

    #[error("Beam {beam} has {got} delays, but there are {expected} stations")]
    BeamDelayCount {
        beam: usize,
        expected: usize,
        got: usize,
    },

    #[error("Beam {0} needs either per-station delays or an azimuth and elevation")]
    BeamUnspecified(usize),

    #[error("Beam {0} is given by a pointing, but no station positions were supplied")]
    NoStationPositions(usize),

    #[error("{got} station positions were supplied, but there are {expected} stations")]
    StationPositionCount { expected: usize, got: usize },

    #[error("The arena ({available} bytes) can't hold even one block, which needs {needed} bytes")]
    ArenaTooSmall { needed: usize, available: usize },

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
