// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! User-facing configuration.
//!
//! Everything here is optional so that a config file only needs to mention
//! what differs from the defaults in [`crate::constants`]. A config is read
//! once, validated into [`PipelineParams`], and never looked at again.

mod error;

pub use error::ConfigError;

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    str::FromStr,
};

use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    beamformer::{Beam, BeamformerParams, StationPosition},
    block::SampleFormat,
    constants::*,
    filter_bank::{FilterParams, FilterWindow},
    flagging::{BaselineEstimator, FlagPolicy, FlaggerParams, FlaggerStrategy},
    params::{block_footprint, max_blocks_in_flight, BlockShape, PipelineParams},
};

lazy_static::lazy_static! {
    pub(crate) static ref CONFIG_FILE_TYPES: String = ConfigFileType::iter().join(", ");
}

#[derive(Debug, Display, EnumIter, EnumString)]
enum ConfigFileType {
    #[strum(serialize = "toml")]
    Toml,

    #[strum(serialize = "json")]
    Json,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    pub nr_stations: Option<usize>,
    pub nr_polarizations: Option<usize>,
    pub nr_channels: Option<usize>,
    pub nr_taps: Option<usize>,
    pub nr_samples_per_integration: Option<usize>,

    /// \[Hz\]
    pub subband_frequency: Option<f64>,

    /// \[Hz\]
    pub subband_bandwidth: Option<f64>,

    pub sample_format: Option<String>,

    pub queue_depth: Option<usize>,
    pub nr_correlator_workers: Option<usize>,

    /// \[bytes\] If not given, the arena is sized to hold every block that can
    /// be in flight at once.
    pub arena_size: Option<usize>,

    pub first_sequence_number: Option<u64>,

    pub filter: Option<FilterConfig>,

    /// RFI flagging is only done if this section is present.
    pub flagger: Option<FlaggerConfig>,

    /// Beams are only formed if this section is present.
    pub beamformer: Option<BeamformerConfig>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub window: Option<String>,
    pub kaiser_beta: Option<f64>,

    /// An explicit prototype filter of `nr_channels * nr_taps` values.
    pub coefficients: Option<Vec<f32>>,

    pub delay_compensation: Option<bool>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggerConfig {
    pub strategy: Option<String>,
    pub estimator: Option<String>,
    pub winsorize_fraction: Option<f64>,
    pub cutoff: Option<f64>,
    pub policy: Option<String>,
    pub max_flagged_fraction: Option<f64>,
    pub integration_window: Option<usize>,
    pub max_sum_threshold_window: Option<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamformerConfig {
    pub min_stations: Option<usize>,

    /// Needed by beams given as a pointing.
    pub station_positions: Option<Vec<StationPosition>>,

    #[serde(default)]
    pub beams: Vec<BeamConfig>,
}

/// Either `delays` or both `azimuth` and `elevation`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamConfig {
    /// One per station \[s\].
    pub delays: Option<Vec<f64>>,

    /// East of north \[degrees\].
    pub azimuth: Option<f64>,

    /// \[degrees\]
    pub elevation: Option<f64>,
}

fn at_least_one(name: &'static str, value: Option<usize>, default: usize) -> Result<usize, ConfigError> {
    match value.unwrap_or(default) {
        0 => Err(ConfigError::Zero(name)),
        v => Ok(v),
    }
}

fn positive(name: &'static str, value: Option<f64>, default: f64) -> Result<f64, ConfigError> {
    let value = value.unwrap_or(default);
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::NotPositive { name, value })
    }
}

fn in_range(
    name: &'static str,
    value: Option<f64>,
    default: f64,
    min: f64,
    max: f64,
) -> Result<f64, ConfigError> {
    let value = value.unwrap_or(default);
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

impl CorrelatorConfig {
    /// Read a config from a toml or json file, depending on its extension.
    pub fn read<P: AsRef<Path>>(file: P) -> Result<CorrelatorConfig, ConfigError> {
        let file = file.as_ref();
        debug!("Attempting to parse config file {}", file.display());
        let file_type = file
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .and_then(|e| ConfigFileType::from_str(&e).ok())
            .ok_or_else(|| ConfigError::UnknownFileType(file.to_path_buf()))?;

        let mut contents = String::new();
        File::open(file)?.read_to_string(&mut contents)?;
        let to_path = || PathBuf::from(file);
        match file_type {
            ConfigFileType::Toml => toml::from_str(&contents).map_err(|err| ConfigError::Toml {
                file: to_path(),
                err,
            }),
            ConfigFileType::Json => {
                serde_json::from_str(&contents).map_err(|err| ConfigError::Json {
                    file: to_path(),
                    err,
                })
            }
        }
    }

    /// Check everything and fill in defaults.
    pub fn validate(&self) -> Result<PipelineParams, ConfigError> {
        let nr_channels = at_least_one("nr_channels", self.nr_channels, DEFAULT_NR_CHANNELS)?;
        if !nr_channels.is_power_of_two() {
            return Err(ConfigError::ChannelsNotPowerOfTwo(nr_channels));
        }
        let shape = BlockShape {
            nr_stations: at_least_one("nr_stations", self.nr_stations, DEFAULT_NR_STATIONS)?,
            nr_polarizations: at_least_one(
                "nr_polarizations",
                self.nr_polarizations,
                DEFAULT_NR_POLARIZATIONS,
            )?,
            nr_channels,
            nr_taps: at_least_one("nr_taps", self.nr_taps, DEFAULT_NR_TAPS)?,
            nr_samples_per_integration: at_least_one(
                "nr_samples_per_integration",
                self.nr_samples_per_integration,
                DEFAULT_NR_SAMPLES_PER_INTEGRATION,
            )?,
        };
        let subband_frequency = positive(
            "subband_frequency",
            self.subband_frequency,
            DEFAULT_SUBBAND_FREQUENCY,
        )?;
        let subband_bandwidth = positive(
            "subband_bandwidth",
            self.subband_bandwidth,
            DEFAULT_SUBBAND_BANDWIDTH,
        )?;
        let sample_format = match self.sample_format.as_deref() {
            None => SampleFormat::I16,
            Some(s) => SampleFormat::parse(s).ok_or_else(|| ConfigError::SampleFormat(s.to_string()))?,
        };

        let filter = validate_filter(self.filter.as_ref().unwrap_or(&FilterConfig::default()), &shape)?;
        let flagger = self.flagger.as_ref().map(validate_flagger).transpose()?;
        let beamformer = self
            .beamformer
            .as_ref()
            .map(|b| validate_beamformer(b, &shape))
            .transpose()?;

        let queue_depth = at_least_one("queue_depth", self.queue_depth, DEFAULT_QUEUE_DEPTH)?;
        let nr_correlator_workers = at_least_one(
            "nr_correlator_workers",
            self.nr_correlator_workers,
            DEFAULT_NR_CORRELATOR_WORKERS,
        )?;
        let nr_beams = beamformer.as_ref().map(|b| b.beams.len()).unwrap_or(0);
        let needed = block_footprint(&shape, nr_beams);
        let arena_size = match self.arena_size {
            Some(available) if available < needed => {
                return Err(ConfigError::ArenaTooSmall { needed, available })
            }
            Some(size) => size,
            None => needed * max_blocks_in_flight(queue_depth, nr_correlator_workers),
        };

        Ok(PipelineParams {
            shape,
            subband_frequency,
            subband_bandwidth,
            sample_format,
            filter,
            flagger,
            beamformer,
            queue_depth,
            nr_correlator_workers,
            arena_size,
            first_sequence_number: self.first_sequence_number.unwrap_or(0),
        })
    }
}

/// The fully-specified configuration that produced `params`. Beams given by a
/// pointing come back as per-station delays.
impl From<&PipelineParams> for CorrelatorConfig {
    fn from(params: &PipelineParams) -> CorrelatorConfig {
        let shape = &params.shape;
        let flagger = params.flagger.as_ref().map(|f| {
            let (estimator, winsorize_fraction) = match f.estimator {
                BaselineEstimator::Mean => ("mean", None),
                BaselineEstimator::Median => ("median", None),
                BaselineEstimator::WinsorizedMean { fraction } => {
                    ("winsorized-mean", Some(fraction))
                }
            };
            FlaggerConfig {
                strategy: Some(f.strategy.to_string()),
                estimator: Some(estimator.to_string()),
                winsorize_fraction,
                cutoff: Some(f.cutoff),
                policy: Some(f.policy.to_string()),
                max_flagged_fraction: Some(f.max_flagged_fraction),
                integration_window: Some(f.integration_window),
                max_sum_threshold_window: Some(f.max_sum_threshold_window),
            }
        });
        let beamformer = params.beamformer.as_ref().map(|b| BeamformerConfig {
            min_stations: Some(b.min_stations),
            station_positions: None,
            beams: b
                .beams
                .iter()
                .map(|beam| BeamConfig {
                    delays: Some(beam.delays.clone()),
                    ..Default::default()
                })
                .collect(),
        });

        CorrelatorConfig {
            nr_stations: Some(shape.nr_stations),
            nr_polarizations: Some(shape.nr_polarizations),
            nr_channels: Some(shape.nr_channels),
            nr_taps: Some(shape.nr_taps),
            nr_samples_per_integration: Some(shape.nr_samples_per_integration),
            subband_frequency: Some(params.subband_frequency),
            subband_bandwidth: Some(params.subband_bandwidth),
            sample_format: Some(params.sample_format.to_string()),
            queue_depth: Some(params.queue_depth),
            nr_correlator_workers: Some(params.nr_correlator_workers),
            arena_size: Some(params.arena_size),
            first_sequence_number: Some(params.first_sequence_number),
            filter: Some(FilterConfig {
                window: Some(params.filter.window.to_string()),
                kaiser_beta: Some(params.filter.kaiser_beta),
                coefficients: params.filter.coefficients.clone(),
                delay_compensation: Some(params.filter.delay_compensation),
            }),
            flagger,
            beamformer,
        }
    }
}

fn validate_filter(config: &FilterConfig, shape: &BlockShape) -> Result<FilterParams, ConfigError> {
    let window = match config.window.as_deref() {
        None => FilterWindow::Kaiser,
        Some(w) => FilterWindow::parse(w).ok_or_else(|| ConfigError::FilterWindow(w.to_string()))?,
    };
    let kaiser_beta = positive("kaiser_beta", config.kaiser_beta, DEFAULT_KAISER_BETA)?;
    if let Some(coefficients) = config.coefficients.as_ref() {
        let expected = shape.nr_channels * shape.nr_taps;
        if coefficients.len() != expected {
            return Err(ConfigError::CoefficientCount {
                expected,
                got: coefficients.len(),
            });
        }
    }
    Ok(FilterParams {
        window,
        kaiser_beta,
        coefficients: config.coefficients.clone(),
        delay_compensation: config.delay_compensation.unwrap_or(true),
    })
}

fn validate_flagger(config: &FlaggerConfig) -> Result<FlaggerParams, ConfigError> {
    let strategy = match config.strategy.as_deref() {
        None => FlaggerStrategy::Threshold,
        Some(s) => {
            FlaggerStrategy::parse(s).ok_or_else(|| ConfigError::FlaggerStrategy(s.to_string()))?
        }
    };
    let fraction = in_range(
        "winsorize_fraction",
        config.winsorize_fraction,
        DEFAULT_WINSORIZE_FRACTION,
        0.0,
        0.5,
    )?;
    let estimator = match config.estimator.as_deref() {
        None => BaselineEstimator::Median,
        Some(e) => BaselineEstimator::parse(e, fraction)
            .ok_or_else(|| ConfigError::BaselineEstimator(e.to_string()))?,
    };
    let policy = match config.policy.as_deref() {
        None => FlagPolicy::Exclude,
        Some(p) => FlagPolicy::parse(p).ok_or_else(|| ConfigError::FlagPolicy(p.to_string()))?,
    };
    // Zero (or less) and infinity are meaningful cutoffs.
    let cutoff = config.cutoff.unwrap_or(DEFAULT_FLAGGER_CUTOFF);
    if cutoff.is_nan() {
        return Err(ConfigError::NanCutoff);
    }

    Ok(FlaggerParams {
        strategy,
        estimator,
        cutoff,
        policy,
        max_flagged_fraction: in_range(
            "max_flagged_fraction",
            config.max_flagged_fraction,
            DEFAULT_MAX_FLAGGED_FRACTION,
            0.0,
            1.0,
        )?,
        integration_window: at_least_one(
            "integration_window",
            config.integration_window,
            DEFAULT_INTEGRATION_WINDOW,
        )?,
        max_sum_threshold_window: at_least_one(
            "max_sum_threshold_window",
            config.max_sum_threshold_window,
            DEFAULT_MAX_SUM_THRESHOLD_WINDOW,
        )?,
    })
}

fn validate_beamformer(
    config: &BeamformerConfig,
    shape: &BlockShape,
) -> Result<BeamformerParams, ConfigError> {
    let nr_stations = shape.nr_stations;
    if let Some(positions) = config.station_positions.as_ref() {
        if positions.len() != nr_stations {
            return Err(ConfigError::StationPositionCount {
                expected: nr_stations,
                got: positions.len(),
            });
        }
    }

    let beams = config
        .beams
        .iter()
        .enumerate()
        .map(|(i, beam)| match (beam.delays.as_ref(), beam.azimuth, beam.elevation) {
            (Some(delays), _, _) => {
                if delays.len() != nr_stations {
                    return Err(ConfigError::BeamDelayCount {
                        beam: i,
                        expected: nr_stations,
                        got: delays.len(),
                    });
                }
                Ok(Beam {
                    delays: delays.clone(),
                })
            }
            (None, Some(az), Some(el)) => {
                let positions = config
                    .station_positions
                    .as_ref()
                    .ok_or(ConfigError::NoStationPositions(i))?;
                Ok(Beam::from_pointing(az.to_radians(), el.to_radians(), positions))
            }
            _ => Err(ConfigError::BeamUnspecified(i)),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BeamformerParams {
        beams,
        min_stations: at_least_one(
            "min_stations",
            config.min_stations,
            DEFAULT_MIN_BEAM_STATIONS,
        )?,
    })
}
