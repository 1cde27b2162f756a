// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RFI flagging.
//!
//! The flagger turns a block of channelised data into a [`FlagMask`]. Samples
//! start out flagged if the filter bank derived them from bad input; a
//! detection strategy then flags samples whose power stands out from the
//! station's baseline. If too much of a station (or of one of its channels)
//! ends up flagged, the whole station (or channel) is excluded from the
//! block. Finally, flagged samples are either left out of correlation or
//! replaced by the median sample, depending on the [`FlagPolicy`].
//!
//! Stations are flagged independently and in parallel.

mod strategies;
#[cfg(test)]
mod tests;

pub use strategies::{BaselineEstimator, FlaggerStrategy};
pub(crate) use strategies::{BASELINE_ESTIMATORS, FLAGGER_STRATEGIES};

use std::str::FromStr;

use itertools::Itertools;
use log::{debug, trace};
use ndarray::{prelude::*, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    block::{FilteredData, FlagMask},
    constants::DEFAULT_MAX_FLAGGED_FRACTION,
    params::{BlockShape, PipelineParams},
    sparse_set::SparseSet,
    Complex32,
};
use strategies::{median, StrategyScratch, Thresholds};

lazy_static::lazy_static! {
    pub(crate) static ref FLAG_POLICIES: String = FlagPolicy::iter().join(", ");
}

/// What happens to flagged samples.
#[derive(Debug, Display, Clone, Copy, EnumIter, EnumString, PartialEq, Eq)]
pub enum FlagPolicy {
    /// Flagged samples contribute nothing (zero weight).
    #[strum(serialize = "exclude")]
    Exclude,

    /// Flagged samples are replaced by the median sample of their station,
    /// channel and polarisation in this block, and then contribute with full
    /// weight.
    #[strum(serialize = "replace-with-median")]
    ReplaceWithMedian,
}

impl FlagPolicy {
    pub fn parse(value: &str) -> Option<FlagPolicy> {
        FlagPolicy::from_str(&value.to_lowercase()).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlaggerParams {
    pub strategy: FlaggerStrategy,

    pub estimator: BaselineEstimator,

    /// Flag if `power > cutoff * baseline`. Zero (or less) flags everything;
    /// infinity flags nothing.
    pub cutoff: f64,

    pub policy: FlagPolicy,

    /// If more than this fraction of a station or channel is flagged, the
    /// whole station or channel is excluded.
    pub max_flagged_fraction: f64,

    /// Used by [`FlaggerStrategy::IntegratedThreshold`] \[samples\].
    pub integration_window: usize,

    /// Used by [`FlaggerStrategy::SumThreshold`] \[samples\].
    pub max_sum_threshold_window: usize,
}

/// What the flagger did to a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagSummary {
    /// The number of flagged samples per station and channel, before any
    /// replacement. Wholesale exclusion isn't counted here.
    pub flagged_samples: Vec<Vec<u32>>,

    /// The number of channelised times per station made invalid by bad input.
    pub input_flagged_times: Vec<u32>,

    /// Stations excluded from this block.
    pub excluded_stations: Vec<usize>,

    /// (station, channel) pairs excluded from this block. Channels of
    /// excluded stations aren't listed.
    pub excluded_channels: Vec<(usize, usize)>,

    /// The number of samples replaced by the median.
    pub replaced_samples: u64,
}

impl FlagSummary {
    /// A summary for a block that never made it through flagging; everything
    /// is excluded.
    pub fn everything_excluded(shape: &BlockShape) -> FlagSummary {
        let n = shape.nr_samples_per_integration as u32;
        FlagSummary {
            flagged_samples: vec![vec![n; shape.nr_channels]; shape.nr_stations],
            input_flagged_times: vec![n; shape.nr_stations],
            excluded_stations: (0..shape.nr_stations).collect(),
            excluded_channels: vec![],
            replaced_samples: 0,
        }
    }

    pub fn is_station_excluded(&self, station: usize) -> bool {
        self.excluded_stations.contains(&station)
    }

    pub fn is_channel_excluded(&self, station: usize, channel: usize) -> bool {
        self.is_station_excluded(station) || self.excluded_channels.contains(&(station, channel))
    }

    pub fn total_flagged(&self) -> u64 {
        self.flagged_samples
            .iter()
            .flatten()
            .map(|&n| u64::from(n))
            .sum()
    }
}

/// Per-station scratch space, allocated once.
struct StationScratch {
    /// [channel][time]
    power: Array2<f32>,
    /// [channel][time]
    flags: Array2<bool>,
    strategy: StrategyScratch,
}

/// What happened to one station.
struct StationOutcome {
    flagged_per_channel: Vec<u32>,
    input_flagged_times: u32,
    excluded: bool,
    excluded_channels: Vec<usize>,
    replaced: u64,
}

pub struct Flagger {
    shape: BlockShape,
    /// `None` if only input flags are applied.
    params: Option<FlaggerParams>,
    max_flagged_fraction: f64,
    scratch: Vec<StationScratch>,
}

impl Flagger {
    pub fn new(params: &PipelineParams) -> Flagger {
        let shape = params.shape;
        let dim = (shape.nr_channels, shape.nr_samples_per_integration);
        let integration_window = params.flagger.as_ref().map_or(1, |f| f.integration_window);
        Flagger {
            shape,
            params: params.flagger.clone(),
            max_flagged_fraction: params
                .flagger
                .as_ref()
                .map(|f| f.max_flagged_fraction)
                .unwrap_or(DEFAULT_MAX_FLAGGED_FRACTION),
            scratch: (0..shape.nr_stations)
                .map(|_| StationScratch {
                    power: Array2::zeros(dim),
                    flags: Array2::from_elem(dim, false),
                    strategy: StrategyScratch::new(dim.0, dim.1, integration_window),
                })
                .collect(),
        }
    }

    /// Flag a block. `mask` is overwritten. With
    /// [`FlagPolicy::ReplaceWithMedian`], flagged samples of `data` are
    /// overwritten too.
    pub fn flag(&mut self, data: &mut FilteredData, mask: &mut FlagMask) -> FlagSummary {
        let input_flags = std::mem::take(&mut data.flags);
        let params = self.params.as_ref();
        let max_flagged_fraction = self.max_flagged_fraction;
        let nr_samples = self.shape.nr_samples_per_integration;

        let mut samples = data.samples_mut();
        let mut mask_view = mask.view_mut();
        let outcomes = self
            .scratch
            .par_iter_mut()
            .zip(samples.axis_iter_mut(Axis(0)))
            .zip(mask_view.axis_iter_mut(Axis(0)))
            .zip(input_flags.par_iter())
            .map(|(((scratch, samples), mask), input_flags)| {
                let mut outcome =
                    flag_station(scratch, samples.view(), input_flags, params, nr_samples);
                exclude_wholesale(scratch, &mut outcome, max_flagged_fraction);
                if matches!(params, Some(p) if p.policy == FlagPolicy::ReplaceWithMedian)
                    && !outcome.excluded
                {
                    outcome.replaced =
                        replace_with_median(scratch, samples, &outcome.excluded_channels);
                }
                Zip::from(mask)
                    .and(&scratch.flags)
                    .for_each(|m, &f| *m = u8::from(f));
                outcome
            })
            .collect::<Vec<_>>();
        data.flags = input_flags;

        let mut summary = FlagSummary::default();
        for (station, outcome) in outcomes.into_iter().enumerate() {
            if outcome.excluded {
                debug!("Station {station} is excluded from this block");
                summary.excluded_stations.push(station);
            } else {
                for &channel in &outcome.excluded_channels {
                    trace!("Station {station} channel {channel} is excluded from this block");
                    summary.excluded_channels.push((station, channel));
                }
            }
            summary.flagged_samples.push(outcome.flagged_per_channel);
            summary.input_flagged_times.push(outcome.input_flagged_times);
            summary.replaced_samples += outcome.replaced;
        }
        summary
    }
}

/// Apply input flags and the detection strategy to `scratch.flags`.
fn flag_station(
    scratch: &mut StationScratch,
    samples: ArrayView3<Complex32>,
    input_flags: &SparseSet,
    params: Option<&FlaggerParams>,
    nr_samples: usize,
) -> StationOutcome {
    scratch.flags.fill(false);
    let mut input_flagged_times = 0;
    for r in input_flags.iter() {
        let times = r.start.min(nr_samples)..r.end.min(nr_samples);
        input_flagged_times += times.len();
        scratch.flags.slice_mut(s![.., times]).fill(true);
    }

    if let Some(params) = params {
        if params.cutoff <= 0.0 {
            scratch.flags.fill(true);
        } else if params.cutoff.is_finite() {
            // Power summed over polarisations, [channel][time].
            Zip::from(&mut scratch.power)
                .and(samples.lanes(Axis(2)))
                .for_each(|p, pols| *p = pols.iter().map(|s| s.norm_sqr()).sum());

            let mut thresholds = Thresholds {
                estimator: params.estimator,
                cutoff: params.cutoff,
                integration_window: params.integration_window,
                max_sum_threshold_window: params.max_sum_threshold_window,
                scratch: &mut scratch.strategy,
            };
            thresholds.apply(params.strategy, scratch.power.view(), scratch.flags.view_mut());
        }
    }

    StationOutcome {
        flagged_per_channel: scratch
            .flags
            .outer_iter()
            .map(|ch| ch.iter().filter(|&&f| f).count() as u32)
            .collect(),
        input_flagged_times: input_flagged_times as u32,
        excluded: false,
        excluded_channels: vec![],
        replaced: 0,
    }
}

/// A station or channel with more than `max_flagged_fraction` of its samples
/// flagged is flagged completely.
fn exclude_wholesale(
    scratch: &mut StationScratch,
    outcome: &mut StationOutcome,
    max_flagged_fraction: f64,
) {
    let (nr_channels, nr_times) = scratch.flags.dim();
    if nr_channels * nr_times == 0 {
        return;
    }
    let total: u32 = outcome.flagged_per_channel.iter().sum();
    if f64::from(total) / (nr_channels * nr_times) as f64 > max_flagged_fraction {
        outcome.excluded = true;
        scratch.flags.fill(true);
        return;
    }
    for (channel, (&n, mut flags)) in outcome
        .flagged_per_channel
        .iter()
        .zip(scratch.flags.outer_iter_mut())
        .enumerate()
    {
        if f64::from(n) / nr_times as f64 > max_flagged_fraction {
            outcome.excluded_channels.push(channel);
            flags.fill(true);
        }
    }
}

/// Replace flagged samples of channels that aren't excluded with the median
/// of the unflagged ones, and clear their flags. Returns the number of
/// replaced samples.
fn replace_with_median(
    scratch: &mut StationScratch,
    mut samples: ArrayViewMut3<Complex32>,
    excluded_channels: &[usize],
) -> u64 {
    let mut replaced = 0;
    for (channel, (mut samples, mut flags)) in samples
        .outer_iter_mut()
        .zip(scratch.flags.outer_iter_mut())
        .enumerate()
    {
        if excluded_channels.contains(&channel) {
            continue;
        }
        let nr_flagged = flags.iter().filter(|&&f| f).count();
        if nr_flagged == 0 || nr_flagged == flags.len() {
            continue;
        }
        // samples is [time][polarisation].
        for mut pol in samples.axis_iter_mut(Axis(1)) {
            let values = &mut scratch.strategy.values;
            values.clear();
            values.extend(pol.iter().zip(flags.iter()).filter(|(_, f)| !**f).map(|(s, _)| s.re));
            let re = median(values);
            values.clear();
            values.extend(pol.iter().zip(flags.iter()).filter(|(_, f)| !**f).map(|(s, _)| s.im));
            let im = median(values);

            let replacement = Complex32::new(re, im);
            pol.zip_mut_with(&flags, |s, &f| {
                if f {
                    *s = replacement;
                }
            });
        }
        replaced += nr_flagged as u64;
        flags.fill(false);
    }
    replaced
}
