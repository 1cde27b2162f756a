// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Flagging strategies and baseline estimators.
//!
//! Every strategy has the same shape: it gets a station's power matrix
//! ([channel][time]) and its current flags (same shape), and sets further
//! flags. Samples that are already flagged never contribute to a baseline
//! estimate.

use std::str::FromStr;

use itertools::Itertools;
use ndarray::prelude::*;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::constants::SUM_THRESHOLD_DECAY;

lazy_static::lazy_static! {
    pub(crate) static ref FLAGGER_STRATEGIES: String = FlaggerStrategy::iter().join(", ");

    pub(crate) static ref BASELINE_ESTIMATORS: String = EstimatorKind::iter().join(", ");
}

/// The closed set of RFI detection algorithms.
#[derive(Debug, Display, Clone, Copy, EnumIter, EnumString, PartialEq, Eq)]
pub enum FlaggerStrategy {
    /// Flag individual samples whose power exceeds the threshold.
    #[strum(serialize = "threshold")]
    Threshold,

    /// Average power over windows of time before thresholding; a window that
    /// exceeds the threshold is flagged as a whole.
    #[strum(serialize = "integrated-threshold")]
    IntegratedThreshold,

    /// Combinatorial thresholding along time with growing windows and a
    /// shrinking threshold, good at picking up faint, extended RFI.
    #[strum(serialize = "sum-threshold")]
    SumThreshold,

    /// Threshold the time-integrated spectrum; outlying channels are flagged
    /// for the whole block.
    #[strum(serialize = "frequency-domain")]
    FrequencyDomainThreshold,
}

impl FlaggerStrategy {
    pub fn parse(value: &str) -> Option<FlaggerStrategy> {
        FlaggerStrategy::from_str(&value.to_lowercase()).ok()
    }
}

// Only used to name and parse estimators; `BaselineEstimator` carries the
// parameters.
#[derive(Debug, Display, Clone, Copy, EnumIter, EnumString, PartialEq, Eq)]
enum EstimatorKind {
    #[strum(serialize = "mean")]
    Mean,

    #[strum(serialize = "median")]
    Median,

    #[strum(serialize = "winsorized-mean")]
    WinsorizedMean,
}

/// How the "normal" power level is estimated from unflagged samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaselineEstimator {
    Mean,

    Median,

    /// The mean after clamping the lowest and highest `fraction` of values
    /// to the remaining extremes.
    WinsorizedMean { fraction: f64 },
}

impl BaselineEstimator {
    /// `fraction` is only used by the winsorized mean.
    pub fn parse(value: &str, fraction: f64) -> Option<BaselineEstimator> {
        let kind = EstimatorKind::from_str(&value.to_lowercase()).ok()?;
        Some(match kind {
            EstimatorKind::Mean => BaselineEstimator::Mean,
            EstimatorKind::Median => BaselineEstimator::Median,
            EstimatorKind::WinsorizedMean => BaselineEstimator::WinsorizedMean { fraction },
        })
    }

    /// Estimate the baseline of `values`, which get reordered. `None` if
    /// there are no values.
    pub fn estimate(self, values: &mut [f32]) -> Option<f32> {
        if values.is_empty() {
            return None;
        }
        let n = values.len();
        Some(match self {
            BaselineEstimator::Mean => mean(values),

            BaselineEstimator::Median => median(values),

            BaselineEstimator::WinsorizedMean { fraction } => {
                values.sort_unstable_by(f32::total_cmp);
                let k = ((n as f64 * fraction.clamp(0.0, 0.5)) as usize).min((n - 1) / 2);
                let (lo, hi) = (values[k], values[n - 1 - k]);
                values.iter().map(|&v| f64::from(v.clamp(lo, hi))).sum::<f64>() as f32 / n as f32
            }
        })
    }
}

impl std::fmt::Display for BaselineEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaselineEstimator::Mean => write!(f, "{}", EstimatorKind::Mean),
            BaselineEstimator::Median => write!(f, "{}", EstimatorKind::Median),
            BaselineEstimator::WinsorizedMean { fraction } => {
                write!(f, "{} ({fraction})", EstimatorKind::WinsorizedMean)
            }
        }
    }
}

fn mean(values: &[f32]) -> f32 {
    (values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64) as f32
}

/// The median of a non-empty slice; even-length slices give the mean of the
/// two middle values.
pub(crate) fn median(values: &mut [f32]) -> f32 {
    let n = values.len();
    let (lower, upper, _) = values.select_nth_unstable_by(n / 2, f32::total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        upper
    } else {
        let lower = lower.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (lower + upper) / 2.0
    }
}

/// Working space for the strategies, sized once for a block shape.
pub(crate) struct StrategyScratch {
    /// Values handed to a baseline estimator.
    pub(crate) values: Vec<f32>,
    /// Mean power per integration window, [channel][window].
    integrated: Array2<f32>,
    /// Flags found by one sum-threshold pass, [channel][time].
    new_flags: Array2<bool>,
    /// Time-integrated power per channel; NaN where everything is flagged.
    spectrum: Vec<f32>,
}

impl StrategyScratch {
    pub(crate) fn new(
        nr_channels: usize,
        nr_times: usize,
        integration_window: usize,
    ) -> StrategyScratch {
        let window = integration_window.clamp(1, nr_times.max(1));
        let nr_windows = (nr_times + window - 1) / window;
        StrategyScratch {
            values: Vec::with_capacity(nr_channels * nr_times),
            integrated: Array2::zeros((nr_channels, nr_windows)),
            new_flags: Array2::from_elem((nr_channels, nr_times), false),
            spectrum: Vec::with_capacity(nr_channels),
        }
    }
}

/// Settings shared by all strategies for one pass over a station.
pub(crate) struct Thresholds<'a> {
    pub(crate) estimator: BaselineEstimator,
    pub(crate) cutoff: f64,
    pub(crate) integration_window: usize,
    pub(crate) max_sum_threshold_window: usize,
    /// Reused between blocks.
    pub(crate) scratch: &'a mut StrategyScratch,
}

impl Thresholds<'_> {
    /// The baseline of the unflagged entries of `power`.
    fn baseline(&mut self, power: ArrayView2<f32>, flags: ArrayView2<bool>) -> Option<f32> {
        let values = &mut self.scratch.values;
        values.clear();
        values.extend(
            power
                .iter()
                .zip(flags.iter())
                .filter(|(_, f)| !**f)
                .map(|(&p, _)| p),
        );
        self.estimator.estimate(&mut values[..])
    }

    fn limit(&self, baseline: f32) -> f32 {
        (self.cutoff * f64::from(baseline)) as f32
    }

    pub(crate) fn apply(
        &mut self,
        strategy: FlaggerStrategy,
        power: ArrayView2<f32>,
        flags: ArrayViewMut2<bool>,
    ) {
        match strategy {
            FlaggerStrategy::Threshold => self.threshold(power, flags),
            FlaggerStrategy::IntegratedThreshold => self.integrated_threshold(power, flags),
            FlaggerStrategy::SumThreshold => self.sum_threshold(power, flags),
            FlaggerStrategy::FrequencyDomainThreshold => self.frequency_domain(power, flags),
        }
    }

    fn threshold(&mut self, power: ArrayView2<f32>, mut flags: ArrayViewMut2<bool>) {
        let Some(baseline) = self.baseline(power, flags.view()) else {
            return;
        };
        let limit = self.limit(baseline);
        flags.zip_mut_with(&power, |f, &p| {
            if p > limit {
                *f = true;
            }
        });
    }

    fn integrated_threshold(&mut self, power: ArrayView2<f32>, mut flags: ArrayViewMut2<bool>) {
        let (nr_channels, nr_times) = power.dim();
        let window = self.integration_window.clamp(1, nr_times.max(1));
        let nr_windows = (nr_times + window - 1) / window;
        let StrategyScratch {
            values, integrated, ..
        } = &mut *self.scratch;
        if integrated.dim() != (nr_channels, nr_windows) {
            *integrated = Array2::zeros((nr_channels, nr_windows));
        }

        // The mean unflagged power in each window; NaN where everything is
        // flagged.
        integrated.fill(f32::NAN);
        for ((p_ch, f_ch), mut i_ch) in power
            .outer_iter()
            .zip(flags.outer_iter())
            .zip(integrated.outer_iter_mut())
        {
            for (w, i) in i_ch.iter_mut().enumerate() {
                let times = w * window..((w + 1) * window).min(nr_times);
                let (sum, count) = p_ch
                    .slice(s![times.clone()])
                    .iter()
                    .zip(f_ch.slice(s![times]).iter())
                    .filter(|(_, f)| !**f)
                    .fold((0.0, 0), |(s, c), (&p, _)| (s + p, c + 1));
                if count > 0 {
                    *i = sum / count as f32;
                }
            }
        }

        values.clear();
        values.extend(integrated.iter().copied().filter(|v| !v.is_nan()));
        let Some(baseline) = self.estimator.estimate(&mut values[..]) else {
            return;
        };
        let limit = (self.cutoff * f64::from(baseline)) as f32;
        for (mut f_ch, i_ch) in flags.outer_iter_mut().zip(integrated.outer_iter()) {
            for (w, &i) in i_ch.iter().enumerate() {
                if i > limit {
                    let end = ((w + 1) * window).min(nr_times);
                    f_ch.slice_mut(s![w * window..end]).fill(true);
                }
            }
        }
    }

    fn sum_threshold(&mut self, power: ArrayView2<f32>, mut flags: ArrayViewMut2<bool>) {
        let Some(baseline) = self.baseline(power, flags.view()) else {
            return;
        };
        let nr_times = power.len_of(Axis(1));
        let max_window = self.max_sum_threshold_window.max(1);
        let mut limit = self.limit(baseline);
        let new_flags = &mut self.scratch.new_flags;
        if new_flags.dim() != flags.dim() {
            *new_flags = Array2::from_elem(flags.raw_dim(), false);
        }
        let mut window = 1;
        while window <= max_window && window <= nr_times {
            new_flags.fill(false);
            for ((p_ch, f_ch), mut n_ch) in power
                .outer_iter()
                .zip(flags.outer_iter())
                .zip(new_flags.outer_iter_mut())
            {
                // Flagged samples count as exactly on the threshold.
                let value = |t: usize| if f_ch[t] { limit } else { p_ch[t] };
                let mut sum: f32 = (0..window).map(&value).sum();
                for start in 0..=nr_times - window {
                    if start > 0 {
                        sum += value(start + window - 1) - value(start - 1);
                    }
                    if sum > limit * window as f32 {
                        n_ch.slice_mut(s![start..start + window]).fill(true);
                    }
                }
            }
            flags.zip_mut_with(&*new_flags, |f, &n| *f |= n);

            window *= 2;
            limit = (f64::from(limit) / SUM_THRESHOLD_DECAY) as f32;
        }
    }

    fn frequency_domain(&mut self, power: ArrayView2<f32>, mut flags: ArrayViewMut2<bool>) {
        let StrategyScratch {
            values, spectrum, ..
        } = &mut *self.scratch;
        spectrum.clear();
        spectrum.extend(power.outer_iter().zip(flags.outer_iter()).map(|(p_ch, f_ch)| {
            let (sum, count) = p_ch
                .iter()
                .zip(f_ch.iter())
                .filter(|(_, f)| !**f)
                .fold((0.0, 0), |(s, c), (&p, _)| (s + p, c + 1));
            if count > 0 {
                sum / count as f32
            } else {
                f32::NAN
            }
        }));

        values.clear();
        values.extend(spectrum.iter().copied().filter(|p| !p.is_nan()));
        let Some(baseline) = self.estimator.estimate(&mut values[..]) else {
            return;
        };
        let limit = (self.cutoff * f64::from(baseline)) as f32;
        for (mut f_ch, &p) in flags.outer_iter_mut().zip(spectrum.iter()) {
            // NaN never exceeds the limit.
            if p > limit {
                f_ch.fill(true);
            }
        }
    }
}
