// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Polyphase filter bank coefficients.
//!
//! The prototype filter is a windowed sinc low-pass with a cutoff at half a
//! channel width. It has `nr_channels * nr_taps` coefficients; coefficient
//! `tap * nr_channels + channel` belongs to `channel`'s FIR filter. The table
//! is computed once and never changes during a run.

use std::str::FromStr;

use itertools::Itertools;
use ndarray::prelude::*;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use super::FilterBankError;
use crate::constants::PI;

lazy_static::lazy_static! {
    // Useful for help texts.
    pub(crate) static ref FILTER_WINDOWS: String = FilterWindow::iter().join(", ");
}

/// Windows that can be applied to the prototype filter.
#[derive(Debug, Display, Clone, Copy, EnumIter, EnumString, PartialEq)]
pub enum FilterWindow {
    #[strum(serialize = "kaiser")]
    Kaiser,

    #[strum(serialize = "hamming")]
    Hamming,

    #[strum(serialize = "blackman")]
    Blackman,

    #[strum(serialize = "gaussian")]
    Gaussian,
}

impl FilterWindow {
    pub fn parse(value: &str) -> Option<FilterWindow> {
        FilterWindow::from_str(&value.to_lowercase()).ok()
    }

    /// The window's `n`-point values. `beta` only matters for the Kaiser
    /// window.
    pub fn values(self, n: usize, beta: f64) -> Vec<f64> {
        if n == 1 {
            return vec![1.0];
        }
        let m = (n - 1) as f64;
        (0..n)
            .map(|i| {
                let i = i as f64;
                match self {
                    FilterWindow::Kaiser => {
                        let r = 2.0 * i / m - 1.0;
                        bessel_i0(beta * (1.0 - r * r).max(0.0).sqrt()) / bessel_i0(beta)
                    }

                    FilterWindow::Hamming => 0.54 - 0.46 * (2.0 * PI * i / m).cos(),

                    FilterWindow::Blackman => {
                        0.42 - 0.5 * (2.0 * PI * i / m).cos() + 0.08 * (4.0 * PI * i / m).cos()
                    }

                    FilterWindow::Gaussian => {
                        const ALPHA: f64 = 3.5;
                        let x = ALPHA * (i - m / 2.0) / (m / 2.0);
                        (-0.5 * x * x).exp()
                    }
                }
            })
            .collect()
    }
}

/// The zeroth-order modified Bessel function of the first kind, by its power
/// series.
fn bessel_i0(x: f64) -> f64 {
    let half_x = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    for k in 1..500 {
        let f = half_x / k as f64;
        term *= f * f;
        sum += term;
        if term < sum * 1e-16 {
            break;
        }
    }
    sum
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// The prototype low-pass filter for `nr_channels` channels with `nr_taps`
/// taps each.
pub fn prototype_filter(
    nr_channels: usize,
    nr_taps: usize,
    window: FilterWindow,
    beta: f64,
) -> Vec<f64> {
    let n = nr_channels * nr_taps;
    let centre = (n as f64 - 1.0) / 2.0;
    window
        .values(n, beta)
        .into_iter()
        .enumerate()
        .map(|(i, w)| w * sinc((i as f64 - centre) / nr_channels as f64))
        .collect()
}

/// The FIR weights of every channel, [channel][tap].
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCoefficients {
    weights: Array2<f32>,
}

impl FilterCoefficients {
    /// Build the table from a windowed-sinc prototype. Each channel's weights
    /// are scaled so that its DC gain is `1 / nr_channels`; after the
    /// channelising FFT, a tone centred on a channel keeps its amplitude.
    pub fn generate(
        nr_channels: usize,
        nr_taps: usize,
        window: FilterWindow,
        beta: f64,
    ) -> Result<FilterCoefficients, FilterBankError> {
        let prototype = prototype_filter(nr_channels, nr_taps, window, beta);
        let mut weights = Array2::zeros((nr_channels, nr_taps));
        for (channel, mut row) in weights.outer_iter_mut().enumerate() {
            let taps = (0..nr_taps)
                .map(|tap| prototype[tap * nr_channels + channel])
                .collect::<Vec<_>>();
            let dc_gain: f64 = taps.iter().sum();
            if dc_gain.abs() < f64::EPSILON {
                return Err(FilterBankError::DegenerateChannel { channel });
            }
            let scale = 1.0 / (dc_gain * nr_channels as f64);
            for (w, t) in row.iter_mut().zip(taps) {
                *w = (t * scale) as f32;
            }
        }
        Ok(FilterCoefficients { weights })
    }

    /// Use an externally supplied prototype filter (ordered as described in
    /// the module documentation). Its length must be `nr_channels * nr_taps`.
    pub fn from_prototype(
        nr_channels: usize,
        nr_taps: usize,
        prototype: &[f32],
    ) -> Result<FilterCoefficients, FilterBankError> {
        let expected = nr_channels * nr_taps;
        if prototype.len() != expected {
            return Err(FilterBankError::CoefficientTableSize {
                expected,
                got: prototype.len(),
                nr_channels,
                nr_taps,
            });
        }
        let weights = Array2::from_shape_fn((nr_channels, nr_taps), |(channel, tap)| {
            prototype[tap * nr_channels + channel]
        });
        Ok(FilterCoefficients { weights })
    }

    pub fn nr_channels(&self) -> usize {
        self.weights.len_of(Axis(0))
    }

    pub fn nr_taps(&self) -> usize {
        self.weights.len_of(Axis(1))
    }

    /// The weights of one channel's FIR filter, newest tap first.
    pub fn channel(&self, channel: usize) -> ArrayView1<f32> {
        self.weights.row(channel)
    }

    pub fn weights(&self) -> ArrayView2<f32> {
        self.weights.view()
    }
}
