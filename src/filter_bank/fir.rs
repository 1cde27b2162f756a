// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use ndarray::ArrayView1;

use crate::Complex32;

/// A complex FIR filter with real weights. The delay line persists across
/// blocks so that block edges don't cause discontinuities.
#[derive(Debug, Clone)]
pub struct FirFilter {
    /// Newest sample first.
    delay_line: Vec<Complex32>,
}

impl FirFilter {
    /// A filter with `nr_taps` taps and an all-zero delay line.
    pub fn new(nr_taps: usize) -> FirFilter {
        FirFilter {
            delay_line: vec![Complex32::default(); nr_taps],
        }
    }

    pub fn nr_taps(&self) -> usize {
        self.delay_line.len()
    }

    /// Push `sample` into the delay line and return the convolution of the
    /// delay line with `weights` (which must have one entry per tap).
    #[inline]
    pub fn process_next_sample(&mut self, sample: Complex32, weights: ArrayView1<f32>) -> Complex32 {
        debug_assert_eq!(weights.len(), self.delay_line.len());
        let nr_taps = self.delay_line.len();
        if nr_taps == 0 {
            return Complex32::default();
        }
        self.delay_line.copy_within(0..nr_taps - 1, 1);
        self.delay_line[0] = sample;

        self.delay_line
            .iter()
            .zip(weights.iter())
            .fold(Complex32::default(), |acc, (&s, &w)| acc + s * w)
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        self.delay_line.fill(Complex32::default());
    }
}
