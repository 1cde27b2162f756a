// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Correlation and integration.
//!
//! For every station pair (s1, s2) with s1 <= s2, every channel and every
//! polarisation pair (p1, p2), the correlator sums
//! `x(s1, ch, t, p1) * conj(x(s2, ch, t, p2))` over the times `t` at which
//! neither station is flagged. The number of contributing times is kept as
//! the (baseline, channel) weight. Sums are left unnormalised; use
//! [`CorrelatedData::normalised`] to get an average, which refuses to divide
//! by a zero weight.
//!
//! Baselines are ordered as described by [`baseline_index`]. Only this
//! canonical half is produced; (s2, s1) is the conjugate transpose of
//! (s1, s2).


use log::trace;
use ndarray::prelude::*;
use num_traits::Zero;
use rayon::prelude::*;

use crate::{
    arena::{Arena, ArenaBuffer, ArenaError},
    block::{FilteredData, FlagMask},
    params::{baseline_index, baseline_to_stations, BlockShape, PipelineParams},
    Complex32,
};

/// The integrated visibilities of one block,
/// [baseline][channel][polarisation][polarisation], and their weights,
/// [baseline][channel].
pub struct CorrelatedData {
    visibilities: ArenaBuffer<Complex32>,
    weights: ArenaBuffer<u32>,
    shape: BlockShape,
}

impl CorrelatedData {
    pub fn new(arena: &Arena, shape: BlockShape) -> Result<CorrelatedData, ArenaError> {
        let (b, c, p1, p2) = shape.visibility_dim();
        let (wb, wc) = shape.weight_dim();
        Ok(CorrelatedData {
            visibilities: arena.allocate_zeroed(b * c * p1 * p2)?,
            weights: arena.allocate_zeroed(wb * wc)?,
            shape,
        })
    }

    pub fn shape(&self) -> &BlockShape {
        &self.shape
    }

    pub fn visibilities(&self) -> ArrayView4<Complex32> {
        self.visibilities
            .view(self.shape.visibility_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    pub fn weights(&self) -> ArrayView2<u32> {
        self.weights
            .view(self.shape.weight_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    fn views_mut(&mut self) -> (ArrayViewMut4<Complex32>, ArrayViewMut2<u32>) {
        (
            self.visibilities
                .view_mut(self.shape.visibility_dim())
                .unwrap_or_else(|_| unreachable!("buffer allocated with this shape")),
            self.weights
                .view_mut(self.shape.weight_dim())
                .unwrap_or_else(|_| unreachable!("buffer allocated with this shape")),
        )
    }

    /// The raw sum of a station pair's channel, [polarisation][polarisation].
    /// `s1` must not be bigger than `s2`.
    pub fn visibility(&self, s1: usize, s2: usize, channel: usize) -> ArrayView2<Complex32> {
        self.visibilities()
            .index_axis_move(Axis(0), baseline_index(s1, s2))
            .index_axis_move(Axis(0), channel)
    }

    pub fn weight(&self, s1: usize, s2: usize, channel: usize) -> u32 {
        self.weights()[(baseline_index(s1, s2), channel)]
    }

    /// The average correlation of a station pair's channel, or `None` if no
    /// samples contributed.
    pub fn normalised(&self, s1: usize, s2: usize, channel: usize) -> Option<Array2<Complex32>> {
        match self.weight(s1, s2, channel) {
            0 => None,
            w => {
                let scale = 1.0 / w as f32;
                Some(self.visibility(s1, s2, channel).mapv(|v| v * scale))
            }
        }
    }

    /// Zero all sums and weights.
    pub fn reset(&mut self) {
        let (mut vis, mut weights) = self.views_mut();
        vis.fill(Complex32::zero());
        weights.fill(0);
    }
}

pub struct Correlator {
    shape: BlockShape,
}

impl Correlator {
    pub fn new(params: &PipelineParams) -> Correlator {
        Correlator {
            shape: params.shape,
        }
    }

    /// Correlate a block; `output` is overwritten. Baselines are correlated
    /// in parallel, and each sum is accumulated in time order, so results
    /// don't depend on the number of threads.
    pub fn correlate(&self, data: &FilteredData, mask: &FlagMask, output: &mut CorrelatedData) {
        let samples = data.samples();
        let mask = mask.view();
        let nr_pols = self.shape.nr_polarizations;
        trace!("Correlating {} baselines", self.shape.nr_baselines());

        let (mut vis, mut weights) = output.views_mut();
        let baselines = vis
            .outer_iter_mut()
            .zip(weights.outer_iter_mut())
            .enumerate()
            .collect::<Vec<_>>();
        baselines
            .into_par_iter()
            .for_each(|(baseline, (mut vis, mut weights))| {
                let (s1, s2) = baseline_to_stations(baseline);
                let x1 = samples.index_axis(Axis(0), s1);
                let x2 = samples.index_axis(Axis(0), s2);
                for (channel, (mut vis, weight)) in
                    vis.outer_iter_mut().zip(weights.iter_mut()).enumerate()
                {
                    vis.fill(Complex32::zero());
                    *weight = 0;
                    let flags1 = mask.slice(s![s1, channel, ..]);
                    let flags2 = mask.slice(s![s2, channel, ..]);
                    for (time, (&f1, &f2)) in flags1.iter().zip(flags2.iter()).enumerate() {
                        if f1 != 0 || f2 != 0 {
                            continue;
                        }
                        *weight += 1;
                        for p1 in 0..nr_pols {
                            let a = x1[(channel, time, p1)];
                            for p2 in 0..nr_pols {
                                vis[(p1, p2)] += a * x2[(channel, time, p2)].conj();
                            }
                        }
                    }
                }
            });
    }
}
