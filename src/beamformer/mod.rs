// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Coherent beamforming.
//!
//! Each pencil beam is the phase-shifted sum of every station's channelised
//! samples. A station's weight for a beam is `exp(-2πi f τ)`, where `τ` is
//! the geometric delay of the station towards the beam's direction and `f`
//! is the channel frequency. Flagged samples (including everything of
//! excluded stations) don't contribute; a beam sample formed from fewer than
//! the configured minimum number of stations is flagged. Beam samples are
//! plain sums; the number of stations behind each one is kept next to it.

#[cfg(test)]
mod tests;

use log::trace;
use ndarray::prelude::*;
use num_traits::Zero;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    arena::{Arena, ArenaBuffer, ArenaError},
    block::{FilteredData, FlagMask},
    constants::{SPEED_OF_LIGHT, TAU},
    params::{BlockShape, PipelineParams},
    Complex32,
};

/// A station's position relative to the array centre \[metres\].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StationPosition {
    pub east: f64,
    pub north: f64,
    pub up: f64,
}

/// One pencil beam, described by the geometric delay of each station
/// towards its direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Beam {
    /// One delay per station \[s\].
    pub delays: Vec<f64>,
}

impl Beam {
    /// A beam pointed at `azimuth` (east of north) and `elevation`, both in
    /// radians, for stations at `positions`.
    pub fn from_pointing(azimuth: f64, elevation: f64, positions: &[StationPosition]) -> Beam {
        let (s_el, c_el) = elevation.sin_cos();
        let (s_az, c_az) = azimuth.sin_cos();
        // Unit vector towards the source in (east, north, up).
        let (e, n, u) = (c_el * s_az, c_el * c_az, s_el);
        Beam {
            delays: positions
                .iter()
                .map(|p| -(p.east * e + p.north * n + p.up * u) / SPEED_OF_LIGHT)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeamformerParams {
    pub beams: Vec<Beam>,

    /// A beam sample formed from fewer stations than this is flagged.
    pub min_stations: usize,
}

/// Beamformed samples of one block, [beam][channel][time][polarisation], with
/// their flags and contributing-station counts, [beam][channel][time].
pub struct BeamFormedData {
    samples: ArenaBuffer<Complex32>,
    flags: ArenaBuffer<u8>,
    stations: ArenaBuffer<u32>,
    shape: BlockShape,
    nr_beams: usize,
}

impl BeamFormedData {
    pub fn new(arena: &Arena, shape: BlockShape, nr_beams: usize) -> Result<BeamFormedData, ArenaError> {
        let (b, c, t, p) = shape.beam_dim(nr_beams);
        Ok(BeamFormedData {
            samples: arena.allocate_zeroed(b * c * t * p)?,
            flags: arena.allocate_zeroed(b * c * t)?,
            stations: arena.allocate_zeroed(b * c * t)?,
            shape,
            nr_beams,
        })
    }

    pub fn nr_beams(&self) -> usize {
        self.nr_beams
    }

    pub fn samples(&self) -> ArrayView4<Complex32> {
        self.samples
            .view(self.shape.beam_dim(self.nr_beams))
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    fn flags_dim(&self) -> (usize, usize, usize) {
        let (b, c, t, _) = self.shape.beam_dim(self.nr_beams);
        (b, c, t)
    }

    /// Non-zero means flagged.
    pub fn flags(&self) -> ArrayView3<u8> {
        self.flags
            .view(self.flags_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    /// The number of stations summed into each beam sample.
    pub fn contributing_stations(&self) -> ArrayView3<u32> {
        self.stations
            .view(self.flags_dim())
            .unwrap_or_else(|_| unreachable!("buffer allocated with this shape"))
    }

    pub fn is_flagged(&self, beam: usize, channel: usize, time: usize) -> bool {
        self.flags()[(beam, channel, time)] != 0
    }

    /// The number of flagged samples of each beam.
    pub fn flagged_counts(&self) -> Vec<u32> {
        self.flags()
            .outer_iter()
            .map(|f| f.iter().filter(|&&f| f != 0).count() as u32)
            .collect()
    }

    #[allow(clippy::type_complexity)]
    fn views_mut(
        &mut self,
    ) -> (
        ArrayViewMut4<Complex32>,
        ArrayViewMut3<u8>,
        ArrayViewMut3<u32>,
    ) {
        let flags_dim = self.flags_dim();
        (
            self.samples
                .view_mut(self.shape.beam_dim(self.nr_beams))
                .unwrap_or_else(|_| unreachable!("buffer allocated with this shape")),
            self.flags
                .view_mut(flags_dim)
                .unwrap_or_else(|_| unreachable!("buffer allocated with this shape")),
            self.stations
                .view_mut(flags_dim)
                .unwrap_or_else(|_| unreachable!("buffer allocated with this shape")),
        )
    }
}

pub struct Beamformer {
    shape: BlockShape,
    /// [beam][station][channel]
    weights: Array3<Complex32>,
    min_stations: usize,
}

impl Beamformer {
    /// `None` if no beams are configured.
    pub fn new(params: &PipelineParams) -> Option<Beamformer> {
        let beamformer = params.beamformer.as_ref()?;
        if beamformer.beams.is_empty() {
            return None;
        }
        let shape = params.shape;
        let freqs = params.channel_frequencies();
        let weights = Array3::from_shape_fn(
            (beamformer.beams.len(), shape.nr_stations, shape.nr_channels),
            |(beam, station, channel)| {
                let delay = beamformer.beams[beam].delays.get(station).copied().unwrap_or(0.0);
                let (im, re) = (-TAU * freqs[channel] * delay).sin_cos();
                Complex32::new(re as f32, im as f32)
            },
        );
        Some(Beamformer {
            shape,
            weights,
            min_stations: beamformer.min_stations,
        })
    }

    pub fn nr_beams(&self) -> usize {
        self.weights.len_of(Axis(0))
    }

    /// [beam][station][channel]
    pub fn weights(&self) -> ArrayView3<Complex32> {
        self.weights.view()
    }

    /// Form every beam of a block. Beams are formed in parallel.
    pub fn form(&self, data: &FilteredData, mask: &FlagMask, output: &mut BeamFormedData) {
        debug_assert_eq!(output.nr_beams, self.nr_beams());
        trace!("Forming {} beams", self.nr_beams());
        let samples = data.samples();
        let mask = mask.view();
        let nr_samples = self.shape.nr_samples_per_integration;
        let min_stations = self.min_stations.max(1);

        let (mut out_samples, mut out_flags, mut out_stations) = output.views_mut();
        out_samples
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(out_flags.axis_iter_mut(Axis(0)))
            .zip(out_stations.axis_iter_mut(Axis(0)))
            .zip(self.weights.axis_iter(Axis(0)))
            .for_each(|(((mut beam_samples, mut beam_flags), mut beam_stations), weights)| {
                beam_samples.fill(Complex32::zero());
                for (channel, ((mut ch_samples, mut ch_flags), mut ch_stations)) in beam_samples
                    .outer_iter_mut()
                    .zip(beam_flags.outer_iter_mut())
                    .zip(beam_stations.outer_iter_mut())
                    .enumerate()
                {
                    for time in 0..nr_samples {
                        let mut sum = ch_samples.row_mut(time);
                        let mut nr_contributing = 0;
                        for (station, &weight) in weights.column(channel).iter().enumerate() {
                            if mask[(station, channel, time)] != 0 {
                                continue;
                            }
                            nr_contributing += 1;
                            let station_samples = samples.slice(s![station, channel, time, ..]);
                            sum.zip_mut_with(&station_samples, |acc, &s| *acc += weight * s);
                        }
                        ch_stations[time] = nr_contributing as u32;
                        if nr_contributing < min_stations {
                            sum.fill(Complex32::zero());
                            ch_flags[time] = 1;
                        } else {
                            ch_flags[time] = 0;
                        }
                    }
                }
            });
    }
}
