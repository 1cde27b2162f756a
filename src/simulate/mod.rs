// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Synthetic station data.
//!
//! A [`SyntheticSource`] stands in for station-data ingestion: it produces
//! tones with a per-station phase offset plus Gaussian noise, and can add RFI
//! bursts, lose samples, or skip whole blocks. Everything is seeded, so a
//! source always produces the same stream.


use std::ops::Range;

use hifitime::{Duration, Epoch};
use log::{debug, warn};
use num_complex::Complex;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::{
    block::{BlockError, InputBlock, SampleBuffer, SampleFormat},
    constants::TAU,
    params::{BlockShape, PipelineParams},
    Complex32,
};

/// The number of raw samples carried by each (pretend) packet.
pub const SAMPLES_PER_PACKET: usize = 16;

/// A complex tone present at every station.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tone {
    /// Relative to the subband centre \[Hz\].
    pub offset: f64,
    pub amplitude: f32,
}

/// A burst of strong noise at one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfiBurst {
    pub sequence_number: u64,
    pub station: usize,
    /// Raw sample indices within the block.
    pub samples: Range<usize>,
    /// The standard deviation of the burst's real and imaginary parts.
    pub amplitude: f32,
}

/// Raw samples that never arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LostSamples {
    pub sequence_number: u64,
    pub station: usize,
    pub samples: Range<usize>,
}

fn packets(nr_samples: usize) -> usize {
    (nr_samples + SAMPLES_PER_PACKET - 1) / SAMPLES_PER_PACKET
}

#[derive(Debug, Clone)]
pub struct SyntheticSource {
    shape: BlockShape,
    sample_format: SampleFormat,
    sample_rate: f64,
    first_sequence_number: u64,
    start: Epoch,
    block_duration: Duration,
    seed: u64,

    pub tones: Vec<Tone>,

    /// Added to every tone's phase at each station \[radians\]. Stations
    /// without an entry have no offset.
    pub station_phases: Vec<f64>,

    /// The standard deviation of the real and imaginary parts of the noise.
    pub noise: f32,

    pub rfi: Vec<RfiBurst>,
    pub lost: Vec<LostSamples>,

    /// Sequence numbers that are never submitted.
    pub missing: Vec<u64>,
}

impl SyntheticSource {
    /// A source of pure noise, with unit standard deviation, matching the
    /// shape and format that `params` expect.
    pub fn new(params: &PipelineParams, start: Epoch, seed: u64) -> SyntheticSource {
        SyntheticSource {
            shape: params.shape,
            sample_format: params.sample_format,
            sample_rate: params.subband_bandwidth,
            first_sequence_number: params.first_sequence_number,
            start,
            block_duration: params.block_duration(),
            seed,
            tones: vec![],
            station_phases: vec![],
            noise: 1.0,
            rfi: vec![],
            lost: vec![],
            missing: vec![],
        }
    }

    pub fn with_tone(mut self, offset: f64, amplitude: f32) -> Self {
        self.tones.push(Tone { offset, amplitude });
        self
    }

    pub fn with_station_phases(mut self, phases: Vec<f64>) -> Self {
        self.station_phases = phases;
        self
    }

    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise = noise;
        self
    }

    pub fn timestamp(&self, sequence_number: u64) -> Epoch {
        let n = sequence_number.saturating_sub(self.first_sequence_number);
        self.start + self.block_duration * n as f64
    }

    /// The samples of one station and polarisation of a block.
    fn station_samples(
        &self,
        sequence_number: u64,
        station: usize,
        pol: usize,
    ) -> Vec<Complex32> {
        let nr_samples = self.shape.nr_input_samples();
        // Every (block, station, polarisation) gets its own stream of random
        // numbers.
        let stream = (sequence_number * self.shape.nr_stations as u64 + station as u64)
            * self.shape.nr_polarizations as u64
            + pol as u64;
        let mut rng =
            StdRng::seed_from_u64(self.seed ^ stream.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let noise = Normal::new(0.0, self.noise).ok().filter(|_| self.noise > 0.0);

        let offset = (sequence_number.saturating_sub(self.first_sequence_number) as usize
            * nr_samples) as f64;
        let phase = self.station_phases.get(station).copied().unwrap_or(0.0);
        let mut samples = (0..nr_samples)
            .map(|i| {
                let t = (offset + i as f64) / self.sample_rate;
                let mut s = self
                    .tones
                    .iter()
                    .map(|tone| {
                        let (im, re) = (TAU * tone.offset * t + phase).sin_cos();
                        Complex32::new(re as f32, im as f32) * tone.amplitude
                    })
                    .sum::<Complex32>();
                if let Some(noise) = noise.as_ref() {
                    s += Complex32::new(noise.sample(&mut rng), noise.sample(&mut rng));
                }
                s
            })
            .collect::<Vec<_>>();

        for burst in self
            .rfi
            .iter()
            .filter(|b| b.sequence_number == sequence_number && b.station == station)
        {
            if let Ok(rfi) = Normal::new(0.0, burst.amplitude) {
                let end = burst.samples.end.min(nr_samples);
                for s in &mut samples[burst.samples.start.min(end)..end] {
                    *s += Complex32::new(rfi.sample(&mut rng), rfi.sample(&mut rng));
                }
            }
        }
        samples
    }

    /// Fill a block obtained from a [`SampleBuffer`].
    pub fn fill(&self, block: &mut InputBlock) -> Result<(), BlockError> {
        let seq = block.sequence_number;
        let packets_per_station = packets(self.shape.nr_input_samples());
        block.counters.packets_received = (packets_per_station * self.shape.nr_stations) as u64;

        for station in 0..self.shape.nr_stations {
            let lost = self
                .lost
                .iter()
                .filter(|l| l.sequence_number == seq && l.station == station)
                .map(|l| l.samples.clone())
                .collect::<Vec<_>>();
            for range in &lost {
                block.metadata[station].flags.include(range.clone());
            }

            for pol in 0..self.shape.nr_polarizations {
                let mut samples = self.station_samples(seq, station, pol);
                for range in &lost {
                    let end = range.end.min(samples.len());
                    samples[range.start.min(end)..end].fill(Complex32::default());
                }
                self.write(block, station, pol, &samples)?;
            }
        }
        let lost_packets = block
            .metadata
            .iter()
            .flat_map(|m| m.flags.iter())
            .map(|r| packets(r.len()))
            .sum::<usize>() as u64;
        block.counters.packets_received -= lost_packets.min(block.counters.packets_received);
        block.counters.packets_rejected = lost_packets;
        Ok(())
    }

    /// Convert to the delivered sample format before writing, so that
    /// integer formats are quantised (and clipped) like real station data.
    fn write(
        &self,
        block: &mut InputBlock,
        station: usize,
        pol: usize,
        samples: &[Complex32],
    ) -> Result<(), BlockError> {
        fn quantise<T: TryFrom<i32> + Default>(v: f32, max: f32) -> T {
            T::try_from(v.round().clamp(-max, max) as i32).unwrap_or_default()
        }

        let max = self.sample_format.max_amplitude().unwrap_or(f32::MAX);
        match self.sample_format {
            SampleFormat::F32 => block.data.write_station(station, pol, samples),
            SampleFormat::I16 => {
                let samples = samples
                    .iter()
                    .map(|s| Complex::<i16>::new(quantise(s.re, max), quantise(s.im, max)))
                    .collect::<Vec<_>>();
                block.data.write_station(station, pol, &samples)
            }
            SampleFormat::I8 => {
                let samples = samples
                    .iter()
                    .map(|s| Complex::<i8>::new(quantise(s.re, max), quantise(s.im, max)))
                    .collect::<Vec<_>>();
                block.data.write_station(station, pol, &samples)
            }
        }
    }

    /// Submit `nr_blocks` blocks, starting at the first sequence number, to
    /// the pipeline. Returns the number of blocks submitted.
    pub fn feed(&self, buffer: SampleBuffer, nr_blocks: u64) -> u64 {
        let mut submitted = 0;
        let first = self.first_sequence_number;
        for seq in first..first + nr_blocks {
            if self.missing.contains(&seq) {
                debug!("Not submitting block {seq}");
                continue;
            }
            let mut block = match buffer.allocate_block(seq, self.timestamp(seq)) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Skipping block {seq}: {e}");
                    continue;
                }
            };
            if let Err(e) = self.fill(&mut block) {
                warn!("Skipping block {seq}: {e}");
                continue;
            }
            if buffer.submit(block).is_err() {
                // The pipeline has stopped.
                break;
            }
            submitted += 1;
        }
        submitted
    }
}
