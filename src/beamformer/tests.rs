// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;

use super::*;
use crate::constants::PI;

fn shape() -> BlockShape {
    BlockShape {
        nr_stations: 2,
        nr_polarizations: 2,
        nr_channels: 4,
        nr_taps: 1,
        nr_samples_per_integration: 3,
    }
}

fn params(beams: Vec<Beam>, min_stations: usize) -> PipelineParams {
    let mut params = PipelineParams::for_testing(shape());
    params.beamformer = Some(BeamformerParams {
        beams,
        min_stations,
    });
    params.arena_size *= 2;
    params
}

#[test]
fn test_beam_from_pointing() {
    let positions = [
        StationPosition::default(),
        StationPosition {
            east: SPEED_OF_LIGHT * 1e-9,
            north: 0.0,
            up: 0.0,
        },
        StationPosition {
            east: 0.0,
            north: 0.0,
            up: SPEED_OF_LIGHT * 2e-9,
        },
    ];
    // Towards the eastern horizon, the eastern station sees the wavefront
    // first.
    let beam = Beam::from_pointing(PI / 2.0, 0.0, &positions);
    assert_abs_diff_eq!(beam.delays[0], 0.0);
    assert_abs_diff_eq!(beam.delays[1], -1e-9, epsilon = 1e-18);
    assert_abs_diff_eq!(beam.delays[2], 0.0, epsilon = 1e-18);

    let beam = Beam::from_pointing(0.3, PI / 2.0, &positions);
    assert_abs_diff_eq!(beam.delays[1], 0.0, epsilon = 1e-18);
    assert_abs_diff_eq!(beam.delays[2], -2e-9, epsilon = 1e-18);
}

#[test]
fn test_no_beams_means_no_beamformer() {
    assert!(Beamformer::new(&PipelineParams::for_testing(shape())).is_none());
    assert!(Beamformer::new(&params(vec![], 1)).is_none());
}

#[test]
fn test_steered_beam_adds_coherently() {
    let tau = 3e-9;
    let params = params(
        vec![
            Beam {
                delays: vec![0.0, tau],
            },
            Beam {
                delays: vec![0.0, 0.0],
            },
        ],
        1,
    );
    let arena = Arena::new(params.arena_size).unwrap();
    let beamformer = Beamformer::new(&params).unwrap();
    assert_eq!(beamformer.nr_beams(), 2);

    // Station 1 lags station 0 by tau.
    let freqs = params.channel_frequencies();
    let mut data = FilteredData::new(&arena, shape()).unwrap();
    data.samples_mut()
        .indexed_iter_mut()
        .for_each(|((station, channel, _, _), s)| {
            *s = if station == 0 {
                Complex32::new(1.0, 0.0)
            } else {
                let (im, re) = (TAU * freqs[channel] * tau).sin_cos();
                Complex32::new(re as f32, im as f32)
            };
        });
    let mask = FlagMask::new(&arena, shape()).unwrap();
    let mut output = BeamFormedData::new(&arena, shape(), 2).unwrap();
    beamformer.form(&data, &mask, &mut output);

    let samples = output.samples();
    for channel in 0..4 {
        for time in 0..3 {
            for pol in 0..2 {
                let steered = samples[(0, channel, time, pol)];
                assert_abs_diff_eq!(steered.re, 2.0, epsilon = 1e-5);
                assert_abs_diff_eq!(steered.im, 0.0, epsilon = 1e-5);
                // Without steering, the stations are partly out of phase.
                let expected = 2.0 * (PI * freqs[channel] * tau).cos().abs() as f32;
                assert_abs_diff_eq!(samples[(1, channel, time, pol)].norm(), expected, epsilon = 1e-5);
            }
        }
    }
    assert_eq!(output.flagged_counts(), vec![0, 0]);
}

#[test]
fn test_flagged_stations_dont_contribute() {
    let params = params(
        vec![Beam {
            delays: vec![0.0, 0.0],
        }],
        2,
    );
    let arena = Arena::new(params.arena_size).unwrap();
    let beamformer = Beamformer::new(&params).unwrap();
    let mut data = FilteredData::new(&arena, shape()).unwrap();
    data.samples_mut()
        .indexed_iter_mut()
        .for_each(|((station, _, _, _), s)| *s = Complex32::new(station as f32 + 1.0, 0.0));
    let mut mask = FlagMask::new(&arena, shape()).unwrap();
    mask.view_mut()[(1, 2, 1)] = 1;
    let mut output = BeamFormedData::new(&arena, shape(), 1).unwrap();
    beamformer.form(&data, &mask, &mut output);

    // Too few stations remain for the one flagged sample.
    assert!(output.is_flagged(0, 2, 1));
    assert_eq!(output.samples()[(0, 2, 1, 0)], Complex32::default());
    assert_eq!(output.flagged_counts(), vec![1]);
    assert_eq!(output.contributing_stations()[(0, 2, 1)], 1);
    // Everything else is the sum of both stations.
    assert_abs_diff_eq!(output.samples()[(0, 2, 0, 1)].re, 3.0);
    assert_eq!(output.contributing_stations()[(0, 2, 0)], 2);

    // With a minimum of one station, the sample is formed from station 0
    // alone.
    let mut params = params;
    if let Some(b) = params.beamformer.as_mut() {
        b.min_stations = 1;
    }
    let beamformer = Beamformer::new(&params).unwrap();
    beamformer.form(&data, &mask, &mut output);
    assert!(!output.is_flagged(0, 2, 1));
    assert_abs_diff_eq!(output.samples()[(0, 2, 1, 0)].re, 1.0);

    // With both stations excluded, every beam sample is flagged.
    mask.flag_times(0, 0..3);
    mask.flag_times(1, 0..3);
    beamformer.form(&data, &mask, &mut output);
    assert_eq!(output.flagged_counts(), vec![4 * 3]);
    assert!(output.contributing_stations().iter().all(|&n| n == 0));
}

#[test]
fn test_beam_is_an_unnormalised_sum() {
    let params = params(
        vec![Beam {
            delays: vec![0.0, 0.0],
        }],
        1,
    );
    let arena = Arena::new(params.arena_size).unwrap();
    let beamformer = Beamformer::new(&params).unwrap();
    // Zero delays give unit weights.
    assert!(beamformer
        .weights()
        .iter()
        .all(|&w| w == Complex32::new(1.0, 0.0)));

    let mut data = FilteredData::new(&arena, shape()).unwrap();
    data.samples_mut().fill(Complex32::new(1.0, 0.0));
    let mask = FlagMask::new(&arena, shape()).unwrap();
    let mut output = BeamFormedData::new(&arena, shape(), 1).unwrap();
    beamformer.form(&data, &mask, &mut output);

    for &v in output.samples().iter() {
        assert_abs_diff_eq!(v.re, 2.0);
        assert_abs_diff_eq!(v.im, 0.0);
    }
    assert!(output.contributing_stations().iter().all(|&n| n == 2));
    assert_eq!(output.flagged_counts(), vec![0]);
}
