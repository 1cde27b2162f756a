// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;

use super::*;
use crate::{arena::Arena, constants::*};

fn shape() -> BlockShape {
    BlockShape {
        nr_stations: 2,
        nr_polarizations: 1,
        nr_channels: 4,
        nr_taps: 1,
        nr_samples_per_integration: 16,
    }
}

fn flagger_params(strategy: FlaggerStrategy, cutoff: f64) -> FlaggerParams {
    FlaggerParams {
        strategy,
        estimator: BaselineEstimator::Median,
        cutoff,
        policy: FlagPolicy::Exclude,
        max_flagged_fraction: DEFAULT_MAX_FLAGGED_FRACTION,
        integration_window: 4,
        max_sum_threshold_window: DEFAULT_MAX_SUM_THRESHOLD_WINDOW,
    }
}

/// A block of unit-power samples, with station 0 modified by `f`, which gets
/// (channel, time) and returns a sample amplitude.
fn setup(
    params: Option<FlaggerParams>,
    f: impl Fn(usize, usize) -> f32,
) -> (Arena, Flagger, FilteredData, FlagMask) {
    let mut pipeline_params = PipelineParams::for_testing(shape());
    pipeline_params.flagger = params;
    let arena = Arena::new(pipeline_params.arena_size).unwrap();
    let flagger = Flagger::new(&pipeline_params);
    let mut data = FilteredData::new(&arena, shape()).unwrap();
    data.samples_mut()
        .indexed_iter_mut()
        .for_each(|((station, channel, time, _), s)| {
            let amp = if station == 0 { f(channel, time) } else { 1.0 };
            *s = Complex32::new(amp, 0.0);
        });
    let mask = FlagMask::new(&arena, shape()).unwrap();
    (arena, flagger, data, mask)
}

/// The flagged times of a station's channel.
fn flagged_times(mask: &FlagMask, station: usize, channel: usize) -> SparseSet {
    (0..shape().nr_samples_per_integration)
        .filter(|&t| mask.is_flagged(station, channel, t))
        .collect()
}

#[test]
fn test_estimators() {
    let mut values = vec![5.0, 1.0, 3.0];
    assert_abs_diff_eq!(BaselineEstimator::Mean.estimate(&mut values).unwrap(), 3.0);
    assert_abs_diff_eq!(BaselineEstimator::Median.estimate(&mut values).unwrap(), 3.0);

    let mut values = vec![4.0, 1.0, 3.0, 2.0];
    assert_abs_diff_eq!(BaselineEstimator::Median.estimate(&mut values).unwrap(), 2.5);

    // The outliers at each end are clamped to their neighbours.
    let mut values = vec![1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 100.0];
    let winsorized = BaselineEstimator::WinsorizedMean { fraction: 0.1 };
    assert_abs_diff_eq!(winsorized.estimate(&mut values).unwrap(), 2.0);
    assert_abs_diff_eq!(BaselineEstimator::Mean.estimate(&mut values).unwrap(), 11.7, epsilon = 1e-5);

    assert_eq!(BaselineEstimator::Median.estimate(&mut []), None);
}

#[test]
fn test_parsing() {
    assert_eq!(FlaggerStrategy::parse("Sum-Threshold"), Some(FlaggerStrategy::SumThreshold));
    assert_eq!(
        FlaggerStrategy::parse("frequency-domain"),
        Some(FlaggerStrategy::FrequencyDomainThreshold)
    );
    assert_eq!(FlaggerStrategy::parse("aoflagger"), None);
    assert_eq!(
        BaselineEstimator::parse("WINSORIZED-MEAN", 0.2),
        Some(BaselineEstimator::WinsorizedMean { fraction: 0.2 })
    );
    assert_eq!(BaselineEstimator::parse("mode", 0.2), None);
    assert_eq!(FlagPolicy::parse("replace-with-median"), Some(FlagPolicy::ReplaceWithMedian));
    assert!(FLAGGER_STRATEGIES.contains("integrated-threshold"));
    assert!(BASELINE_ESTIMATORS.contains("median"));
    assert!(FLAG_POLICIES.contains("exclude"));
}

#[test]
fn test_infinite_cutoff_flags_nothing() {
    let params = flagger_params(FlaggerStrategy::Threshold, f64::INFINITY);
    let (_arena, mut flagger, mut data, mut mask) =
        setup(Some(params), |ch, t| (ch * 100 + t) as f32);
    let summary = flagger.flag(&mut data, &mut mask);
    assert_eq!(mask.count_flagged(), 0);
    assert_eq!(summary.total_flagged(), 0);
    assert!(summary.excluded_stations.is_empty());
}

#[test]
fn test_zero_cutoff_flags_everything() {
    for strategy in FlaggerStrategy::iter() {
        let params = flagger_params(strategy, 0.0);
        let (_arena, mut flagger, mut data, mut mask) = setup(Some(params), |_, _| 1.0);
        let summary = flagger.flag(&mut data, &mut mask);
        assert_eq!(mask.count_flagged(), 2 * 4 * 16);
        assert_eq!(summary.excluded_stations, vec![0, 1]);
    }
}

#[test]
fn test_threshold_flags_a_spike() {
    let params = flagger_params(FlaggerStrategy::Threshold, DEFAULT_FLAGGER_CUTOFF);
    let (_arena, mut flagger, mut data, mut mask) =
        setup(Some(params), |ch, t| if (ch, t) == (2, 5) { 10.0 } else { 1.0 });
    let summary = flagger.flag(&mut data, &mut mask);
    assert_eq!(mask.count_flagged(), 1);
    assert!(mask.is_flagged(0, 2, 5));
    assert_eq!(summary.flagged_samples[0], vec![0, 0, 1, 0]);
    assert_eq!(summary.flagged_samples[1], vec![0; 4]);
    // Excluded samples are left untouched.
    assert_eq!(data.samples()[(0, 2, 5, 0)], Complex32::new(10.0, 0.0));
}

#[test]
fn test_integrated_threshold_flags_whole_windows() {
    let params = flagger_params(FlaggerStrategy::IntegratedThreshold, 3.0);
    let (_arena, mut flagger, mut data, mut mask) = setup(Some(params), |ch, t| match (ch, t) {
        // Power 16 throughout a window.
        (2, 8..=11) => 4.0,
        // Power 9 in one sample; the window's mean is only 3.
        (0, 1) => 3.0,
        _ => 1.0,
    });
    flagger.flag(&mut data, &mut mask);
    assert_eq!(flagged_times(&mask, 0, 2).ranges(), &[8..12]);
    assert!(flagged_times(&mask, 0, 0).is_empty());
    assert_eq!(mask.count_flagged(), 4);
}

#[test]
fn test_sum_threshold_finds_faint_extended_rfi() {
    let params = flagger_params(FlaggerStrategy::SumThreshold, DEFAULT_FLAGGER_CUTOFF);
    let (_arena, mut flagger, mut data, mut mask) = setup(Some(params), |ch, t| match (ch, t) {
        // Power 4 is well below the single-sample threshold of 7...
        (1, 4..=11) => 2.0,
        // ... and so is a lone sample with the same power.
        (3, 0) => 2.0,
        _ => 1.0,
    });
    flagger.flag(&mut data, &mut mask);
    // The run is found with 4-sample windows, which also catch one sample on
    // either side.
    assert_eq!(flagged_times(&mask, 0, 1).ranges(), &[3..13]);
    assert!(flagged_times(&mask, 0, 3).is_empty());
    assert!(flagged_times(&mask, 0, 0).is_empty());

    // A single-sample threshold misses the run entirely.
    let params = flagger_params(FlaggerStrategy::Threshold, DEFAULT_FLAGGER_CUTOFF);
    let (_arena, mut flagger, mut data, mut mask) =
        setup(Some(params), |ch, t| if ch == 1 && (4..12).contains(&t) { 2.0 } else { 1.0 });
    flagger.flag(&mut data, &mut mask);
    assert_eq!(mask.count_flagged(), 0);
}

#[test]
fn test_frequency_domain_flags_whole_channels() {
    let params = flagger_params(FlaggerStrategy::FrequencyDomainThreshold, DEFAULT_FLAGGER_CUTOFF);
    let (_arena, mut flagger, mut data, mut mask) =
        setup(Some(params), |ch, _| if ch == 3 { 5.0 } else { 1.0 });
    let summary = flagger.flag(&mut data, &mut mask);
    assert_eq!(flagged_times(&mask, 0, 3).count(), 16);
    assert_eq!(mask.count_flagged(), 16);
    // The channel is now completely flagged, so it's excluded.
    assert_eq!(summary.excluded_channels, vec![(0, 3)]);
    assert!(summary.is_channel_excluded(0, 3));
    assert!(!summary.is_channel_excluded(1, 3));
    assert!(summary.excluded_stations.is_empty());
}

#[test]
fn test_mostly_flagged_channel_is_excluded() {
    let params = flagger_params(FlaggerStrategy::Threshold, DEFAULT_FLAGGER_CUTOFF);
    // 15 of 16 samples of channel 0 are bright, but the baseline is set by
    // the other 48 samples.
    let (_arena, mut flagger, mut data, mut mask) =
        setup(Some(params), |ch, t| if ch == 0 && t != 7 { 10.0 } else { 1.0 });
    let summary = flagger.flag(&mut data, &mut mask);
    assert_eq!(summary.flagged_samples[0][0], 15);
    assert_eq!(summary.excluded_channels, vec![(0, 0)]);
    // The remaining sample is flagged too.
    assert!(mask.is_flagged(0, 0, 7));
    assert_eq!(mask.count_flagged(), 16);
}

#[test]
fn test_input_flags_without_rfi_flagging() {
    let (_arena, mut flagger, mut data, mut mask) = setup(None, |_, _| 1.0);
    data.flags[1] = SparseSet::from_range(2..4);
    let summary = flagger.flag(&mut data, &mut mask);
    for channel in 0..4 {
        assert_eq!(flagged_times(&mask, 1, channel).ranges(), &[2..4]);
        assert!(flagged_times(&mask, 0, channel).is_empty());
    }
    assert_eq!(summary.input_flagged_times, vec![0, 2]);
    // The input flags are kept with the data.
    assert_eq!(data.flags[1].ranges(), &[2..4]);

    // Almost all of station 0 is invalid, so it's dropped from the block.
    data.flags[0] = SparseSet::from_range(0..15);
    let summary = flagger.flag(&mut data, &mut mask);
    assert_eq!(summary.excluded_stations, vec![0]);
    assert!(summary.is_channel_excluded(0, 2));
    assert_eq!(flagged_times(&mask, 0, 2).count(), 16);
    assert_eq!(mask.count_flagged(), 4 * 16 + 4 * 2);
}

#[test]
fn test_replace_with_median() {
    let mut params = flagger_params(FlaggerStrategy::Threshold, DEFAULT_FLAGGER_CUTOFF);
    params.policy = FlagPolicy::ReplaceWithMedian;
    let (_arena, mut flagger, mut data, mut mask) = setup(Some(params), |ch, t| match (ch, t) {
        (0, 5) => 10.0,
        (0, _) => 1.0 + t as f32 * 0.01,
        _ => 1.0,
    });
    let summary = flagger.flag(&mut data, &mut mask);
    assert_eq!(summary.replaced_samples, 1);
    assert_eq!(summary.flagged_samples[0][0], 1);
    // The replaced sample is no longer flagged.
    assert_eq!(mask.count_flagged(), 0);

    // The median of 1.00, 1.01, ..., 1.15 without 1.05 is 1.08.
    let replaced = data.samples()[(0, 0, 5, 0)];
    assert_abs_diff_eq!(replaced.re, 1.08, epsilon = 1e-6);
    assert_abs_diff_eq!(replaced.im, 0.0);
    // Other samples are untouched.
    assert_abs_diff_eq!(data.samples()[(0, 0, 6, 0)].re, 1.06, epsilon = 1e-6);
}

#[test]
fn test_excluded_channels_are_not_replaced() {
    let mut params = flagger_params(FlaggerStrategy::FrequencyDomainThreshold, DEFAULT_FLAGGER_CUTOFF);
    params.policy = FlagPolicy::ReplaceWithMedian;
    let (_arena, mut flagger, mut data, mut mask) =
        setup(Some(params), |ch, _| if ch == 1 { 6.0 } else { 1.0 });
    let summary = flagger.flag(&mut data, &mut mask);
    assert_eq!(summary.replaced_samples, 0);
    assert_eq!(summary.excluded_channels, vec![(0, 1)]);
    assert_eq!(flagged_times(&mask, 0, 1).count(), 16);
}

#[test]
fn test_everything_excluded_summary() {
    let summary = FlagSummary::everything_excluded(&shape());
    assert_eq!(summary.excluded_stations, vec![0, 1]);
    assert_eq!(summary.total_flagged(), 2 * 4 * 16);
    assert!(summary.is_channel_excluded(1, 3));
}

#[test]
fn test_strategies_start_afresh_every_block() {
    use strum::IntoEnumIterator;

    for strategy in FlaggerStrategy::iter() {
        let params = flagger_params(strategy, 3.0);
        // Power 16 over a third of station 0's channel 2.
        let (_arena, mut flagger, mut data, mut mask) =
            setup(Some(params), |ch, t| if ch == 2 && (8..12).contains(&t) { 4.0 } else { 1.0 });
        flagger.flag(&mut data, &mut mask);
        assert!(mask.is_flagged(0, 2, 9), "{strategy}");

        // Nothing of the first block leaks into a clean one.
        data.samples_mut().fill(Complex32::new(1.0, 0.0));
        let summary = flagger.flag(&mut data, &mut mask);
        assert_eq!(mask.count_flagged(), 0, "{strategy}");
        assert_eq!(summary.total_flagged(), 0, "{strategy}");
    }
}
