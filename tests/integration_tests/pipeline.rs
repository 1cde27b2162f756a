// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end tests of the library.

use hifitime::Epoch;
use tempfile::TempDir;

use rtcp_correlator::{
    output::{read_json_lines, MemoryWriter},
    simulate::{RfiBurst, SyntheticSource},
    CorrelatorConfig, JsonLinesWriter, Pipeline,
};

use crate::{write_config, SMALL_CONFIG};

fn start() -> Epoch {
    Epoch::from_gpst_seconds(1_090_008_640.0)
}

#[test]
fn test_rfi_burst_is_flagged() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = write_config(
        tmp_dir.path(),
        "config.toml",
        &format!("{SMALL_CONFIG}\n[flagger]\nstrategy = \"threshold\"\n"),
    );
    let params = CorrelatorConfig::read(&config).unwrap().validate().unwrap();
    assert!(params.flagger.is_some());
    let nr_raw = params.shape.nr_input_samples();

    let mut source = SyntheticSource::new(&params, start(), 1234).with_noise(10.0);
    // The first quarter of the raw samples is the first quarter of the
    // channelised times.
    source.rfi.push(RfiBurst {
        sequence_number: 1,
        station: 0,
        samples: 0..nr_raw / 4,
        amplitude: 1000.0,
    });

    let mut pipeline = Pipeline::new(params).unwrap();
    let mut writer = MemoryWriter::new();
    let summary = pipeline
        .run(
            |buffer| {
                source.feed(buffer, 3);
            },
            &mut writer,
            Some(3),
        )
        .unwrap();
    assert_eq!(summary.output.valid, 3);

    let flagged = |seq: usize, station: usize| -> u32 {
        writer.records[seq].flags.flagged_samples[station].iter().sum()
    };
    // 16 times in each of 8 channels.
    assert!(flagged(1, 0) >= 128, "only {} flagged", flagged(1, 0));
    assert!(flagged(0, 0) < 32);
    assert!(flagged(1, 1) < 32);
    assert!(writer.records[1].flags.excluded_stations.is_empty());

    for channel in 0..8 {
        assert!(writer.records[1].weight(0, 1, channel) <= 48);
        assert!(writer.records[0].weight(0, 1, channel) > 48);
    }
}

#[test]
fn test_json_lines_output() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = write_config(tmp_dir.path(), "config.toml", SMALL_CONFIG);
    let params = CorrelatorConfig::read(&config).unwrap().validate().unwrap();
    let channel_bandwidth = params.channel_bandwidth();
    let output = tmp_dir.path().join("out.jsonl");

    let source = SyntheticSource::new(&params, start(), 0)
        .with_noise(0.0)
        .with_tone(-2.0 * channel_bandwidth, 50.0)
        .with_station_phases(vec![0.0, 1.0]);
    let mut pipeline = Pipeline::new(params).unwrap();
    {
        let mut writer = JsonLinesWriter::create(&output).unwrap();
        pipeline
            .run(
                |buffer| {
                    source.feed(buffer, 2);
                },
                &mut writer,
                Some(2),
            )
            .unwrap();
    }

    let records = read_json_lines(&output).unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert!(record.is_valid());
        // Two channels below the centre channel (4). Samples are quantised
        // to 16-bit integers.
        let cross = record.normalised_visibility(0, 1, 2, 0, 0).unwrap();
        assert!((cross.norm() - 2500.0).abs() < 25.0, "{cross}");
        assert!((cross.arg() + 1.0).abs() < 0.02, "{cross}");
        let other = record.normalised_visibility(0, 1, 5, 0, 0).unwrap();
        assert!(other.norm() < 1.0);
    }
    let duration = pipeline.params().block_duration().to_seconds();
    assert!((records[1].gps_time - records[0].gps_time - duration).abs() < 1e-6);
}
