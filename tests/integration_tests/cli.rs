// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tests of the binary.

use tempfile::TempDir;

use rtcp_correlator::output::{read_json_lines, BlockStatus};

use crate::{correlator, get_cmd_output, write_config, SMALL_CONFIG};

#[test]
fn test_simulate_writes_every_block() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = write_config(tmp_dir.path(), "config.toml", SMALL_CONFIG);
    let output = tmp_dir.path().join("out.jsonl");

    #[rustfmt::skip]
    let cmd = correlator()
        .args([
            "simulate",
            &format!("{}", config.display()),
            "--output", &format!("{}", output.display()),
            "--num-blocks", "4",
            "--tones", "24414.0625",
            "--missing", "2",
            "--no-progress-bars",
        ])
        .ok();
    assert!(cmd.is_ok(), "simulate failed: {}", cmd.err().unwrap());
    let (stdout, stderr) = get_cmd_output(cmd);
    assert!(stderr.is_empty(), "stderr wasn't empty: {stderr}");
    assert!(stdout.contains("simulate complete"), "{stdout}");

    let records = read_json_lines(&output).unwrap();
    assert_eq!(records.len(), 4);
    for (seq, record) in records.iter().enumerate() {
        assert_eq!(record.sequence_number, seq as u64);
        assert_eq!(record.nr_channels, 8);
    }
    assert_eq!(records[2].status, BlockStatus::Missing);
    assert!(records[3].is_valid());
}

#[test]
fn test_dry_run_writes_nothing() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let output = tmp_dir.path().join("out.jsonl");
    let saved = tmp_dir.path().join("saved.toml");

    #[rustfmt::skip]
    let cmd = correlator()
        .args([
            "simulate",
            "--output", &format!("{}", output.display()),
            "--save-toml", &format!("{}", saved.display()),
            "--dry-run",
        ])
        .ok();
    assert!(cmd.is_ok(), "simulate --dry-run failed: {}", cmd.err().unwrap());
    assert!(!output.exists());

    // The saved configuration is complete and valid.
    let contents = std::fs::read_to_string(&saved).unwrap();
    assert!(contents.contains("nr_channels = 64"), "{contents}");
    let cmd = correlator()
        .args(["verify-config", &format!("{}", saved.display())])
        .ok();
    assert!(cmd.is_ok(), "verify-config failed: {}", cmd.err().unwrap());
}

#[test]
fn test_verify_config_rejects_bad_configs() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = write_config(tmp_dir.path(), "bad.toml", "nr_channels = 12\n");

    let cmd = correlator()
        .args(["verify-config", &format!("{}", config.display())])
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("power of two"), "{stderr}");

    let config = write_config(tmp_dir.path(), "config.yaml", "nr_channels: 16\n");
    let cmd = correlator()
        .args(["verify-config", &format!("{}", config.display())])
        .ok();
    assert!(cmd.is_err());
    let (_, stderr) = get_cmd_output(cmd);
    assert!(stderr.contains("recognised file extension"), "{stderr}");
}

#[test]
fn test_simulate_takes_negative_tones_before_other_flags() {
    let tmp_dir = TempDir::new().expect("couldn't make tmp dir");
    let config = write_config(tmp_dir.path(), "config.toml", SMALL_CONFIG);
    let output = tmp_dir.path().join("out.jsonl");

    // Channels are 24414.0625 Hz wide; these tones land in channels 3 and 5.
    #[rustfmt::skip]
    let cmd = correlator()
        .args([
            "simulate",
            &format!("{}", config.display()),
            "--tones=-24414.0625,24414.0625",
            "--station-phases", "0,0.5",
            "--rfi", "1",
            "--output", &format!("{}", output.display()),
            "--num-blocks", "2",
            "--no-progress-bars",
        ])
        .ok();
    assert!(cmd.is_ok(), "simulate failed: {}", cmd.err().unwrap());
    let (stdout, _) = get_cmd_output(cmd);
    assert!(stdout.contains("2 tones"), "{stdout}");

    let records = read_json_lines(&output).unwrap();
    assert_eq!(records.len(), 2);
    let record = &records[0];
    assert!(record.is_valid());
    // Both tones carry the stations' phase difference.
    for channel in [3, 5] {
        let arg = record.visibility(0, 1, channel, 0, 0).arg();
        assert!((arg + 0.5).abs() < 0.05, "channel {channel}: {arg}");
    }
}
