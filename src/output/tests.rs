// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::io::Cursor;

use approx::assert_abs_diff_eq;
use tempfile::NamedTempFile;

use super::*;
use crate::{
    arena::Arena,
    block::{FilteredData, FlagMask},
    correlator::Correlator,
    params::PipelineParams,
};

fn shape() -> BlockShape {
    BlockShape {
        nr_stations: 2,
        nr_polarizations: 2,
        nr_channels: 4,
        nr_taps: 1,
        nr_samples_per_integration: 8,
    }
}

fn epoch(seq: u64) -> Epoch {
    Epoch::from_gpst_seconds(1_090_008_640.0 + seq as f64)
}

fn valid_record(seq: u64) -> OutputRecord {
    let params = PipelineParams::for_testing(shape());
    let arena = Arena::new(params.arena_size).unwrap();
    let mut data = FilteredData::new(&arena, shape()).unwrap();
    data.samples_mut().fill(Complex32::new(1.0, 1.0));
    let mut mask = FlagMask::new(&arena, shape()).unwrap();
    mask.flag_times(1, 0..2);
    let mut correlated = CorrelatedData::new(&arena, shape()).unwrap();
    Correlator::new(&params).correlate(&data, &mask, &mut correlated);
    OutputRecord::new(
        seq,
        epoch(seq),
        &correlated,
        FlagSummary::default(),
        None,
        BlockCounters {
            packets_received: 16,
            packets_rejected: 1,
        },
        3,
    )
}

fn dropped_record(seq: u64) -> OutputRecord {
    OutputRecord::invalid(
        seq,
        epoch(seq),
        &shape(),
        0,
        BlockStatus::Dropped {
            reason: "test".to_string(),
        },
    )
}

fn sequence_numbers(writer: &MemoryWriter) -> Vec<u64> {
    writer.records.iter().map(|r| r.sequence_number).collect()
}

#[test]
fn test_record_accessors() {
    let record = valid_record(5);
    assert!(record.is_valid());
    assert_abs_diff_eq!(record.timestamp().to_gpst_seconds(), epoch(5).to_gpst_seconds());
    assert_eq!(record.visibilities.len(), 3 * 4 * 2 * 2);
    assert_eq!(record.weights.len(), 3 * 4);
    assert_eq!(record.weight(0, 0, 1), 8);
    assert_eq!(record.weight(0, 1, 1), 6);
    assert_eq!(record.weight(1, 1, 3), 6);
    // (1 + i)(1 - i) = 2
    assert_eq!(record.visibility(0, 1, 2, 0, 1), Complex32::new(12.0, 0.0));
    assert_eq!(record.normalised_visibility(0, 1, 2, 1, 0), Some(Complex32::new(2.0, 0.0)));
    assert_eq!(record.counters.packets_received, 16);
    assert_eq!(record.input_flagged_samples, 3);
    assert!(record.beams.is_empty());
}

#[test]
fn test_invalid_record_has_no_data() {
    let record = OutputRecord::invalid(2, epoch(2), &shape(), 2, BlockStatus::Missing);
    assert!(!record.is_valid());
    assert!(record.weights.iter().all(|&w| w == 0));
    assert!(record.visibilities.iter().all(|v| v.re == 0.0 && v.im == 0.0));
    assert_eq!(record.normalised_visibility(0, 1, 0, 0, 0), None);
    assert_eq!(record.flags.excluded_stations, vec![0, 1]);
    assert_eq!(record.beams.len(), 2);
    assert_eq!(record.beams[0].samples.len(), 4 * 8 * 2);
    assert_eq!(record.beams[1].flagged_samples, 4 * 8);
}

#[test]
fn test_assembler_in_order() {
    let mut writer = MemoryWriter::new();
    let mut assembler = OutputAssembler::new(&mut writer, shape(), 0, 10, 4);
    for seq in 10..13 {
        assembler.push(valid_record(seq)).unwrap();
        assert_eq!(assembler.num_pending(), 0);
    }
    assert_eq!(assembler.next_sequence_number(), 13);
    let stats = assembler.finish(None).unwrap();
    assert_eq!(stats.written, 3);
    assert_eq!(stats.valid, 3);
    assert_eq!(sequence_numbers(&writer), vec![10, 11, 12]);
    assert!(writer.finished);
}

#[test]
fn test_assembler_reorders() {
    let mut writer = MemoryWriter::new();
    let mut assembler = OutputAssembler::new(&mut writer, shape(), 0, 0, 8);
    for seq in [2, 0, 3, 1, 4] {
        assembler.push(valid_record(seq)).unwrap();
    }
    assert_eq!(assembler.num_pending(), 0);
    assembler.finish(None).unwrap();
    assert_eq!(sequence_numbers(&writer), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_assembler_fills_gaps() {
    let mut writer = MemoryWriter::new();
    let mut assembler = OutputAssembler::new(&mut writer, shape(), 0, 0, 2);
    assembler.push(valid_record(0)).unwrap();
    // 1 never arrives; 2 and 3 wait for it, and when 4 arrives there are too
    // many waiting.
    assembler.push(valid_record(2)).unwrap();
    assembler.push(dropped_record(3)).unwrap();
    assert_eq!(assembler.num_pending(), 2);
    assembler.push(valid_record(4)).unwrap();
    assert_eq!(assembler.num_pending(), 0);
    assert_eq!(assembler.next_sequence_number(), 5);

    // Too late now.
    assembler.push(valid_record(1)).unwrap();

    // 5 and 6 never arrive either.
    let stats = assembler.finish(Some(7)).unwrap();
    assert_eq!(
        stats,
        AssemblyStats {
            written: 7,
            valid: 3,
            missing: 3,
            dropped: 1,
            discarded: 1,
        }
    );
    assert_eq!(sequence_numbers(&writer), (0..7).collect::<Vec<_>>());
    assert_eq!(writer.records[1].status, BlockStatus::Missing);
    // A missing record takes the timestamp of the next known block.
    assert_abs_diff_eq!(writer.records[1].gps_time, epoch(2).to_gpst_seconds());
    assert!(matches!(writer.records[3].status, BlockStatus::Dropped { .. }));
    assert!(writer.records[4].is_valid());
}

#[test]
fn test_assembler_finish_flushes_pending() {
    let mut writer = MemoryWriter::new();
    let mut assembler = OutputAssembler::new(&mut writer, shape(), 0, 0, 16);
    assembler.push(valid_record(3)).unwrap();
    assembler.push(valid_record(1)).unwrap();
    let stats = assembler.finish(None).unwrap();
    assert_eq!(stats.missing, 2);
    assert_eq!(sequence_numbers(&writer), vec![0, 1, 2, 3]);
}

#[test]
fn test_writers_reject_disorder() {
    let mut writer = MemoryWriter::new();
    writer.write(&valid_record(1)).unwrap();
    let result = writer.write(&valid_record(1));
    assert!(matches!(
        result,
        Err(StorageError::NotMonotonic {
            previous: 1,
            got: 1
        })
    ));

    let mut writer = JsonLinesWriter::new(Cursor::new(vec![]));
    writer.write(&valid_record(4)).unwrap();
    assert!(writer.write(&valid_record(2)).is_err());
}

#[test]
fn test_json_lines_round_trip() {
    let file = NamedTempFile::new().unwrap();
    let mut writer = JsonLinesWriter::create(file.path()).unwrap();
    let records = vec![valid_record(0), dropped_record(1)];
    for record in &records {
        writer.write(record).unwrap();
    }
    writer.finish().unwrap();
    drop(writer);

    let read = read_json_lines(file.path()).unwrap();
    assert_eq!(read, records);
    let contents = std::fs::read_to_string(file.path()).unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert!(contents.contains(r#""kind":"dropped""#));
}
