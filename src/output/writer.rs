// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Storage writers. The pipeline only relies on [`StorageWriter`]; the
//! writers here are a JSON Lines file and an in-memory record list.

use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use log::trace;

use super::{OutputRecord, StorageError};

/// Something that persists output records. Records are handed over in
/// sequence-number order.
pub trait StorageWriter: Send {
    fn write(&mut self, record: &OutputRecord) -> Result<(), StorageError>;

    /// Called once, after the last record.
    fn finish(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Checks that each sequence number follows the previous one.
fn check_order(previous: &mut Option<u64>, record: &OutputRecord) -> Result<(), StorageError> {
    let got = record.sequence_number;
    if let Some(previous) = *previous {
        if got <= previous {
            return Err(StorageError::NotMonotonic { previous, got });
        }
    }
    *previous = Some(got);
    Ok(())
}

/// One JSON object per record, one record per line.
pub struct JsonLinesWriter<W: Write + Send> {
    writer: W,
    previous: Option<u64>,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(writer: W) -> JsonLinesWriter<W> {
        JsonLinesWriter {
            writer,
            previous: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let file = File::create(path)?;
        Ok(JsonLinesWriter::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> StorageWriter for JsonLinesWriter<W> {
    fn write(&mut self, record: &OutputRecord) -> Result<(), StorageError> {
        check_order(&mut self.previous, record)?;
        trace!("Writing record {}", record.sequence_number);
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every record.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    pub records: Vec<OutputRecord>,
    previous: Option<u64>,
    pub finished: bool,
}

impl MemoryWriter {
    pub fn new() -> MemoryWriter {
        MemoryWriter::default()
    }
}

impl StorageWriter for MemoryWriter {
    fn write(&mut self, record: &OutputRecord) -> Result<(), StorageError> {
        check_order(&mut self.previous, record)?;
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StorageError> {
        self.finished = true;
        Ok(())
    }
}

/// Read back the records of a JSON Lines file. Blank lines are skipped.
pub fn read_json_lines<P: AsRef<Path>>(path: P) -> Result<Vec<OutputRecord>, StorageError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = vec![];
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
