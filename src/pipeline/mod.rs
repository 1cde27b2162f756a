// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The streaming pipeline.
//!
//! Each stage runs on its own thread and hands blocks to the next through a
//! bounded [`Queue`]:
//!
//! ```text
//! ingest -> filter -> flag -> correlate (x N) -> output
//! ```
//!
//! The filter stage is the only place where sequence numbers are checked.
//! Every sequence number from the first onwards leaves it exactly once,
//! either with data or as an invalid (missing or dropped) block, so the
//! output stage sees a gap-free sequence, possibly out of order because of
//! the parallel correlator workers.

mod error;

pub use error::PipelineError;

use std::thread::{self, ScopedJoinHandle};

use crossbeam_utils::atomic::AtomicCell;
use hifitime::Epoch;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use scopeguard::defer_on_unwind;

use crate::{
    arena::{Arena, ArenaError},
    beamformer::{BeamFormedData, Beamformer},
    block::{BlockCounters, BlockError, FilteredData, FlagMask, InputBlock, SampleBuffer},
    constants::MAX_PENDING_OUTPUT_RECORDS,
    correlator::{CorrelatedData, Correlator},
    filter_bank::PolyphaseFilterBank,
    flagging::{FlagSummary, Flagger},
    output::{
        AssemblyStats, BlockStatus, OutputAssembler, OutputRecord, StorageError, StorageWriter,
    },
    params::{block_footprint, BlockShape, PipelineParams},
    queue::{Consumer, Queue},
    PROGRESS_BARS,
};

/// What travels with a block from stage to stage.
#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    sequence_number: u64,
    timestamp: Epoch,
    counters: BlockCounters,
    input_flagged_samples: u64,
}

struct Flagged {
    data: FilteredData,
    mask: FlagMask,
    summary: FlagSummary,
}

enum Work<T> {
    Block(BlockHeader, T),
    Invalid(BlockHeader, BlockStatus),
}

/// What happened during [`Pipeline::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Blocks submitted by ingestion.
    pub blocks_received: u64,

    /// Blocks submitted with a sequence number that had already passed; these
    /// are discarded.
    pub blocks_out_of_order: u64,

    pub output: AssemblyStats,
}

#[derive(Default)]
struct FilterStats {
    received: u64,
    out_of_order: u64,
}

pub struct Pipeline {
    params: PipelineParams,
    arena: Arena,
    filter_bank: PolyphaseFilterBank,
    flagger: Flagger,
    beamformer: Option<Beamformer>,
    correlator: Correlator,
}

impl Pipeline {
    /// Build every stage. Anything wrong with the parameters is detected here,
    /// before any data is processed.
    pub fn new(params: PipelineParams) -> Result<Pipeline, PipelineError> {
        let shape = params.shape;
        if shape.nr_stations == 0 {
            return Err(PipelineError::Empty("station"));
        }
        if shape.nr_polarizations == 0 {
            return Err(PipelineError::Empty("polarisation"));
        }
        if shape.nr_samples_per_integration == 0 {
            return Err(PipelineError::Empty("sample per integration"));
        }
        if params.nr_correlator_workers == 0 {
            return Err(PipelineError::Empty("correlator worker"));
        }
        let needed = block_footprint(&shape, params.nr_beams());
        if params.arena_size < needed {
            return Err(PipelineError::ArenaTooSmall {
                needed,
                available: params.arena_size,
            });
        }

        let filter_bank = PolyphaseFilterBank::new(&params)?;
        let arena = Arena::new(params.arena_size)?;
        debug!(
            "Pipeline arena: {} bytes, {} bytes per block",
            arena.size(),
            needed
        );
        Ok(Pipeline {
            flagger: Flagger::new(&params),
            beamformer: Beamformer::new(&params),
            correlator: Correlator::new(&params),
            filter_bank,
            arena,
            params,
        })
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Process a stream of blocks.
    ///
    /// `ingest` runs on its own thread; it gets blocks from the
    /// [`SampleBuffer`], fills and submits them, and returns when the stream
    /// ends. Every processed block is written to `writer` in sequence-number
    /// order. If `nr_blocks` is given, blocks that never arrived before the
    /// stream ended are written as missing, up to the first sequence number
    /// plus `nr_blocks`.
    ///
    /// Filter state carries over to the next call, which continues the stream.
    pub fn run<F, W>(
        &mut self,
        ingest: F,
        writer: &mut W,
        nr_blocks: Option<u64>,
    ) -> Result<RunSummary, PipelineError>
    where
        F: FnOnce(SampleBuffer) + Send,
        W: StorageWriter + ?Sized,
    {
        let Pipeline {
            params,
            arena,
            filter_bank,
            flagger,
            beamformer,
            correlator,
        } = self;
        let shape = params.shape;
        let nr_beams = params.nr_beams();
        let first = params.first_sequence_number;
        let block_duration = params.block_duration().to_seconds();
        let beamformer = beamformer.as_ref();
        let correlator = &*correlator;
        let arena = &*arena;

        let (tx_input, rx_input) = Queue::<InputBlock>::bounded(params.queue_depth).split();
        let (tx_filtered, rx_filtered) =
            Queue::<Work<FilteredData>>::bounded(params.queue_depth).split();
        let (tx_flagged, rx_flagged) = Queue::<Work<Flagged>>::bounded(params.queue_depth).split();
        let (tx_output, rx_output) = Queue::<OutputRecord>::bounded(params.queue_depth).split();
        let buffer = SampleBuffer::new(arena.clone(), shape, tx_input);

        // Progress bars.
        let multi_progress = MultiProgress::with_draw_target(if PROGRESS_BARS.load() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        });
        let len = nr_blocks.unwrap_or(0);
        let filter_progress = multi_progress.add(progress_bar(len, "Channelising"));
        let correlate_progress = multi_progress.add(progress_bar(len, "Correlating"));
        let write_progress = multi_progress.add(progress_bar(len, "Writing"));

        // Use a variable to track whether any threads have an issue.
        let error = AtomicCell::new(false);
        let error = &error;

        info!(
            "Processing {} stations, {} channels, {} samples per integration",
            shape.nr_stations, shape.nr_channels, shape.nr_samples_per_integration
        );
        let scoped_threads_result: Result<RunSummary, PipelineError> = thread::scope(|scope| {
            let ingest_handle = thread::Builder::new()
                .name("ingest".to_string())
                .spawn_scoped(scope, || {
                    defer_on_unwind! { error.store(true); }
                    ingest(buffer);
                    debug!("Ingestion finished");
                })
                .expect("OS can create threads");

            let filter_handle: ScopedJoinHandle<FilterStats> = thread::Builder::new()
                .name("filter".to_string())
                .spawn_scoped(scope, || {
                    defer_on_unwind! { error.store(true); }
                    // Owning the receiver means that ingestion is told when
                    // this thread exits.
                    let rx_input = rx_input;
                    filter_progress.tick();

                    let mut stats = FilterStats::default();
                    let mut expected = first;
                    for block in rx_input.iter() {
                        if error.load() {
                            break;
                        }
                        stats.received += 1;
                        let seq = block.sequence_number;
                        if seq < expected {
                            warn!(
                                "{}",
                                BlockError::OutOfOrder {
                                    sequence_number: seq,
                                    expected
                                }
                            );
                            stats.out_of_order += 1;
                            continue;
                        }

                        if seq > expected {
                            debug!("Blocks {expected} to {} never arrived", seq - 1);
                            let t = block.timestamp.to_gpst_seconds();
                            for missing in expected..seq {
                                let header = BlockHeader {
                                    sequence_number: missing,
                                    timestamp: Epoch::from_gpst_seconds(
                                        t - (seq - missing) as f64 * block_duration,
                                    ),
                                    counters: BlockCounters::default(),
                                    input_flagged_samples: 0,
                                };
                                // If we can't send the message, it's because
                                // the channel has been closed on the other
                                // side, which only happens when a later stage
                                // has exited; in that case, just exit.
                                if tx_filtered
                                    .append(Work::Invalid(header, BlockStatus::Missing))
                                    .is_err()
                                {
                                    return stats;
                                }
                                filter_progress.inc(1);
                            }
                            // The delay lines no longer hold the samples
                            // preceding this block.
                            filter_bank.reset();
                        }
                        expected = seq + 1;

                        let header = BlockHeader {
                            sequence_number: seq,
                            timestamp: block.timestamp,
                            counters: block.counters,
                            input_flagged_samples: block
                                .metadata
                                .iter()
                                .map(|m| m.flags.count() as u64)
                                .sum(),
                        };
                        let result = FilteredData::new(arena, shape)
                            .map_err(BlockError::from)
                            .and_then(|mut data| {
                                filter_bank.filter(&block, &mut data)?;
                                Ok(data)
                            });
                        // Free the raw samples before waiting on the next
                        // stage.
                        drop(block);
                        let work = match result {
                            Ok(data) => Work::Block(header, data),
                            Err(e) => {
                                warn!("Dropping block {seq}: {e}");
                                filter_bank.reset();
                                Work::Invalid(
                                    header,
                                    BlockStatus::Dropped {
                                        reason: e.to_string(),
                                    },
                                )
                            }
                        };
                        if tx_filtered.append(work).is_err() {
                            return stats;
                        }
                        filter_progress.inc(1);
                    }

                    drop(tx_filtered);
                    debug!("Finished channelising");
                    filter_progress.abandon_with_message("Finished channelising");
                    stats
                })
                .expect("OS can create threads");

            let flag_handle = thread::Builder::new()
                .name("flag".to_string())
                .spawn_scoped(scope, || {
                    defer_on_unwind! { error.store(true); }
                    let rx_filtered = rx_filtered;

                    for work in rx_filtered.iter() {
                        let work = match work {
                            Work::Block(header, mut data) => match FlagMask::new(arena, shape) {
                                Ok(mut mask) => {
                                    let summary = flagger.flag(&mut data, &mut mask);
                                    if !summary.excluded_stations.is_empty() {
                                        debug!(
                                            "Block {}: stations {:?} are excluded",
                                            header.sequence_number, summary.excluded_stations
                                        );
                                    }
                                    Work::Block(
                                        header,
                                        Flagged {
                                            data,
                                            mask,
                                            summary,
                                        },
                                    )
                                }
                                Err(e) => {
                                    warn!("Dropping block {}: {e}", header.sequence_number);
                                    Work::Invalid(
                                        header,
                                        BlockStatus::Dropped {
                                            reason: e.to_string(),
                                        },
                                    )
                                }
                            },
                            Work::Invalid(header, status) => Work::Invalid(header, status),
                        };
                        if tx_flagged.append(work).is_err() {
                            return;
                        }
                    }
                    drop(tx_flagged);
                    debug!("Finished flagging");
                })
                .expect("OS can create threads");

            let worker_handles = (0..params.nr_correlator_workers)
                .map(|i| {
                    let rx = rx_flagged.clone();
                    let tx = tx_output.clone();
                    let correlate_progress = &correlate_progress;
                    thread::Builder::new()
                        .name(format!("correlate{i}"))
                        .spawn_scoped(scope, move || {
                            defer_on_unwind! { error.store(true); }
                            correlate_progress.tick();

                            for work in rx.iter() {
                                if error.load() {
                                    return;
                                }
                                let record = match work {
                                    Work::Block(header, flagged) => correlate_block(
                                        arena, shape, beamformer, correlator, header, flagged,
                                    )
                                    .unwrap_or_else(|e| {
                                        warn!("Dropping block {}: {e}", header.sequence_number);
                                        OutputRecord::invalid(
                                            header.sequence_number,
                                            header.timestamp,
                                            &shape,
                                            nr_beams,
                                            BlockStatus::Dropped {
                                                reason: e.to_string(),
                                            },
                                        )
                                    }),
                                    Work::Invalid(header, status) => OutputRecord::invalid(
                                        header.sequence_number,
                                        header.timestamp,
                                        &shape,
                                        nr_beams,
                                        status,
                                    ),
                                };
                                if tx.append(record).is_err() {
                                    return;
                                }
                                correlate_progress.inc(1);
                            }
                        })
                        .expect("OS can create threads")
                })
                .collect::<Vec<_>>();
            // Only the workers may keep these queues open.
            drop(rx_flagged);
            drop(tx_output);

            let output_handle = thread::Builder::new()
                .name("output".to_string())
                .spawn_scoped(scope, || {
                    defer_on_unwind! { error.store(true); }
                    write_progress.tick();

                    let assembler = OutputAssembler::new(
                        writer,
                        shape,
                        nr_beams,
                        first,
                        MAX_PENDING_OUTPUT_RECORDS,
                    );
                    let end = nr_blocks.map(|n| first + n);
                    let result = write_records(assembler, &rx_output, end, &write_progress);
                    if result.is_err() {
                        error.store(true);
                    }
                    drop(rx_output);
                    write_progress.abandon_with_message("Finished writing");
                    result
                })
                .expect("OS can create threads");

            // Join all thread handles. This propagates any errors and lets us
            // know if any threads panicked.
            ingest_handle.join().unwrap();
            let filter_stats = filter_handle.join().unwrap();
            flag_handle.join().unwrap();
            for handle in worker_handles {
                handle.join().unwrap();
            }
            correlate_progress.abandon_with_message("Finished correlating");
            let output = output_handle.join().unwrap()?;

            info!(
                "Wrote {} records ({} valid, {} missing, {} dropped)",
                output.written, output.valid, output.missing, output.dropped
            );
            Ok(RunSummary {
                blocks_received: filter_stats.received,
                blocks_out_of_order: filter_stats.out_of_order,
                output,
            })
        });
        scoped_threads_result
    }
}

fn progress_bar(len: u64, message: &'static str) -> ProgressBar {
    ProgressBar::new(len)
        .with_style(
            ProgressStyle::default_bar()
                .template(
                    "{msg:18}: [{wide_bar:.blue}] {pos:2}/{len:2} blocks ({elapsed_precise}<{eta_precise})",
                )
                .unwrap()
                .progress_chars("=> "),
        )
        .with_position(0)
        .with_message(message)
}

/// Beamform and correlate one block.
fn correlate_block(
    arena: &Arena,
    shape: BlockShape,
    beamformer: Option<&Beamformer>,
    correlator: &Correlator,
    header: BlockHeader,
    flagged: Flagged,
) -> Result<OutputRecord, ArenaError> {
    let Flagged {
        data,
        mask,
        summary,
    } = flagged;
    let beams = match beamformer {
        Some(beamformer) => {
            let mut beams = BeamFormedData::new(arena, shape, beamformer.nr_beams())?;
            beamformer.form(&data, &mask, &mut beams);
            Some(beams)
        }
        None => None,
    };
    let mut correlated = CorrelatedData::new(arena, shape)?;
    correlator.correlate(&data, &mask, &mut correlated);
    Ok(OutputRecord::new(
        header.sequence_number,
        header.timestamp,
        &correlated,
        summary,
        beams.as_ref(),
        header.counters,
        header.input_flagged_samples,
    ))
}

fn write_records<W: StorageWriter + ?Sized>(
    mut assembler: OutputAssembler<W>,
    rx: &Consumer<OutputRecord>,
    end: Option<u64>,
    progress: &ProgressBar,
) -> Result<AssemblyStats, StorageError> {
    let first = assembler.next_sequence_number();
    for record in rx.iter() {
        assembler.push(record)?;
        progress.set_position(assembler.next_sequence_number() - first);
    }
    assembler.finish(end)
}
