// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Run the pipeline over synthetic station data.

use std::path::{Path, PathBuf};

use clap::Parser;
use hifitime::Epoch;
use log::{info, warn};

use super::{display_params, read_config, CorrelatorError};
use crate::{
    output::JsonLinesWriter,
    pipeline::Pipeline,
    simulate::{RfiBurst, SyntheticSource},
};

const DEFAULT_OUTPUT_FILENAME: &str = "correlated.jsonl";
const DEFAULT_NUM_BLOCKS: u64 = 16;
const DEFAULT_START_GPS: f64 = 1_090_008_640.0;
const DEFAULT_TONE_AMPLITUDE: f32 = 100.0;
const DEFAULT_NOISE: f32 = 10.0;

lazy_static::lazy_static! {
    static ref OUTPUT_HELP: String =
        format!("Path to the output records (JSON Lines). Default: {DEFAULT_OUTPUT_FILENAME}");

    static ref NUM_BLOCKS_HELP: String =
        format!("The number of blocks (integration periods) to simulate. Default: {DEFAULT_NUM_BLOCKS}");

    static ref START_HELP: String =
        format!("The GPS time of the first block [seconds]. Default: {DEFAULT_START_GPS}");

    static ref TONE_AMPLITUDE_HELP: String =
        format!("The amplitude of every tone. Default: {DEFAULT_TONE_AMPLITUDE}");

    static ref NOISE_HELP: String =
        format!("The standard deviation of the noise in each of the real and imaginary parts. Default: {DEFAULT_NOISE}");
}

#[derive(Parser, Debug, Clone, Default)]
pub(super) struct SimulateArgs {
    /// Path to the configuration file (toml or json). If not given, defaults
    /// are used.
    #[clap(name = "CONFIG_FILE", parse(from_os_str))]
    config: Option<PathBuf>,

    #[clap(short, long, help = OUTPUT_HELP.as_str(), help_heading = "OUTPUT FILES")]
    output: Option<PathBuf>,

    #[clap(short = 'n', long, help = NUM_BLOCKS_HELP.as_str(), help_heading = "STATION DATA")]
    num_blocks: Option<u64>,

    #[clap(long, help = START_HELP.as_str(), help_heading = "STATION DATA")]
    start_gps: Option<f64>,

    /// The seed of the noise generator.
    #[clap(long, default_value = "0", help_heading = "STATION DATA")]
    seed: u64,

    /// Tone frequencies relative to the subband centre [Hz], comma separated.
    /// Negative offsets must be attached with '=', e.g. --tones=-1000,2000.
    #[clap(long, use_value_delimiter = true, help_heading = "STATION DATA")]
    tones: Vec<f64>,

    #[clap(long, help = TONE_AMPLITUDE_HELP.as_str(), help_heading = "STATION DATA")]
    tone_amplitude: Option<f32>,

    /// The phase added to every tone at each station [radians], comma
    /// separated.
    #[clap(long, use_value_delimiter = true, help_heading = "STATION DATA")]
    station_phases: Vec<f64>,

    #[clap(long, help = NOISE_HELP.as_str(), help_heading = "STATION DATA")]
    noise: Option<f32>,

    /// Sequence numbers of blocks that are never delivered.
    #[clap(long, multiple_values(true), help_heading = "IMPAIRMENTS")]
    missing: Vec<u64>,

    /// Sequence numbers of blocks in which the first station gets a burst of
    /// RFI over the first quarter of its samples.
    #[clap(long, multiple_values(true), help_heading = "IMPAIRMENTS")]
    rfi: Vec<u64>,
}

impl SimulateArgs {
    pub(super) fn run(self, dry_run: bool, save_toml: Option<&Path>) -> Result<(), CorrelatorError> {
        let params = read_config(self.config.as_deref(), save_toml)?;
        display_params(&params);

        let num_blocks = self.num_blocks.unwrap_or(DEFAULT_NUM_BLOCKS);
        let output = self
            .output
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_FILENAME));
        let start = Epoch::from_gpst_seconds(self.start_gps.unwrap_or(DEFAULT_START_GPS));
        let noise = self.noise.unwrap_or(DEFAULT_NOISE);
        let tone_amplitude = self.tone_amplitude.unwrap_or(DEFAULT_TONE_AMPLITUDE);

        let mut source = SyntheticSource::new(&params, start, self.seed)
            .with_noise(noise)
            .with_station_phases(self.station_phases);
        for &offset in &self.tones {
            if offset.abs() > params.subband_bandwidth / 2.0 {
                warn!("Tone at {offset} Hz is outside the subband and will alias");
            }
            source = source.with_tone(offset, tone_amplitude);
        }
        source.missing = self.missing;
        let burst_len = params.shape.nr_input_samples() / 4;
        source.rfi = self
            .rfi
            .iter()
            .map(|&sequence_number| RfiBurst {
                sequence_number,
                station: 0,
                samples: 0..burst_len.max(1),
                amplitude: noise.max(1.0) * 100.0,
            })
            .collect();

        info!(
            "Simulating {num_blocks} blocks from GPS {:.3}, {} tones, noise {noise}",
            start.to_gpst_seconds(),
            source.tones.len()
        );
        info!("Writing records to {}", output.display());

        if dry_run {
            info!("Dry run -- exiting now.");
            return Ok(());
        }

        let mut pipeline = Pipeline::new(params)?;
        let mut writer = JsonLinesWriter::create(&output)?;
        let summary = pipeline.run(
            |buffer| {
                source.feed(buffer, num_blocks);
            },
            &mut writer,
            Some(num_blocks),
        )?;

        info!(
            "Received {} blocks ({} out of order)",
            summary.blocks_received, summary.blocks_out_of_order
        );
        let stats = summary.output;
        info!(
            "Wrote {} records: {} valid, {} missing, {} dropped",
            stats.written, stats.valid, stats.missing, stats.dropped
        );
        if stats.discarded > 0 {
            warn!("{} late records were discarded", stats.discarded);
        }
        Ok(())
    }
}
