// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code. Options for each subcommand are contained in
//! their own modules.
//!
//! Only 3 things should be public in this module: `Correlator`,
//! `Correlator::run`, and `CorrelatorError`.

mod error;
mod simulate;
mod verify_config;

pub use error::CorrelatorError;

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use clap::{AppSettings, Args, Parser, Subcommand};
use log::info;

use crate::{
    config::CorrelatorConfig,
    params::{block_footprint, max_blocks_in_flight, PipelineParams},
    PROGRESS_BARS,
};

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    about = "Real-time polyphase filter bank, RFI flagger, beamformer and correlator for station data"
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
#[clap(infer_long_args = true)]
pub struct Correlator {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Don't draw progress bars.
    #[clap(long)]
    #[clap(global = true)]
    no_progress_bars: bool,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,

    /// Only verify that arguments were correctly ingested and print out
    /// high-level information.
    #[clap(long)]
    #[clap(global = true)]
    dry_run: bool,

    /// Save the configuration, with defaults filled in, into a new TOML file
    /// that can be used to reproduce this run.
    #[clap(long)]
    #[clap(global = true)]
    save_toml: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    #[clap(about = "Run the pipeline over synthetic station data and write the output records.")]
    Simulate(simulate::SimulateArgs),

    #[clap(alias = "check-config")]
    #[clap(about = "Read and validate a configuration file, and print the resulting block shapes and memory budget.")]
    VerifyConfig(verify_config::VerifyConfigArgs),
}

impl Correlator {
    pub fn run(self) -> Result<(), CorrelatorError> {
        // Set up logging.
        let GlobalArgs {
            verbosity,
            dry_run,
            no_progress_bars,
            save_toml,
        } = self.global_opts;
        setup_logging(verbosity).expect("Failed to initialise logging.");
        // Enable progress bars if the user didn't say "no progress bars".
        if !no_progress_bars {
            PROGRESS_BARS.store(true);
        }

        // Print the version and build-time information.
        let sub_command = match &self.command {
            Command::Simulate(_) => "simulate",
            Command::VerifyConfig(_) => "verify-config",
        };
        info!(
            "rtcp_correlator {} {}",
            sub_command,
            env!("CARGO_PKG_VERSION")
        );
        display_build_info();

        match self.command {
            Command::Simulate(args) => args.run(dry_run, save_toml.as_deref())?,
            Command::VerifyConfig(args) => args.run(save_toml.as_deref())?,
        }

        info!("rtcp_correlator {} complete.", sub_command);
        Ok(())
    }
}

/// Read a configuration file if one was given, and check it.
fn read_config(
    file: Option<&Path>,
    save_toml: Option<&Path>,
) -> Result<PipelineParams, CorrelatorError> {
    let config = match file {
        Some(file) => {
            info!("Reading configuration from {}", file.display());
            CorrelatorConfig::read(file)?
        }
        None => {
            info!("No configuration file given; using defaults");
            CorrelatorConfig::default()
        }
    };
    let params = config.validate()?;

    if let Some(toml) = save_toml {
        let mut f = BufWriter::new(File::create(toml)?);
        let toml_str = toml::to_string(&CorrelatorConfig::from(&params))
            .map_err(|e| CorrelatorError::Generic(e.to_string()))?;
        f.write_all(toml_str.as_bytes())?;
        info!("Saved configuration to {}", toml.display());
    }

    Ok(params)
}

/// Print high-level information on the pipeline that `params` describe.
fn display_params(params: &PipelineParams) {
    let shape = &params.shape;
    info!(
        "{} stations, {} polarisations, {} baselines",
        shape.nr_stations,
        shape.nr_polarizations,
        shape.nr_baselines()
    );
    info!(
        "Subband centred on {:.3} MHz, {:.3} kHz wide, delivered as {}",
        params.subband_frequency / 1e6,
        params.subband_bandwidth / 1e3,
        params.sample_format
    );
    info!(
        "{} channels of {:.3} kHz, {} taps ({} window, delay compensation {})",
        shape.nr_channels,
        params.channel_bandwidth() / 1e3,
        shape.nr_taps,
        params.filter.window,
        if params.filter.delay_compensation {
            "on"
        } else {
            "off"
        }
    );
    info!(
        "{} samples per integration; each block is {} and holds {} raw samples per station",
        shape.nr_samples_per_integration,
        params.block_duration(),
        shape.nr_input_samples()
    );
    match params.flagger.as_ref() {
        Some(f) => info!(
            "RFI flagging: {} strategy, {} baseline, cutoff {}, {} flagged samples",
            f.strategy, f.estimator, f.cutoff, f.policy
        ),
        None => info!("RFI flagging: off"),
    }
    match params.beamformer.as_ref() {
        Some(b) => info!(
            "Beamforming: {} beams, at least {} stations per beam sample",
            b.beams.len(),
            b.min_stations
        ),
        None => info!("Beamforming: off"),
    }
    let in_flight = max_blocks_in_flight(params.queue_depth, params.nr_correlator_workers);
    info!(
        "Queue depth {}, {} correlator workers; up to {} blocks in flight",
        params.queue_depth, params.nr_correlator_workers, in_flight
    );
    info!(
        "Each block needs {} of arena; the arena is {}",
        bytes(block_footprint(shape, params.nr_beams())),
        bytes(params.arena_size)
    );
}

fn bytes(n: usize) -> String {
    let n = n as f64;
    if n >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} GiB", n / 1024.0 / 1024.0 / 1024.0)
    } else if n >= 1024.0 * 1024.0 {
        format!("{:.2} MiB", n / 1024.0 / 1024.0)
    } else if n >= 1024.0 {
        format!("{:.2} KiB", n / 1024.0)
    } else {
        format!("{n} B")
    }
}

/// Activate a logger. All log messages are put onto `stdout`. `env_logger`
/// automatically only uses colours and fancy symbols if we're on a tty (e.g. a
/// terminal); piped output will be formatted sensibly. Source code lines are
/// displayed in log messages when verbosity >= 3.
fn setup_logging(verbosity: u8) -> Result<(), log::SetLoggerError> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                use std::io::Write;

                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.try_init()
}

/// Write many info-level log lines of how this executable was compiled.
fn display_build_info() {
    let dirty = match GIT_DIRTY {
        Some(true) => " (dirty)",
        _ => "",
    };
    match GIT_COMMIT_HASH_SHORT {
        Some(hash) => {
            info!("Compiled on git commit hash: {hash}{dirty}");
        }
        None => info!("Compiled on git commit hash: <no git info>"),
    }
    if let Some(hr) = GIT_HEAD_REF {
        info!("            git head ref: {}", hr);
    }
    info!("            {}", BUILT_TIME_UTC);
    info!("         with compiler {}", RUSTC_VERSION);
    info!("");
}
