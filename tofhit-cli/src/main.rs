//! tofhit command-line tool.
//!
//! Reconstructs TOF hits from CSV digi files.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{ArgAction, Parser, Subcommand};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tofhit_algorithms::{ClusterizerConfig, TofClusterizer};
use tofhit_core::{CalibrationTables, DetectorLayout, DetectorSetup};
use tofhit_io::{DigiFileSummary, DigiReader, HitWriter};

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    TofhitIo(#[from] tofhit_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] tofhit_core::Error),

    #[error("Configuration error: {0}")]
    Json(#[from] serde_json::Error),
}

/// TOF hit reconstruction for RPC detectors.
#[derive(Parser)]
#[command(name = "tofhit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct hits from a digi file
    Process {
        /// Input digi file (CSV)
        input: PathBuf,

        /// Detector setup (JSON)
        #[arg(long)]
        setup: PathBuf,

        /// Calibration tables (JSON); neutral tables if omitted
        #[arg(long)]
        calibration: Option<PathBuf>,

        /// Clusterizer configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output hit file (.csv, otherwise binary)
        #[arg(short, long)]
        output: PathBuf,

        /// Output file for digi match records (CSV)
        #[arg(long)]
        matches: Option<PathBuf>,

        /// Channel deadtime (ns)
        #[arg(long)]
        deadtime: Option<f64>,

        /// Hit history time horizon (ns), 0 disables
        #[arg(long)]
        memory_time: Option<f64>,

        /// Exchange the two readout sides of strip counters
        #[arg(long)]
        swap_sides: bool,

        /// Input times and Tot are in picoseconds
        #[arg(long)]
        times_in_ps: bool,

        /// Dither raw Tot values before calibration
        #[arg(long)]
        dither: bool,

        /// Seed of the Tot dither
        #[arg(long)]
        seed: Option<u64>,

        /// Cluster counters in parallel
        #[arg(long)]
        parallel: bool,
    },

    /// Show information about a digi file
    Info {
        /// Input digi file (CSV)
        input: PathBuf,
    },

    /// Print the flattened counter layout of a detector setup
    Layout {
        /// Detector setup (JSON)
        #[arg(long)]
        setup: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_config(path: Option<&Path>) -> Result<ClusterizerConfig> {
    match path {
        Some(path) => {
            let file = File::open(path)?;
            Ok(serde_json::from_reader(BufReader::new(file))?)
        }
        None => Ok(ClusterizerConfig::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Process {
            input,
            setup,
            calibration,
            config,
            output,
            matches,
            deadtime,
            memory_time,
            swap_sides,
            times_in_ps,
            dither,
            seed,
            parallel,
        } => {
            let setup = DetectorSetup::from_file(&setup)?;
            let layout = DetectorLayout::new(&setup)?;
            let tables = match &calibration {
                Some(path) => CalibrationTables::from_file(path, &layout)?,
                None => CalibrationTables::neutral(&layout),
            };

            let mut config = load_config(config.as_deref())?;
            if let Some(deadtime) = deadtime {
                config.calibrator.channel_deadtime = deadtime;
            }
            if let Some(memory_time) = memory_time {
                config.memory_time = memory_time;
            }
            config.calibrator.swap_channel_sides |= swap_sides;
            config.calibrator.times_in_ps |= times_in_ps;
            config.calibrator.tot_dither |= dither;
            if let Some(seed) = seed {
                config.calibrator.seed = seed;
            }
            config.parallel |= parallel;
            log::info!(
                "{} counters, {} channels",
                layout.n_counters(),
                layout.n_channels_total()
            );
            log::debug!("configuration: {:?}", config);

            let clusterizer = TofClusterizer::from_layout(Arc::new(layout), tables, config)?;
            let mut state = clusterizer.create_state();

            let binary = !output
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            let mut hit_writer = HitWriter::create(&output)?;
            let mut match_writer = matches.as_ref().map(HitWriter::create).transpose()?;

            let start = Instant::now();
            let mut reader = DigiReader::open(&input)?;
            let units = reader.read_units()?;
            if reader.skipped_rows() > 0 {
                log::warn!("{} digi rows with out-of-range address skipped", reader.skipped_rows());
            }
            let mut failed_units = 0usize;

            for unit in &units {
                let out = match clusterizer.process_unit(&unit.digis, &mut state) {
                    Ok(out) => out,
                    Err(e) => {
                        log::error!("unit {} aborted: {}", unit.id, e);
                        failed_units += 1;
                        continue;
                    }
                };
                if binary {
                    hit_writer.write_hits_binary(unit.id, &out.hits)?;
                } else {
                    hit_writer.write_hits_csv(unit.id, &out.hits)?;
                }
                if let Some(writer) = match_writer.as_mut() {
                    writer.write_matches_csv(unit.id, &out.matches)?;
                }
            }
            clusterizer.finish(&mut state)?;
            hit_writer.flush()?;
            if let Some(writer) = match_writer.as_mut() {
                writer.flush()?;
            }

            println!(
                "Processed {} units in {:.2}s",
                units.len(),
                start.elapsed().as_secs_f64()
            );
            if failed_units > 0 {
                println!("Aborted units: {}", failed_units);
            }
            println!("{}", clusterizer.statistics(&state));
        }

        Commands::Info { input } => {
            let mut reader = DigiReader::open(&input)?;
            let units = reader.read_units()?;
            println!("File: {}", input.display());
            print!("{}", DigiFileSummary::from_units(&units));
            if reader.skipped_rows() > 0 {
                println!("skipped rows:   {}", reader.skipped_rows());
            }
        }

        Commands::Layout { setup } => {
            let setup = DetectorSetup::from_file(&setup)?;
            let layout = DetectorLayout::new(&setup)?;
            println!(
                "{} counters, {} channels, beam counter type {}",
                layout.n_counters(),
                layout.n_channels_total(),
                layout.beam_counter_type()
            );
            println!(
                "{:>5} | {:<12} | {:>3} | {:<16} | {:>7} | {:>11} | {:>6} | {:>6} | {:>4}",
                "slot", "counter", "ch", "layout", "v", "cell", "dt", "dx", "dead"
            );
            println!("{:-<96}", "");
            for c in layout.counters() {
                let counter = format!("{}/{}/{}", c.address.sm_type, c.address.sm, c.address.rpc);
                println!(
                    "{:>5} | {:<12} | {:>3} | {:<16} | {:>7.2} | {:>5.2}x{:<5.2} | {:>6.3} | {:>6.3} | {:>4}",
                    c.slot,
                    counter,
                    c.n_channels,
                    format!("{:?}", c.layout),
                    c.signal_velocity,
                    c.cell_size_x,
                    c.cell_size_y,
                    c.max_time_dist,
                    c.max_space_dist,
                    c.dead_strips.count_ones()
                );
            }
        }
    }

    Ok(())
}
