use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod combine;
mod config;
mod database;
mod error;
mod frame;
mod matcher;
mod obstatus;
mod policy;
mod report;
mod scheduler;
mod stage;
mod state;
mod tasks;
#[cfg(test)]
mod testutil;

use config::PipelineConfig;
use frame::{Classifier, FitsHeaders, discover_frames};
use obstatus::{ObStatus, ObStatusStore};
use scheduler::{Pipeline, RunOptions};
use tasks::CommandTasks;

pub type Result<T> = anyhow::Result<T>;

#[derive(Parser)]
#[command(name = "longslit-redux")]
#[command(about = "Longslit spectroscopic reduction pipeline", long_about = None)]
struct Cli {
    /// Log debug messages (RUST_LOG still applies).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an options file with every default spelled out.
    Init {
        #[arg(default_value = "options.toml")]
        out: PathBuf,

        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },

    /// Classify raw frames (files or directories) into a tagged database.
    Classify {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[arg(short = 'o', long, default_value = "dataset.json")]
        out: PathBuf,

        /// Options file with instrument keywords and standard-star names.
        #[arg(long)]
        options: Option<PathBuf>,
    },

    /// Build calibrations, reduce every pending OB and combine the results.
    Run {
        options: PathBuf,

        /// Reprocess OBs marked DONE.
        #[arg(short, long)]
        force: bool,

        /// Enable interactive identification and extraction.
        #[arg(short, long)]
        interactive: bool,

        /// Only reduce these objects (implies --force).
        #[arg(long = "object", value_name = "NAME")]
        objects: Vec<String>,

        #[arg(long)]
        make_bias: bool,

        #[arg(long)]
        make_flat: bool,

        #[arg(long)]
        make_arcs: bool,

        #[arg(long)]
        make_response: bool,
    },

    /// List OB statuses, or reset some of them to PENDING.
    Status {
        obd: PathBuf,

        #[arg(long = "reset", value_name = "KEY")]
        reset: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    match cli.cmd {
        Commands::Init { out, force } => {
            if out.exists() && !force {
                bail!("{} exists; use --force to overwrite", out.display());
            }
            std::fs::write(&out, PipelineConfig::default_toml()?)
                .with_context(|| format!("writing {}", out.display()))?;
            println!("Wrote {}", out.display());
        }

        Commands::Classify {
            paths,
            out,
            options,
        } => {
            let config = match &options {
                Some(path) => PipelineConfig::load(path)?,
                None => PipelineConfig::default(),
            };
            let files = discover_frames(&paths)?;
            let headers = FitsHeaders::new(config.instrument.clone());
            let classifier = Classifier::new(&headers, &config.instrument.standard_stars);
            let db = classifier.classify(&files)?;
            if db.is_empty() {
                bail!("no FITS frames found in the given paths");
            }
            db.save(&out)
                .with_context(|| format!("writing {}", out.display()))?;

            for tag in db.tags() {
                println!("{:<14} {:>4}", tag, db.count(tag));
            }
            println!("Wrote {} ({} frames)", out.display(), db.len());
        }

        Commands::Run {
            options,
            force,
            interactive,
            objects,
            make_bias,
            make_flat,
            make_arcs,
            make_response,
        } => {
            let mut config = PipelineConfig::load(&options)
                .with_context(|| format!("loading options {}", options.display()))?;
            if interactive {
                config.set_interactive();
            }
            let run = RunOptions {
                force,
                objects,
                make_bias,
                make_flat,
                make_arcs,
                make_response,
            };

            let headers = FitsHeaders::new(config.instrument.clone());
            let mut tasks = CommandTasks::new(config.tasks.clone());
            let mut pipeline = Pipeline::new(&config, &headers, &mut tasks);
            let summary = pipeline.run(&run).context("reduction aborted")?;

            if summary.calibrations_only {
                println!("Static calibrations finished");
            } else {
                println!(
                    "Reduced {} OBs, skipped {}; combined {} groups, linked {}",
                    summary.reduced, summary.skipped, summary.combined, summary.linked
                );
            }
            if summary.warnings > 0 {
                println!("{} warnings; see pipeline.log files", summary.warnings);
            }
        }

        Commands::Status { obd, reset } => {
            let store = ObStatusStore::new(&obd);
            let map = store
                .load()
                .with_context(|| format!("reading {}", obd.display()))?;

            if reset.is_empty() {
                let width = map.keys().map(String::len).max().unwrap_or(0);
                for (key, status) in &map {
                    println!("{:<width$}  {}", key, status, width = width);
                }
            }
            for key in &reset {
                if !map.contains_key(key) {
                    bail!("unknown OB {} in {}", key, obd.display());
                }
                store.update(key, ObStatus::Pending)?;
                println!("{}  {}", key, ObStatus::Pending);
            }
        }
    }

    Ok(())
}
