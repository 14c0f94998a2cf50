//! hemofit CLI

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use eyre::{Result, WrapErr};

use hemofit::prelude::*;

#[derive(Parser)]
#[command(name = "hemofit")]
#[command(about = "Fit a lumped circulation model to patient records stored in SQLite")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML). Every setting has a default.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database holding the input and output tables
    #[arg(long, global = true)]
    db: Option<String>,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Drop the output table before writing instead of appending to it
    #[arg(long, global = true)]
    replace: bool,

    #[command(flatten)]
    partition: PartitionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PartitionArgs {
    /// Node index of a run split across independent processes
    #[arg(long, global = true, conflicts_with = "start")]
    node: Option<usize>,

    /// First slot owned by this process when running a worker pool
    #[arg(long, global = true)]
    start: Option<usize>,

    /// Total number of nodes or slots
    #[arg(long, global = true, default_value = "1")]
    total: usize,

    /// Workers of the pool, each owning one slot
    #[arg(long, global = true, default_value = "1")]
    num_workers: usize,
}

impl PartitionArgs {
    fn partition(&self) -> Partition {
        match self.node {
            Some(node) => Partition::Node {
                node,
                total: self.total,
            },
            None => Partition::Jobs {
                start: self.start.unwrap_or(0),
                total: self.total,
                workers: self.num_workers,
            },
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fit every record and persist the fitted model inputs
    Fit,
    /// Collapse Pareto fronts into one loss-weighted row per subject
    Reduce,
}

fn main() {
    if let Err(e) = run() {
        tracing::error!("{:?}", e);
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::read(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        settings.store.path = db;
    }
    if let Some(level) = cli.log_level {
        settings.log.level = level;
    }
    if cli.replace {
        settings.store.write_mode = WriteMode::Replace;
    }
    settings.validate()?;
    setup_log(&settings)?;

    if let Some(file) = &settings.log.file {
        let path = PathBuf::from(file).with_extension("settings.json");
        settings
            .write(&path)
            .wrap_err("Unable to record the effective settings")?;
    }

    let partition = cli.partition.partition();
    let written = match cli.command {
        Commands::Fit => hemofit::fit(settings, partition)?,
        Commands::Reduce => hemofit::reduce(settings, partition)?,
    };
    tracing::info!("Done, {} rows written", written);
    Ok(())
}
