//! Command-line interface.
//!
//! Uses clap for argument parsing and a structured command pattern: each
//! subcommand is an `XxxArgs` struct plus an `XxxCommand` that executes it.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

use crate::data_paths::{DataPaths, DEFAULT_DATA_DIR};
use crate::logging::{init_logging, LogMode, LoggingConfig};

use commands::agents::{AgentsArgs, AgentsCommand};
use commands::cycle::{CycleArgs, CycleCommand};
use commands::ingest::{IngestArgs, IngestCommand};
use commands::performance::{PerformanceArgs, PerformanceCommand};
use commands::portfolio::{PortfolioArgs, PortfolioCommand};
use commands::run::{RunArgs, RunCommand};
use commands::seed::{SeedArgs, SeedCommand};

#[derive(Parser)]
#[command(name = "racebot")]
#[command(version)]
#[command(about = "AI trading agents competing on shared market data", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Data directory path (default: ./data)
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the recurring market-cycle scheduler
    Run(RunArgs),

    /// Trigger one market cycle manually
    Cycle(CycleArgs),

    /// Ingest market data once
    Ingest(IngestArgs),

    /// Seed default assets and agents
    Seed(SeedArgs),

    /// Show an agent's portfolio
    Portfolio(PortfolioArgs),

    /// Show an agent's performance metrics
    Performance(PerformanceArgs),

    /// List registered agents
    Agents(AgentsArgs),
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let data_paths = DataPaths::new(&self.data_dir);
        data_paths.ensure_directories()?;

        let log_mode = match &self.command {
            Commands::Run(args) if args.quiet => LogMode::FileOnly,
            _ => LogMode::ConsoleAndFile,
        };
        init_logging(LoggingConfig::new(log_mode, data_paths.clone(), self.verbose))?;

        match self.command {
            Commands::Run(args) => RunCommand::new(args).execute(data_paths).await,
            Commands::Cycle(args) => CycleCommand::new(args).execute(data_paths).await,
            Commands::Ingest(args) => IngestCommand::new(args).execute(data_paths).await,
            Commands::Seed(args) => SeedCommand::new(args).execute(data_paths).await,
            Commands::Portfolio(args) => PortfolioCommand::new(args).execute(data_paths).await,
            Commands::Performance(args) => {
                PerformanceCommand::new(args).execute(data_paths).await
            }
            Commands::Agents(args) => AgentsCommand::new(args).execute(data_paths).await,
        }
    }
}
