use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "greekd")]
#[command(about = "greekd - streams option greeks from brokerage feeds into a durable store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the ingestion pipeline with the given configuration
    Start {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config/greekd.yaml", env = "GREEKD_CONFIG")]
        config: PathBuf,

        /// Only run these sources, even if others are enabled in the config
        #[arg(long, value_enum, value_delimiter = ',')]
        only: Vec<SourceArg>,

        /// Override the status server port
        #[arg(long)]
        status_port: Option<u16>,

        /// Keep snapshots in memory instead of the configured store
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate configuration without starting anything
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config/greekd.yaml", env = "GREEKD_CONFIG")]
        config: PathBuf,
    },

    /// Write a configuration file with all defaults
    Init {
        /// Output path for the new configuration file
        #[arg(short, long, default_value = "greekd.yaml")]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceArg {
    /// Tastytrade DXLink streamer
    Tastytrade,

    /// Interactive Brokers Client Portal websocket
    Ibkr,
}

impl SourceArg {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceArg::Tastytrade => "tastytrade",
            SourceArg::Ibkr => "ibkr",
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
