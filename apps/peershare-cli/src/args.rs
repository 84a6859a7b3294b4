//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

/// Send files to a loopback peer and report the outcome
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Files to send, in order
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Directory received files are written to (overrides config)
    #[arg(short = 'o', long = "into")]
    pub into: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Milliseconds to wait for an announced file before giving up (overrides config)
    #[arg(short, long = "timeout-ms")]
    pub timeout_ms: Option<u64>,

    /// Ask the receiving side to open each file once received
    #[arg(long, default_value = "false")]
    pub open: bool,
}
