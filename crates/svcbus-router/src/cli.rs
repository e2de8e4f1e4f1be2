//! Command-line interface definitions and parsing

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Listen host, overrides the configuration file
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port, overrides the configuration file
    #[arg(short, long)]
    pub port: Option<u16>,

    /// First cookie handed to a connecting peer
    #[arg(long)]
    pub first_cookie: Option<u64>,

    /// Refuse peers that are not whitelisted
    #[arg(long)]
    pub reject_by_default: bool,
}
