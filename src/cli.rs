use clap::Parser;
use std::path::PathBuf;

/// All behaviour is driven by the configuration file; the command line only
/// points at it.
#[derive(Parser, Debug)]
#[command(name = "tapebackup")]
#[command(about = "Back up snapshot folders to a tape autoloader")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Specify configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
