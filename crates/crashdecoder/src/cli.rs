use std::path::PathBuf;

use clap::Parser;

/// Decodes a mobile game crash report payload into an indexable document.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Path to the JSON crash payload; `-` reads from stdin.
    pub payload: PathBuf,
}
