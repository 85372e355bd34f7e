pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "prifi")]
#[command(about = "PriFi relay, client and trustee nodes")]
pub struct Args {
    /// Path to the prifi config directory (defaults to ~/.prifi)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
