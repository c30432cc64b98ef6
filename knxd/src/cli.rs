use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "knxd", version, about = "KubeNexus scheduler daemon CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the scheduler daemon with a config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}
