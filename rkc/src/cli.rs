use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkc", version, about = "RKC compute engine supervisor")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the local cluster and its storage web tunnel
    Start {
        #[arg(short, long)]
        config: PathBuf,
    },
}
