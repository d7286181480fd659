use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gaussnet")]
#[command(about = "Distributed block Gaussian elimination over UDP", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log filter used when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator: accept a system, distribute blocks, assemble the solution
    Coordinator {
        /// JSON file overriding network and timing defaults
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Worker executable to launch (defaults to this binary)
        #[arg(long)]
        worker_exe: Option<PathBuf>,

        /// Do not launch workers; expect them to be started externally
        #[arg(long)]
        no_launch: bool,
    },

    /// Run a single worker that processes blocks for the coordinator
    Worker {
        /// Worker id; the worker listens on base port + id
        #[arg(long)]
        id: usize,

        /// JSON file overriding network and timing defaults
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Generate a diagonally dominant system and submit it to the coordinator
    Submit {
        /// Matrix dimension (the system is size x size)
        #[arg(short, long, default_value = "200")]
        size: usize,

        /// Number of workers the coordinator should use
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// How long to wait for the solution, in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Output JSON instead of human-readable text
        #[arg(long)]
        json: bool,

        /// Suppress human-readable output (useful with --json)
        #[arg(long)]
        quiet: bool,

        /// Export the solution vector to a CSV file
        #[arg(long)]
        csv: Option<String>,

        /// JSON file overriding network and timing defaults
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Solve a generated system in process, block by block, without workers
    Local {
        /// Matrix dimension (the system is size x size)
        #[arg(short, long, default_value = "200")]
        size: usize,

        /// Block edge length (defaults to the packet-fit size)
        #[arg(short, long)]
        block_size: Option<usize>,

        /// Output JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
}
