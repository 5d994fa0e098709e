//! CLI definitions for gatehouse.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "gatehouse",
    version,
    about = "Low-latency order-gateway ingress/egress core\n\nTCP, UDP and multicast dispatch onto sharded matching engines.",
    long_about = None
)]
pub struct Cli {
    /// Path to gatehouse.toml config file
    #[clap(long, short, default_value = "gatehouse.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the ingress/egress pipeline until Ctrl-C
    Run,

    /// Live-updating gateway stats dashboard (Ctrl-C to stop)
    Monitor {
        /// Dashboard refresh interval in seconds
        #[clap(long, default_value = "5")]
        interval: u64,
    },

    /// Run a timed benchmark and output a structured report
    Bench {
        /// How many seconds to run the benchmark
        #[clap(long, default_value = "10")]
        duration: u64,

        /// Write JSON report to this file (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Print an example gatehouse.toml to stdout
    Init,
}
