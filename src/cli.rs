//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};

/// fanout - parallel work dispatcher demo
#[derive(Parser, Debug)]
#[command(name = "fanout")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "FANOUT_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Square a range of numbers across a worker pool.
    Square(SquareArgs),

    /// Run deliberately slow jobs (for exercising interrupts).
    Sleep(SleepArgs),
}

/// Arguments for the square demo.
#[derive(Parser, Debug)]
pub struct SquareArgs {
    /// How many numbers to square.
    #[arg(long, default_value_t = 16)]
    pub count: u64,

    /// Worker pool size (defaults to the CPU count).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Use in-process worker threads instead of forked workers.
    #[arg(long)]
    pub threads: bool,

    /// Throttle dispatch to this many jobs per second.
    #[arg(long)]
    pub rate: Option<f64>,

    /// Draw a progress bar.
    #[arg(long)]
    pub progress: bool,

    /// Remote hosts to spread the work over. Repeatable.
    #[arg(long = "distribute", value_name = "HOST")]
    pub distribute: Vec<String>,

    /// Shell transport used to reach remote hosts.
    #[arg(long, default_value = "ssh")]
    pub via: String,

    /// Seconds to wait for remote workers to connect back.
    #[arg(long, default_value_t = 60)]
    pub distribute_timeout: u64,

    /// Address the distributed master binds (defaults to the first
    /// non-loopback interface).
    #[arg(long)]
    pub local_address: Option<std::net::Ipv4Addr>,
}

/// Arguments for the sleep demo.
#[derive(Parser, Debug)]
pub struct SleepArgs {
    /// Number of jobs to run.
    #[arg(long, default_value_t = 4)]
    pub jobs: usize,

    /// Seconds each job sleeps.
    #[arg(long, default_value_t = 30)]
    pub secs: u64,

    /// Worker pool size (defaults to one per job).
    #[arg(long)]
    pub workers: Option<usize>,
}
