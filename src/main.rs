//! fanout - parallel work dispatcher demo binary.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::Level;

use fanout::logging::{self, LogConfig, LogFormat};
use fanout::{map, DistributeConfig, Options};

mod cli;

use cli::{Cli, Commands, SleepArgs, SquareArgs};

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Square(args) => cmd_square(args),
        Commands::Sleep(args) => cmd_sleep(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let mut config = LogConfig::new().with_level(level);
    if let Some(format) = &cli.log_format {
        if let Ok(format) = format.parse::<LogFormat>() {
            config = config.with_format(format);
        }
    }
    logging::init(config.with_env_overrides());
}

fn cmd_square(args: &SquareArgs) -> Result<()> {
    let numbers: Vec<u64> = (0..args.count).collect();

    let mut options = Options::new();
    if let Some(workers) = args.workers {
        options = options.workers(workers);
    }
    if args.threads {
        options = options.in_threads();
    }
    if let Some(rate) = args.rate {
        options = options.max_rate(rate);
    }
    if args.progress {
        options = options.progress("squaring");
    }
    if !args.distribute.is_empty() {
        let mut config = DistributeConfig::new(args.distribute.clone())
            .via(&args.via)
            .timeout(Duration::from_secs(args.distribute_timeout));
        if let Some(address) = args.local_address {
            config = config.local_address(address);
        }
        options = options.distribute(config);
    }

    match map(numbers, options, |n: &u64| Ok(n * n))? {
        Some(squares) => {
            let sum: u64 = squares.iter().sum();
            println!("{} squares, sum {}", squares.len(), sum);
            println!("{:?}", &squares[..squares.len().min(8)]);
        }
        None => println!("stopped before completion"),
    }
    Ok(())
}

fn cmd_sleep(args: &SleepArgs) -> Result<()> {
    let jobs: Vec<u64> = (0..args.jobs as u64).collect();
    let options = Options::new().workers(args.workers.unwrap_or(args.jobs));
    let secs = args.secs;

    println!("sleeping {} jobs for {}s each", args.jobs, secs);
    match map(jobs, options, move |_: &u64| {
        std::thread::sleep(Duration::from_secs(secs));
        Ok(())
    })? {
        Some(done) => println!("finished {} jobs", done.len()),
        None => println!("stopped before completion"),
    }
    Ok(())
}
