//! CLI entry point for the regime backtester.
//!
//! `rbt run` drives a full backtest from a JSON config: load candles,
//! simulate, print the summary, write result artifacts, then (unless
//! disabled) the randomized parameter grid search.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};

use rbt_runtime::Runner;

#[derive(Parser)]
#[command(
    name = "rbt",
    version,
    about = "Event-driven backtester for regime-switching strategies",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest from a JSON config file
    Run(RunArgs),
}

#[derive(Parser)]
struct RunArgs {
    /// Path to the backtest JSON config. A default config is written here
    /// when the file does not exist.
    #[arg(long, default_value = "backtest_config.json")]
    config: PathBuf,

    /// Directory for result artifacts (stats, curves, trades, leaderboard)
    #[arg(long, default_value = "./backtest_results")]
    output_dir: PathBuf,

    /// Override the grid-search shuffle seed from the config
    #[arg(long)]
    seed: Option<u64>,

    /// Override the number of grid-search samples from the config
    #[arg(long)]
    max_samples: Option<usize>,

    /// Skip the parameter grid search even when the config enables it
    #[arg(long, default_value_t = false)]
    no_optimize: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> ExitCode {
    let start = Instant::now();

    let mut runner = match Runner::from_config_path(&args.config) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("[error] {e}");
            return ExitCode::FAILURE;
        }
    };
    if args.seed.is_some() || args.max_samples.is_some() {
        let mut cfg = runner.config().clone();
        if let Some(seed) = args.seed {
            cfg.optimization.seed = seed;
        }
        if let Some(samples) = args.max_samples {
            cfg.optimization.max_samples = samples;
        }
        runner = match Runner::with_config(cfg) {
            Ok(runner) => runner,
            Err(e) => {
                eprintln!("[error] {e}");
                return ExitCode::FAILURE;
            }
        };
    }

    match runner.run(&args.output_dir, !args.no_optimize) {
        Ok(summary) => {
            eprintln!(
                "[run] finished in {:.2}s: {} bars, {} trades, final equity {:.2}",
                start.elapsed().as_secs_f64(),
                summary.result.equity_curve.len(),
                summary.result.num_trades,
                summary.result.final_equity
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("[error] {e}");
            ExitCode::FAILURE
        }
    }
}
