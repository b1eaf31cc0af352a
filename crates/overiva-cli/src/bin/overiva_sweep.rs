//! Run the simulation sweep described by a JSON parameter file.
//!
//! Usage: `overiva-sweep <parameters.json> [--results-dir DIR] [--serial] [--test]`

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use overiva_sim::{run_sweep, SweepOptions, SweepParameters};

#[derive(Parser, Debug)]
#[command(name = "overiva-sweep")]
#[command(about = "Evaluate OverIVA and related algorithms over simulated rooms")]
struct Args {
    /// Sweep parameter file (JSON)
    parameters: PathBuf,

    /// Parent directory of the results folder (overrides the configuration)
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Run the trials one after the other
    #[arg(long)]
    serial: bool,

    /// Only run a couple of trials
    #[arg(long)]
    test: bool,

    /// Tool configuration file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let tool = overiva_cli::setup(args.config.as_deref(), args.verbose)?;

    let mut params = SweepParameters::from_file(&args.parameters)
        .with_context(|| format!("reading {}", args.parameters.display()))?;
    if params.bss_eval_filter_len.is_none() {
        params.bss_eval_filter_len = Some(tool.eval.filter_len);
    }

    let options = SweepOptions {
        serial: args.serial,
        test: args.test,
        results_dir: args.results_dir.unwrap_or(tool.results_dir),
    };
    let summary = run_sweep(&params, &options).context("sweep failed")?;

    let failed = summary.records.iter().filter(|r| r.failed()).count();
    info!(
        trials = summary.n_trials,
        records = summary.records.len(),
        failed,
        "done"
    );
    println!(
        "{} trials, {} records ({} failed) in {}",
        summary.n_trials,
        summary.records.len(),
        failed,
        summary.output_dir.display()
    );
    Ok(())
}
