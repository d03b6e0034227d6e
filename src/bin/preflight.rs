use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
};

use clap::Parser;

use minitrain::{
    logging::Logger,
    planner::{StepPlan, TrainHorizon},
    sanity::scan_labels,
    Sample, TrainError, TrainingConfig,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("preflight failed: {}", err);
        std::process::exit(1);
    }
}

/// Pre-training diagnostics: resolves the step plan for a configuration and
/// sample set, and scans the labels for degenerate masking.
#[derive(Parser, Debug)]
#[command(author, version, about = "Training-run preflight checks", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(
        long,
        value_name = "PATH",
        help = "JSONL sample file; defaults to data.samples from the config"
    )]
    samples: Option<PathBuf>,
}

fn run() -> Result<(), TrainError> {
    let args = Args::parse();
    let config = TrainingConfig::load(&args.config)?;

    let samples_path = args
        .samples
        .or_else(|| config.data.samples.clone())
        .ok_or_else(|| {
            TrainError::config("no sample file given; pass --samples or set data.samples")
        })?;
    let samples = read_samples(&samples_path)?;

    let horizon = TrainHorizon::from_config(&config)?;
    let plan = StepPlan::resolve(
        config.data.per_device_batch_size,
        config.data.accumulation_steps,
        config.runtime.world_size,
        samples.len(),
        horizon,
    )?;

    println!("samples: {}", samples.len());
    println!("total batch size: {}", plan.total_batch_size);
    println!("updates per epoch: {}", plan.updates_per_epoch);
    println!("epochs: {}", plan.epochs);
    println!("total optimizer steps: {}", plan.max_steps);
    println!(
        "windows per epoch: {} (final window: {} micro-batches)",
        plan.max_iterations_per_epoch, plan.leftover_batches
    );

    let logger = Logger::new(true);
    let report = scan_labels(samples.into_iter().map(Ok), &logger);
    println!(
        "label scan: {} usable, {} degenerate, {} skipped",
        report.usable, report.degenerate, report.skipped
    );

    Ok(())
}

fn read_samples(path: &PathBuf) -> Result<Vec<Sample>, TrainError> {
    let file = File::open(path)?;
    let mut samples = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        samples.push(serde_json::from_str(&line)?);
    }
    Ok(samples)
}
