//! Compare command - cross-backend parity over a set of images.

use std::fs;
use std::path::PathBuf;

use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{error, warn};

use twinfer_core::{ComparisonResult, GateOutcome, ParityGate};

use super::{expand_inputs, load_config, start_service};

/// Arguments for the compare command.
#[derive(Args)]
pub struct CompareArgs {
    /// Input images or glob patterns
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Fail when the parity gate does not pass
    #[arg(long)]
    strict: bool,

    /// Print a JSON report instead of a table
    #[arg(long)]
    json: bool,

    /// Continue when an image cannot be processed
    #[arg(long)]
    continue_on_error: bool,

    /// Model directory
    #[arg(short, long)]
    model_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct ImageComparison {
    path: PathBuf,
    #[serde(flatten)]
    result: ComparisonResult,
}

#[derive(Serialize)]
struct CompareReport {
    images: Vec<ImageComparison>,
    failed: Vec<(PathBuf, String)>,
    gate: GateOutcome,
}

pub async fn run(args: CompareArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = args.model_dir.clone() {
        config.models.model_dir = dir;
    }

    let files = expand_inputs(&args.inputs)?;
    let service = start_service(&config)?;
    let gate = ParityGate::from_config(&config.diagnostics);

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} images")?
            .progress_chars("=>-"),
    );

    let mut images = Vec::with_capacity(files.len());
    let mut failed = Vec::new();

    for path in files {
        let outcome = fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Ok(service.compare(&bytes)?));

        match outcome {
            Ok(result) => images.push(ImageComparison { path, result }),
            Err(e) if args.continue_on_error => {
                warn!("Failed to compare {}: {}", path.display(), e);
                failed.push((path, e.to_string()));
            }
            Err(e) => {
                pb.finish_and_clear();
                error!("Failed to compare {}: {}", path.display(), e);
                return Err(e.context(format!("comparing {}", path.display())));
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let divergences: Vec<_> = images.iter().map(|i| i.result.divergence).collect();
    let outcome = gate.evaluate(&divergences);

    let report = CompareReport {
        images,
        failed,
        gate: outcome,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_table(&report, &gate);
    }

    if args.strict && !report.gate.passed {
        anyhow::bail!(
            "Parity gate failed: {}/{} images agree, max logit L2 {:.5}, max probability L2 {:.6}",
            report.gate.agreements,
            report.gate.samples,
            report.gate.max_logit_l2_diff,
            report.gate.max_probability_l2_diff
        );
    }

    Ok(())
}

fn print_table(report: &CompareReport, gate: &ParityGate) {
    println!(
        "{:<32} {:>7} {:>7} {:>10} {:>10} {:>10}",
        "image", "native", "portab.", "logit L2", "prob L2", "prep max"
    );

    for image in &report.images {
        let name = image
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("?");
        let d = &image.result.divergence;
        let marker = if gate.accepts(d) {
            style("✓").green()
        } else {
            style("✗").red()
        };

        println!(
            "{} {:<30} {:>7} {:>7} {:>10.5} {:>10.6} {:>10.5}",
            marker,
            name,
            d.native.class_id,
            d.portable.class_id,
            d.logit_l2_diff,
            d.probability_l2_diff,
            image.result.preprocess_parity.max_abs_diff
        );
    }

    if !report.failed.is_empty() {
        println!();
        println!("{}", style("Failed images:").red());
        for (path, error) in &report.failed {
            println!("  - {}: {}", path.display(), error);
        }
    }

    println!();
    let verdict = if report.gate.passed {
        style("PASSED").green().bold()
    } else {
        style("FAILED").red().bold()
    };
    println!(
        "Parity gate {}: {}/{} top-1 agreements, max logit L2 {:.5} (tol {}), max probability L2 {:.6} (tol {})",
        verdict,
        report.gate.agreements,
        report.gate.samples,
        report.gate.max_logit_l2_diff,
        gate.logit_l2_tolerance,
        report.gate.max_probability_l2_diff,
        gate.probability_l2_tolerance
    );
}
