//! Bench command - per-stage latency of both backends.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use twinfer_core::{
    BackendKind, LatencyBreakdown, LatencyStats, PredictionService, WarmupReport,
    latency::StageSummary,
};

use super::{BackendChoice, load_config, start_service};

/// Arguments for the bench command.
#[derive(Args)]
pub struct BenchArgs {
    /// Input image
    #[arg(required = true)]
    input: PathBuf,

    /// Measured requests per backend
    #[arg(short = 'n', long, default_value = "50")]
    iterations: usize,

    /// Concurrent requests (served by the bounded worker pool)
    #[arg(short = 'j', long, default_value = "1")]
    concurrency: usize,

    /// Backend to measure
    #[arg(short, long, value_enum, default_value = "both")]
    backend: BackendChoice,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Model directory
    #[arg(short, long)]
    model_dir: Option<PathBuf>,
}

#[derive(Serialize)]
struct BackendBench {
    backend: BackendKind,
    mode: &'static str,
    wall_ms: f64,
    stats: LatencyStats,
}

#[derive(Serialize)]
struct BenchReport {
    warmup: Vec<WarmupReport>,
    backends: Vec<BackendBench>,
}

pub async fn run(args: BenchArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = args.model_dir.clone() {
        config.models.model_dir = dir;
    }
    if args.iterations == 0 {
        anyhow::bail!("--iterations must be at least 1");
    }

    let bytes = fs::read(&args.input)?;
    let service = start_service(&config)?;

    let mut backends = Vec::new();
    for kind in args.backend.kinds() {
        let pb = ProgressBar::new(args.iterations as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len}")?
                .progress_chars("=>-"),
        );
        pb.set_message(kind.to_string());

        let started = Instant::now();
        let samples = if args.concurrency > 1 {
            run_concurrent(&service, &bytes, kind, &args, &pb).await?
        } else {
            let mut samples = Vec::with_capacity(args.iterations);
            for _ in 0..args.iterations {
                samples.push(service.predict(&bytes, kind)?.latency);
                pb.inc(1);
            }
            samples
        };
        let wall_ms = started.elapsed().as_secs_f64() * 1000.0;
        pb.finish_and_clear();

        backends.push(BackendBench {
            backend: kind,
            mode: kind.label(),
            wall_ms,
            stats: LatencyStats::from_samples(&samples),
        });
    }

    let report = BenchReport {
        warmup: service.warmup_reports().to_vec(),
        backends,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

async fn run_concurrent(
    service: &std::sync::Arc<PredictionService>,
    bytes: &[u8],
    kind: BackendKind,
    args: &BenchArgs,
    pb: &ProgressBar,
) -> anyhow::Result<Vec<LatencyBreakdown>> {
    let mut samples = Vec::with_capacity(args.iterations);
    let mut remaining = args.iterations;

    while remaining > 0 {
        let wave = remaining.min(args.concurrency);
        let handles: Vec<_> = (0..wave)
            .map(|_| tokio::spawn(service.clone().predict_async(bytes.to_vec(), kind)))
            .collect();

        for handle in handles {
            samples.push(handle.await??.latency);
            pb.inc(1);
        }
        remaining -= wave;
    }

    Ok(samples)
}

fn print_report(report: &BenchReport) {
    println!("{}", style("Warm-up").bold());
    for w in &report.warmup {
        let status = if w.degraded() {
            style("⚠").yellow()
        } else {
            style("✓").green()
        };
        println!(
            "  {} {:<9} {}/{} runs in {:.1}ms",
            status, w.backend, w.completed, w.requested, w.duration_ms
        );
    }

    for b in &report.backends {
        println!();
        println!(
            "{} {} samples, {:.1}ms wall",
            style(b.mode).cyan().bold(),
            b.stats.samples,
            b.wall_ms
        );
        println!(
            "  {:<11} {:>9} {:>9} {:>9} {:>9} {:>9}",
            "stage", "mean", "p50", "p95", "min", "max"
        );
        print_stage("decode", &b.stats.decode);
        print_stage("preprocess", &b.stats.preprocess);
        print_stage("inference", &b.stats.inference);
        print_stage("total", &b.stats.total);
    }
}

fn print_stage(name: &str, s: &StageSummary) {
    println!(
        "  {:<11} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2}",
        name, s.mean, s.p50, s.p95, s.min, s.max
    );
}
