//! Diagnostic CLI for dual-backend classification.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{artifact, bench, compare, config, predict};

/// twinfer - Run one classifier on two runtimes and prove they agree
#[derive(Parser)]
#[command(name = "twinfer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a single image
    Predict(predict::PredictArgs),

    /// Compare both backends over a set of images
    Compare(compare::CompareArgs),

    /// Measure per-stage latency
    Bench(bench::BenchArgs),

    /// Inspect and rewrite model artifacts
    Artifact(artifact::ArtifactArgs),

    /// Manage configuration
    Config(config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Execute command
    match cli.command {
        Commands::Predict(args) => predict::run(args, cli.config.as_deref()).await,
        Commands::Compare(args) => compare::run(args, cli.config.as_deref()).await,
        Commands::Bench(args) => bench::run(args, cli.config.as_deref()).await,
        Commands::Artifact(args) => artifact::run(args).await,
        Commands::Config(args) => config::run(args, cli.config.as_deref()).await,
    }
}
