//! Predict command - classify one image.

use std::fs;
use std::path::PathBuf;

use clap::Args;
use console::style;
use tracing::info;

use twinfer_core::PredictionResponse;

use super::{BackendChoice, load_config, start_service};

/// Arguments for the predict command.
#[derive(Args)]
pub struct PredictArgs {
    /// Input image
    #[arg(required = true)]
    input: PathBuf,

    /// Backend to run
    #[arg(short, long, value_enum, default_value = "native")]
    backend: BackendChoice,

    /// Model directory
    #[arg(short, long)]
    model_dir: Option<PathBuf>,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

pub async fn run(args: PredictArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = args.model_dir {
        config.models.model_dir = dir;
    }

    if !args.input.exists() {
        anyhow::bail!("Input file not found: {}", args.input.display());
    }
    let bytes = fs::read(&args.input)?;

    let service = start_service(&config)?;
    info!("Classifying {}", args.input.display());

    let mut responses = Vec::new();
    for kind in args.backend.kinds() {
        let result = service.predict(&bytes, kind)?;
        responses.push(PredictionResponse::from(&result));
    }

    let output = if responses.len() == 1 {
        serde_json::to_string_pretty(&responses[0])?
    } else {
        serde_json::to_string_pretty(&responses)?
    };

    if let Some(output_path) = &args.output {
        fs::write(output_path, &output)?;
        eprintln!(
            "{} Prediction written to {}",
            style("✓").green(),
            output_path.display()
        );
    } else {
        println!("{}", output);
    }

    Ok(())
}
