//! Subcommands and the helpers they share.

pub mod artifact;
pub mod bench;
pub mod compare;
pub mod config;
pub mod predict;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use twinfer_core::{BackendKind, DualExecutor, PredictionService, TwinferConfig};

/// Which backend(s) a command runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendChoice {
    /// Native runtime only
    Native,
    /// Portable runtime only
    Portable,
    /// Both, native first
    Both,
}

impl BackendChoice {
    pub fn kinds(self) -> Vec<BackendKind> {
        match self {
            BackendChoice::Native => vec![BackendKind::Native],
            BackendChoice::Portable => vec![BackendKind::Portable],
            BackendChoice::Both => BackendKind::ALL.to_vec(),
        }
    }
}

/// `<config dir>/twinfer/config.json`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("twinfer")
        .join("config.json")
}

/// The `-c` file, else the default file if present, else built-in defaults.
pub fn load_config(config_path: Option<&str>) -> anyhow::Result<TwinferConfig> {
    match config_path {
        Some(path) => Ok(TwinferConfig::from_file(Path::new(path))?),
        None => {
            let path = default_config_path();
            if path.exists() {
                debug!("Using config from {}", path.display());
                Ok(TwinferConfig::from_file(&path)?)
            } else {
                Ok(TwinferConfig::default())
            }
        }
    }
}

/// Load both models and warm them up behind a spinner.
pub fn start_service(config: &TwinferConfig) -> anyhow::Result<Arc<PredictionService>> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));

    pb.set_message(format!("Loading models from {}", config.models.model_dir.display()));
    let executor = match DualExecutor::load(config) {
        Ok(executor) => executor,
        Err(e) => {
            pb.finish_and_clear();
            return Err(e.into());
        }
    };

    pb.set_message(format!(
        "Warming up ({} runs per backend)",
        config.runtime.warmup_iterations
    ));
    let service = PredictionService::start(executor, config);
    pb.finish_and_clear();

    Ok(service)
}

/// Expand file arguments and glob patterns into image paths.
pub fn expand_inputs(patterns: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for pattern in patterns {
        let direct = PathBuf::from(pattern);
        if direct.is_file() {
            files.push(direct);
            continue;
        }

        let matched: Vec<PathBuf> = glob(pattern)?
            .filter_map(|r| r.ok())
            .filter(|p| {
                let ext = p.extension().and_then(|e| e.to_str()).unwrap_or("");
                matches!(
                    ext.to_lowercase().as_str(),
                    "png" | "jpg" | "jpeg" | "webp" | "bmp" | "gif" | "tiff" | "tif"
                )
            })
            .collect();

        if matched.is_empty() {
            anyhow::bail!("No matching files found for pattern: {}", pattern);
        }
        files.extend(matched);
    }

    Ok(files)
}

/// Human readable byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.1}GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.1}MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.1}KB", bytes as f64 / 1_000.0)
    } else {
        format!("{}B", bytes)
    }
}
