//! Artifact command - inspect and rewrite model files for portability.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use console::style;

use twinfer_core::artifact::{self, PortabilityReport};

use super::format_size;

/// Arguments for the artifact command.
#[derive(Args)]
pub struct ArtifactArgs {
    #[command(subcommand)]
    command: ArtifactCommand,
}

#[derive(Subcommand)]
enum ArtifactCommand {
    /// Report whether a model depends on external data files
    Inspect {
        /// Model file
        model: PathBuf,

        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,

        /// Fail unless the model is self-contained
        #[arg(long)]
        require_self_contained: bool,
    },

    /// Embed all external data into a single self-contained file
    Consolidate {
        /// Model file
        model: PathBuf,

        /// Output file (default: rewrite in place)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Move large initializers into `<output>.data`
    Externalize {
        /// Model file
        model: PathBuf,

        /// Output file
        #[arg(short, long, required = true)]
        output: PathBuf,

        /// Smallest initializer, in bytes, that is moved out
        #[arg(long, default_value = "1024")]
        min_bytes: u64,
    },
}

pub async fn run(args: ArtifactArgs) -> anyhow::Result<()> {
    match args.command {
        ArtifactCommand::Inspect {
            model,
            json,
            require_self_contained,
        } => {
            let report = artifact::inspect(&model)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if require_self_contained && !report.is_self_contained() {
                anyhow::bail!(
                    "{} references external data; run `twinfer artifact consolidate` first",
                    model.display()
                );
            }
            Ok(())
        }
        ArtifactCommand::Consolidate { model, output } => {
            let output = output.unwrap_or_else(|| model.clone());
            let outcome = artifact::consolidate(&model, &output)?;

            if outcome.already_self_contained {
                println!(
                    "{} {} was already self-contained",
                    style("ℹ").blue(),
                    model.display()
                );
            } else {
                println!(
                    "{} Inlined {} tensors ({}) into {}",
                    style("✓").green(),
                    outcome.tensors_inlined,
                    format_size(outcome.bytes_inlined),
                    outcome.output.display()
                );
            }
            for removed in &outcome.removed_files {
                println!("  removed {}", removed.display());
            }
            Ok(())
        }
        ArtifactCommand::Externalize {
            model,
            output,
            min_bytes,
        } => {
            let outcome = artifact::externalize(&model, &output, min_bytes)?;
            match &outcome.data_file {
                Some(data) => println!(
                    "{} Moved {} tensors ({}) into {}",
                    style("✓").green(),
                    outcome.tensors_moved,
                    format_size(outcome.bytes_moved),
                    data.display()
                ),
                None => println!(
                    "{} No initializer reached {}; {} is self-contained",
                    style("ℹ").blue(),
                    format_size(min_bytes),
                    outcome.output.display()
                ),
            }
            Ok(())
        }
    }
}

fn print_report(report: &PortabilityReport) {
    println!("{}", style(report.path.display()).bold());
    println!("  size:          {}", format_size(report.file_size));
    if let Some(ir) = report.ir_version {
        println!("  ir version:    {}", ir);
    }
    if let Some(opset) = report.opset_version {
        println!("  opset:         {}", opset);
    }
    if let Some(producer) = &report.producer_name {
        println!("  producer:      {}", producer);
    }
    println!(
        "  initializers:  {} ({} embedded)",
        report.initializer_count,
        format_size(report.inline_weight_bytes)
    );

    if report.is_self_contained() {
        println!(
            "  {} self-contained, loadable from a single buffer",
            style("✓").green()
        );
        return;
    }

    println!(
        "  {} {} tensors stored externally ({})",
        style("⚠").yellow(),
        report.external_tensor_count,
        format_size(report.external_data_size.unwrap_or(0))
    );
    for file in &report.external_files {
        let (status, size) = match file.size {
            Some(size) => (style("✓").green(), format_size(size)),
            None => (style("✗").red(), "missing".to_string()),
        };
        println!(
            "    {} {:<30} {:>10}  {} tensors",
            status, file.location, size, file.tensors
        );
    }
}
