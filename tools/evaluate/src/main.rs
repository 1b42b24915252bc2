//! Evaluation CLI.
//!
//! Scores a saved head or fine-tuned checkpoint on the validation split and
//! lists the most confident mistakes.

use anyhow::{Context, Result};
use catdog_core::{
    backend_name, default_device, load_pipeline_config, setup_cli_logging, DefaultBackend,
};
use catdog_training::{CheckpointKind, EvaluationReport, Pipeline};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Stage {
    /// Head trained on cached features, on top of the configured backbone
    Head,
    /// Fine-tuned backbone and head
    Finetuned,
}

impl From<Stage> for CheckpointKind {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Head => CheckpointKind::Head,
            Stage::Finetuned => CheckpointKind::Finetuned,
        }
    }
}

/// Cats-vs-dogs model evaluation
#[derive(Parser, Debug)]
#[command(
    name = "catdog-evaluate",
    about = "Evaluate a trained cats-vs-dogs model on the validation split"
)]
struct Args {
    /// Pipeline configuration (TOML); defaults apply when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Which checkpoint to evaluate
    #[arg(short, long, value_enum, default_value = "finetuned")]
    stage: Stage,

    /// Override the directory holding the checkpoints
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Pretrained backbone record, for scoring a head checkpoint
    #[arg(short, long, value_name = "FILE")]
    weights: Option<PathBuf>,

    /// Accept the randomly initialised backbone saved next to the checkpoints
    #[arg(long)]
    allow_random_init: bool,

    /// Override the decision threshold
    #[arg(short, long)]
    threshold: Option<f64>,

    /// Number of confident mistakes to list
    #[arg(short = 'k', long)]
    top: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_cli_logging(args.verbose)?;

    let mut config = load_pipeline_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(output) = args.output {
        config.output.output_dir = output;
    }
    if let Some(weights) = args.weights {
        config.backbone.weights = Some(weights);
    }
    if args.allow_random_init {
        config.backbone.allow_random_init = true;
    }
    if let Some(threshold) = args.threshold {
        config.evaluation.threshold = threshold;
    }
    if let Some(top) = args.top {
        config.evaluation.top_mistakes = top;
    }

    let pipeline = Pipeline::new(config)?;
    info!("Evaluating {:?} checkpoint on {}", args.stage, backend_name());

    let report = pipeline
        .evaluate::<DefaultBackend>(args.stage.into(), &default_device())
        .context("Evaluation failed")?;

    print_report(&report, pipeline.config().evaluation.top_mistakes);
    println!(
        "  Report saved to: {}",
        pipeline.artifacts().evaluation().display()
    );
    Ok(())
}

fn print_report(report: &EvaluationReport, top: usize) {
    println!();
    println!("{}", "Evaluation".cyan().bold());
    println!(
        "  Accuracy:  {} ({}/{})",
        format!("{:.2}%", report.accuracy * 100.0).green().bold(),
        report.correct,
        report.total
    );
    println!("  Threshold: {}", report.threshold);
    for (class, accuracy) in report.per_class_accuracy() {
        println!("  {:<10} {:.2}%", class, accuracy * 100.0);
    }

    let mistakes = report.most_confident_mistakes(top);
    if mistakes.is_empty() {
        return;
    }
    println!();
    println!("{}", "Most confident mistakes".yellow().bold());
    for mistake in mistakes {
        let truth = report
            .class_names
            .get(mistake.label)
            .map(String::as_str)
            .unwrap_or("?");
        println!(
            "  p={:.3}  true={:<6} {}",
            mistake.probability,
            truth,
            mistake.path.display()
        );
    }
}
