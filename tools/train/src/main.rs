//! Training CLI.
//!
//! Runs the pipeline stage by stage (`extract`, `head`, `finetune`) or end
//! to end (`run`), and lists the backbone's freezable units (`layers`).

use anyhow::{Context, Result};
use catdog_core::{
    backend_name, default_device, load_pipeline_config, save_toml_config, setup_cli_logging,
    DefaultBackend, FreezeBoundary, PipelineConfig, TrainingBackend, TrainingHistory,
};
use catdog_training::{Pipeline, ResNetConfig};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

/// Cats-vs-dogs transfer learning and fine-tuning
#[derive(Parser, Debug)]
#[command(
    name = "catdog-train",
    about = "Train a cats-vs-dogs classifier on top of a ResNet backbone",
    long_about = "Extract backbone features, train a dense head on them, then fine-tune the \
                  top of the backbone together with the head."
)]
struct Cli {
    /// Pipeline configuration (TOML); defaults apply when omitted
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the output directory
    #[arg(short, long, global = true, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override the random seed
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Pretrained backbone record
    #[arg(short, long, global = true, value_name = "FILE")]
    weights: Option<PathBuf>,

    /// Run on a randomly initialised backbone when no weights are given
    #[arg(long, global = true)]
    allow_random_init: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract and cache backbone features of the training split
    Extract {
        /// Only use this many training images
        #[arg(long, value_name = "N")]
        max_images: Option<usize>,
    },

    /// Train the dense head on cached features
    Head {
        #[arg(short, long, value_name = "N")]
        epochs: Option<usize>,

        #[arg(long, value_name = "LR")]
        lr: Option<f64>,
    },

    /// Fine-tune the backbone past the freeze boundary together with the head
    Finetune {
        #[arg(short, long, value_name = "N")]
        epochs: Option<usize>,

        #[arg(long, value_name = "LR")]
        lr: Option<f64>,

        /// First trainable unit: a stage name (layer1..layer4) or a unit index
        #[arg(long, value_name = "STAGE|INDEX")]
        freeze: Option<String>,

        /// Batches per epoch
        #[arg(long, value_name = "N")]
        steps: Option<usize>,
    },

    /// Every stage: organize, extract, head, finetune, evaluate
    Run,

    /// List the backbone's units and their indices
    Layers,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_cli_logging(cli.verbose)?;

    let mut config = load_pipeline_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(output) = &cli.output {
        config.output.output_dir = output.clone();
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(weights) = &cli.weights {
        config.backbone.weights = Some(weights.clone());
    }
    if cli.allow_random_init {
        config.backbone.allow_random_init = true;
    }

    match cli.command {
        Commands::Extract { max_images } => {
            if max_images.is_some() {
                config.extraction.max_images = max_images;
            }
            let pipeline = Pipeline::new(config)?;
            print_banner("Extracting features", &pipeline);
            let features = pipeline.extract::<DefaultBackend>(&default_device())?;
            println!(
                "{} {} x {} features cached in {}",
                "Done:".green().bold(),
                features.len(),
                features.dim(),
                pipeline.config().extraction.cache_dir.display()
            );
        }
        Commands::Head { epochs, lr } => {
            if let Some(epochs) = epochs {
                config.head.epochs = epochs;
            }
            if let Some(lr) = lr {
                config.head.learning_rate = lr;
            }
            let pipeline = Pipeline::new(config)?;
            print_banner("Training head", &pipeline);
            let history = pipeline.train_head::<TrainingBackend>(&default_device())?;
            print_history("Head", &history);
        }
        Commands::Finetune {
            epochs,
            lr,
            freeze,
            steps,
        } => {
            if let Some(epochs) = epochs {
                config.finetune.epochs = epochs;
            }
            if let Some(lr) = lr {
                config.finetune.learning_rate = lr;
            }
            if let Some(freeze) = freeze {
                config.backbone.freeze_boundary = parse_boundary(&freeze);
            }
            if steps.is_some() {
                config.finetune.steps_per_epoch = steps;
            }
            let pipeline = Pipeline::new(config)?;
            print_banner("Fine-tuning", &pipeline);
            info!(
                "Freeze boundary {} -> unit {}",
                pipeline.config().backbone.freeze_boundary,
                pipeline.trainable_from()?
            );
            let history = pipeline.finetune::<TrainingBackend>(&default_device())?;
            print_history("Fine-tune", &history);
        }
        Commands::Run => {
            let pipeline = Pipeline::new(config)?;
            print_banner("Running full pipeline", &pipeline);
            std::fs::create_dir_all(&pipeline.config().output.output_dir)?;
            save_toml_config(
                pipeline.config(),
                &pipeline.config().output.output_dir.join("config.toml"),
            )?;

            let summary = pipeline.run_all::<TrainingBackend>(&default_device())?;
            print_history("Head", &summary.head_history);
            print_history("Fine-tune", &summary.finetune_history);
            println!(
                "{} validation accuracy {:.2}% ({}/{})",
                "Final:".green().bold(),
                summary.evaluation.accuracy * 100.0,
                summary.evaluation.correct,
                summary.evaluation.total
            );
        }
        Commands::Layers => print_layers(&config),
    }

    Ok(())
}

fn parse_boundary(value: &str) -> FreezeBoundary {
    match value.parse::<usize>() {
        Ok(index) => FreezeBoundary::Index(index),
        Err(_) => FreezeBoundary::Stage(value.to_string()),
    }
}

fn print_banner(title: &str, pipeline: &Pipeline) {
    let config = pipeline.config();
    println!("{}", title.cyan().bold());
    println!("  Backend:      {}", backend_name());
    println!("  Architecture: {}", config.backbone.architecture);
    println!(
        "  Weights:      {}",
        config
            .backbone
            .weights
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| if config.backbone.allow_random_init {
                "random init".to_string()
            } else {
                "not set".to_string()
            })
    );
    println!("  Data:         {}", config.data.data_root.display());
    println!("  Output:       {}", config.output.output_dir.display());
    println!();
}

fn print_history(stage: &str, history: &TrainingHistory) {
    println!();
    println!("{}", format!("{stage} history").cyan().bold());
    println!("  epoch   loss     acc      val_loss val_acc");
    let best = history.best_epoch();
    for record in &history.epochs {
        let line = format!(
            "  {:>5}   {:.4}   {:.4}   {:.4}   {:.4}",
            record.epoch,
            record.train_loss,
            record.train_accuracy,
            record.val_loss,
            record.val_accuracy
        );
        if Some(record.epoch) == best {
            println!("{} {}", line, "(best)".green());
        } else {
            println!("{line}");
        }
    }
    if let Some(delta) = history.val_accuracy_delta() {
        let text = format!("{:+.2}%", delta * 100.0);
        let text = if delta < 0.0 { text.red() } else { text.green() };
        println!("  validation accuracy change over the run: {text}");
    }
}

fn print_layers(config: &PipelineConfig) {
    let resnet = ResNetConfig::for_architecture(config.backbone.architecture);
    let boundary = resnet.resolve_boundary(&config.backbone.freeze_boundary).ok();

    println!(
        "{}",
        format!("{} units", config.backbone.architecture).cyan().bold()
    );
    for layer in resnet.layer_table() {
        let marker = match boundary {
            Some(b) if layer.index < b => "frozen".dimmed(),
            _ => "trainable".green(),
        };
        println!(
            "  {:>3}  {:<10} {:>5} ch  {}",
            layer.index, layer.name, layer.out_channels, marker
        );
    }
    println!("  {:>3}  {:<10}", resnet.num_units(), "head");
}
