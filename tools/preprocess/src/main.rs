//! Dataset preparation tool.
//!
//! - `organize`: unpack the Kaggle archive, sort images into class folders
//!   and carve out the validation split
//! - `stats`: per-split class counts and balance
//! - `init-config`: write the default pipeline configuration as TOML

use anyhow::{Context, Result};
use catdog_core::{load_pipeline_config, save_toml_config, setup_cli_logging, PipelineConfig};
use catdog_dataset::{DatasetOrganizer, DatasetStatistics, SplitStatistics};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "catdog-preprocess")]
#[command(about = "Prepare the cats-vs-dogs dataset", long_about = None)]
struct Cli {
    /// Pipeline configuration (TOML); defaults apply when omitted
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, organize by class and carve the validation split
    Organize {
        /// Override the dataset root
        #[arg(short, long, value_name = "DIR")]
        data_root: Option<PathBuf>,

        /// Override the zip archive path
        #[arg(short, long, value_name = "FILE")]
        archive: Option<PathBuf>,

        /// Override the number of validation images per class
        #[arg(long, value_name = "N")]
        validation_per_class: Option<usize>,
    },

    /// Print class counts of both splits
    Stats {
        /// Override the dataset root
        #[arg(short, long, value_name = "DIR")]
        data_root: Option<PathBuf>,

        /// Also write the statistics as JSON
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Write the default configuration
    InitConfig {
        #[arg(value_name = "FILE", default_value = "catdog.toml")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_cli_logging(cli.verbose)?;

    match cli.command {
        Commands::Organize {
            data_root,
            archive,
            validation_per_class,
        } => {
            let mut config = load_pipeline_config(cli.config.as_deref())?;
            if let Some(data_root) = data_root {
                config.data.data_root = data_root;
            }
            if let Some(archive) = archive {
                config.data.archive = archive;
            }
            if let Some(n) = validation_per_class {
                config.data.validation_per_class = n;
            }
            config.validate()?;
            organize(&config)
        }
        Commands::Stats { data_root, output } => {
            let config = load_pipeline_config(cli.config.as_deref())?;
            let max_ratio = config.data.max_imbalance_ratio;
            let data_root = data_root.unwrap_or(config.data.data_root);
            stats(data_root, output, max_ratio)
        }
        Commands::InitConfig { path } => {
            save_toml_config(&PipelineConfig::default(), &path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{} {}", "Wrote default configuration to".green(), path.display());
            Ok(())
        }
    }
}

fn organize(config: &PipelineConfig) -> Result<()> {
    println!("{}", "Organizing dataset...".cyan().bold());
    println!("  Root:    {}", config.data.data_root.display());
    println!("  Archive: {}", config.data.archive.display());
    println!("  Classes: {}", config.data.classes.join(", "));
    println!();

    let report = DatasetOrganizer::new(&config.data)
        .organize()
        .context("Dataset organization failed")?;

    if report.was_noop() {
        println!("{}", "Dataset already organized, nothing moved.".yellow());
    } else {
        println!("  Extracted archive:        {}", report.extracted);
        println!("  Files sorted into classes: {}", report.organized_files);
        println!("  Files moved to validation: {}", report.validation_files);
    }
    println!();
    print_statistics(&report.statistics, config.data.max_imbalance_ratio);
    println!("{}", "Dataset ready.".green().bold());
    Ok(())
}

fn stats(data_root: PathBuf, output: Option<PathBuf>, max_ratio: f64) -> Result<()> {
    info!("Computing statistics for {}", data_root.display());
    let statistics = DatasetStatistics::compute(&data_root)
        .with_context(|| format!("Failed to read {}", data_root.display()))?;
    print_statistics(&statistics, max_ratio);

    if let Some(output) = output {
        std::fs::write(&output, serde_json::to_string_pretty(&statistics)?)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        println!("  Saved to: {}", output.display());
    }
    Ok(())
}

fn print_statistics(statistics: &DatasetStatistics, max_ratio: f64) {
    for split in [&statistics.train, &statistics.validation] {
        print_split(split, max_ratio);
    }
}

fn print_split(split: &SplitStatistics, max_ratio: f64) {
    println!("{}", format!("{} split", split.split).cyan().bold());
    for (class, count) in &split.class_counts {
        println!("  {:<12} {:>7}", class, count);
    }
    let ratio = split.imbalance_ratio();
    let ratio_text = format!("{ratio:.2}:1");
    println!(
        "  {:<12} {:>7}   imbalance {}   majority baseline {:.2}%",
        "total",
        split.total,
        if ratio <= max_ratio { ratio_text.green() } else { ratio_text.red() },
        split.majority_baseline() * 100.0
    );
    println!();
}
