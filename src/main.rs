//! Sorghum cultivar classification CLI
//!
//! Fine-tune a backbone on the training manifest, predict the test set, and
//! inspect the dataset.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use sorghum_cultivar::backend::{backend_name, default_device, InferenceBackend, TrainingBackend};
use sorghum_cultivar::config::ExperimentConfig;
use sorghum_cultivar::dataset::{scan_images, DatasetMode, RecordStore};
use sorghum_cultivar::inference::{run_test, submission_path};
use sorghum_cultivar::model::descriptor::BackboneDescriptor;
use sorghum_cultivar::model::BackboneKind;
use sorghum_cultivar::training::run_training;
use sorghum_cultivar::utils::logging::{init_logging, LogConfig};
use sorghum_cultivar::utils::{format_number, share_bar};

/// Sorghum cultivar classification with Burn
#[derive(Parser, Debug)]
#[command(name = "sorghum")]
#[command(version = "0.1.0")]
#[command(about = "Sorghum cultivar classification from leaf photographs", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, conflicts_with_all = ["verbose", "quiet"])]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fine-tune a classifier on the training manifest
    Train {
        /// Experiment configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Override the batch size
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Predict the test manifest and write a submission file
    Test {
        /// Experiment configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint directory written during training
        #[arg(long)]
        checkpoint: PathBuf,

        /// Submission CSV, defaults to `<output_dir>/submission.csv`
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Record counts and cultivar distribution of the training manifest
    Stats {
        /// Experiment configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Number of cultivars to list
        #[arg(long, default_value = "20")]
        top: usize,
    },

    /// Decode every image referenced by a manifest
    Scan {
        /// Experiment configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Scan the test manifest instead of the training manifest
        #[arg(long, default_value = "false")]
        test: bool,
    },

    /// List the available backbones
    Backbones,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else if let Some(name) = &cli.log_level {
        LogConfig::with_level(name)
    } else {
        LogConfig::default()
    };
    let _ = init_logging(&log_config);
    tracing::debug!("Logging at level {}", log_config.level);

    print_banner();

    match cli.command {
        Commands::Train {
            config,
            epochs,
            batch_size,
        } => cmd_train(&config, epochs, batch_size),
        Commands::Test {
            config,
            checkpoint,
            output,
        } => cmd_test(&config, &checkpoint, output),
        Commands::Stats { config, top } => cmd_stats(&config, top),
        Commands::Scan { config, test } => cmd_scan(&config, test),
        Commands::Backbones => {
            cmd_backbones();
            Ok(())
        }
    }
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔════════════════════════════════════════════════════════╗
 ║   🌾 Sorghum Cultivar Classification                   ║
 ║   Leaf photographs → cultivar, with Burn + Rust        ║
 ╚════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}

fn load_config(path: &Path) -> Result<ExperimentConfig> {
    ExperimentConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

fn cmd_train(config_path: &Path, epochs: Option<usize>, batch_size: Option<usize>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(epochs) = epochs {
        config.training.epochs = epochs;
    }
    if let Some(batch_size) = batch_size {
        config.training.batch_size = batch_size;
    }
    config.validate()?;

    info!("Training {} on {}", config.model.backbone, backend_name());
    println!("{} {}", "Backend:".cyan(), backend_name());
    println!("{} {}", "Backbone:".cyan(), config.model.backbone);

    let summary = run_training::<TrainingBackend>(&config, &default_device())?;

    println!("{}", "Training Complete!".green().bold());
    println!("  Best validation loss: {:.4}", summary.best_val_loss);
    if let Some(best) = &summary.best_checkpoint {
        println!("  Best checkpoint: {}", best.display());
    }
    println!("  Last checkpoint: {}", summary.last_checkpoint.display());
    println!();
    println!("{}", "Next steps:".cyan().bold());
    println!(
        "  • Predict the test set: sorghum test --config {} --checkpoint {}",
        config_path.display(),
        summary
            .best_checkpoint
            .as_ref()
            .unwrap_or(&summary.last_checkpoint)
            .display()
    );

    Ok(())
}

fn cmd_test(config_path: &Path, checkpoint: &Path, output: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let output = output.unwrap_or_else(|| submission_path(&config.output_dir));

    println!("{} {}", "Checkpoint:".cyan(), checkpoint.display());
    let predictions = run_test::<InferenceBackend>(&config, checkpoint, &output, default_device())
        .with_context(|| format!("predicting with {}", checkpoint.display()))?;

    println!(
        "{} {} predictions written to {}",
        "Done:".green().bold(),
        format_number(predictions.len()),
        output.display()
    );
    Ok(())
}

fn cmd_stats(config_path: &Path, top: usize) -> Result<()> {
    let config = load_config(config_path)?;
    let store = RecordStore::from_manifest(
        &config.dataset.train_manifest_path(),
        &config.dataset.root,
        DatasetMode::Training,
    )?;

    let total = store.len();
    let mut counts: Vec<(&str, usize)> = store.cultivar_counts().into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    println!("{}", "Dataset Statistics:".cyan().bold());
    println!("  Records:   {}", format_number(total));
    println!("  Cultivars: {}", counts.len());
    if let (Some(most), Some(least)) = (counts.first(), counts.last()) {
        println!("  Largest:   {} ({})", most.0, most.1);
        println!("  Smallest:  {} ({})", least.0, least.1);
    }
    println!();

    let largest = counts.first().map(|c| c.1).unwrap_or(1).max(1);
    for (name, count) in counts.iter().take(top) {
        let share = *count as f64 / total.max(1) as f64;
        println!(
            "  {:<16} {} {:>6} ({:>5.2}%)",
            name,
            share_bar(*count as f64 / largest as f64, 30),
            count,
            share * 100.0
        );
    }
    if counts.len() > top {
        println!("  ... {} more", counts.len() - top);
    }

    Ok(())
}

fn cmd_scan(config_path: &Path, test: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let (manifest, mode) = if test {
        (config.dataset.test_manifest_path(), DatasetMode::Inference)
    } else {
        (config.dataset.train_manifest_path(), DatasetMode::Training)
    };

    let store = RecordStore::from_manifest(&manifest, &config.dataset.root, mode)?;
    println!(
        "{} {} images from {}",
        "Scanning".cyan(),
        format_number(store.len()),
        manifest.display()
    );

    let report = scan_images(&store, true);
    if report.is_clean() {
        println!("{} all {} images decode", "OK:".green().bold(), format_number(report.total));
        return Ok(());
    }

    println!(
        "{} {} of {} images failed to decode",
        "Warning:".yellow().bold(),
        format_number(report.failures.len()),
        format_number(report.total)
    );
    for (path, reason) in &report.failures {
        println!("  {} {}", path.display(), reason.dimmed());
    }
    Ok(())
}

fn cmd_backbones() {
    println!("{}", "Available Backbones:".cyan().bold());
    println!("  {:<18} {:>10} {:>10}", "name", "input", "features");
    for kind in BackboneKind::ALL {
        let descriptor = BackboneDescriptor::for_kind(kind);
        println!(
            "  {:<18} {:>10} {:>10}",
            kind.to_string(),
            format!("{0}x{0}", descriptor.expected_input_size),
            descriptor.output_width
        );
    }
}
