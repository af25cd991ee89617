//! seqtrain CLI: plateau-annealed training of text classifiers.
//!
//! Trains the bundled classifier on a fastText-format corpus directory,
//! resumes from checkpoints, and runs learning-rate range tests.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// seqtrain: supervised training with plateau annealing
#[derive(Parser, Debug)]
#[command(name = "seqtrain", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Arguments shared by every command that reads a corpus.
#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    /// Corpus directory with train.txt and optional dev.txt / test.txt
    #[arg(long)]
    corpus: PathBuf,

    /// Run directory for logs, checkpoints and models
    #[arg(short, long)]
    output: PathBuf,

    /// Seed for shuffling and initialization
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a new model
    Train {
        #[command(flatten)]
        run: RunArgs,

        /// Maximum number of epochs
        #[arg(long)]
        max_epochs: Option<usize>,

        /// Initial learning rate
        #[arg(long)]
        learning_rate: Option<f64>,

        /// Mini-batch size
        #[arg(long)]
        mini_batch_size: Option<usize>,

        /// Save a checkpoint after every epoch
        #[arg(long)]
        checkpoint: bool,
    },
    /// Continue training from <output>/checkpoint.pt
    Resume {
        #[command(flatten)]
        run: RunArgs,

        /// Number of additional epochs
        #[arg(long)]
        max_epochs: Option<usize>,
    },
    /// Sweep the learning rate and write learning_rate.tsv
    FindLr {
        #[command(flatten)]
        run: RunArgs,

        /// Number of sweep iterations
        #[arg(long)]
        iterations: Option<usize>,

        /// Lower learning-rate bound
        #[arg(long)]
        start: Option<f64>,

        /// Upper learning-rate bound
        #[arg(long)]
        end: Option<f64>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .seqtrain/config.toml into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "seqtrain", "seqtrain")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "seqtrain.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
