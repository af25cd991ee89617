//! Subcommand handlers.

use crate::{Commands, ConfigAction, RunArgs};
use seqtrain_ml::training::checkpoint::CHECKPOINT_FILE;
use seqtrain_ml::training::{EventSink, ModelTrainer, TracingSink, TrainingResult};
use seqtrain_ml::{SeqtrainConfig, TextClassifier, load_fasttext_corpus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace, config_file),
        Commands::Train {
            run,
            max_epochs,
            learning_rate,
            mini_batch_size,
            checkpoint,
        } => {
            let mut config = load_config(workspace, config_file)?;
            apply_run_overrides(&mut config, &run);
            if let Some(epochs) = max_epochs {
                config.trainer.max_epochs = epochs;
            }
            if let Some(lr) = learning_rate {
                config.trainer.learning_rate = lr;
            }
            if let Some(size) = mini_batch_size {
                config.trainer.mini_batch_size = size;
            }
            config.trainer.checkpoint |= checkpoint;
            handle_train(run, config, false).await
        }
        Commands::Resume { run, max_epochs } => {
            let mut config = load_config(workspace, config_file)?;
            apply_run_overrides(&mut config, &run);
            if let Some(epochs) = max_epochs {
                config.trainer.max_epochs = epochs;
            }
            handle_train(run, config, true).await
        }
        Commands::FindLr {
            run,
            iterations,
            start,
            end,
        } => {
            let mut config = load_config(workspace, config_file)?;
            apply_run_overrides(&mut config, &run);
            if let Some(iterations) = iterations {
                config.lr_finder.iterations = iterations;
            }
            if let Some(start) = start {
                config.lr_finder.start_learning_rate = start;
            }
            if let Some(end) = end {
                config.lr_finder.end_learning_rate = end;
            }
            handle_find_lr(run, config).await
        }
    }
}

fn load_config(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<SeqtrainConfig> {
    let config: SeqtrainConfig = seqtrain_core::load_layered(Some(workspace), config_file, None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config.validate()?;
    Ok(config)
}

fn apply_run_overrides(config: &mut SeqtrainConfig, run: &RunArgs) {
    if let Some(seed) = run.seed {
        config.trainer.seed = Some(seed);
        config.lr_finder.seed = Some(seed);
        config.classifier.seed = seed;
    }
}

/// Cancel `token` on the first Ctrl-C. Training notices at the next epoch
/// boundary, saves the final model and runs the final test.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current epoch");
            token.cancel();
        }
    });
}

async fn handle_train(run: RunArgs, config: SeqtrainConfig, resume: bool) -> anyhow::Result<()> {
    let corpus = load_fasttext_corpus(&run.corpus)?;
    let model = TextClassifier::from_corpus(&corpus, &config.classifier)?;
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let kind = config.trainer.optimizer;

    let mut trainer = if resume {
        let path = run.output.join(CHECKPOINT_FILE);
        ModelTrainer::from_checkpoint(&path, model, corpus, kind, sink)?
    } else {
        ModelTrainer::new(model, corpus, kind, sink)
    };

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    let output = run.output.clone();
    let trainer_config = config.trainer;
    let result =
        tokio::task::spawn_blocking(move || trainer.train(&output, &trainer_config, &token))
            .await??;

    print_summary(&run.output, &result);
    Ok(())
}

async fn handle_find_lr(run: RunArgs, config: SeqtrainConfig) -> anyhow::Result<()> {
    let corpus = load_fasttext_corpus(&run.corpus)?;
    let model = TextClassifier::from_corpus(&corpus, &config.classifier)?;
    let mut trainer = ModelTrainer::new(
        model,
        corpus,
        config.trainer.optimizer,
        Arc::new(TracingSink),
    );

    let output = run.output.clone();
    let finder_config = config.lr_finder;
    let path: PathBuf =
        tokio::task::spawn_blocking(move || trainer.find_learning_rate(&output, &finder_config))
            .await??;

    println!("Learning-rate sweep written to {}", path.display());
    Ok(())
}

fn print_summary(output: &Path, result: &TrainingResult) {
    println!();
    println!("  Run directory:  {}", output.display());
    println!("  Termination:    {:?}", result.termination);
    println!("  Epochs run:     {}", result.epochs_run);
    if let Some(loss) = result.train_loss_history.last() {
        println!("  Final loss:     {loss:.4}");
    }
    if let Some(best) = result
        .dev_score_history
        .iter()
        .copied()
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))))
    {
        println!("  Best dev score: {best:.4}");
    }
    println!("  Test score:     {:.4}", result.test_score);
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = seqtrain_core::workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }

            let toml_str = toml::to_string_pretty(&SeqtrainConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(workspace, config_file)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_config_init_writes_loadable_defaults() {
        let dir = TempDir::new().unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();

        let path = seqtrain_core::workspace_config_path(dir.path());
        let written = std::fs::read_to_string(&path).unwrap();
        let parsed: SeqtrainConfig = toml::from_str(&written).unwrap();
        assert_eq!(parsed, SeqtrainConfig::default());

        // a second init leaves the file alone
        std::fs::write(&path, "[trainer]\nmax_epochs = 7\n").unwrap();
        handle_config(ConfigAction::Init, dir.path(), None).unwrap();
        assert!(
            std::fs::read_to_string(&path)
                .unwrap()
                .contains("max_epochs = 7")
        );
    }

    #[test]
    fn test_seed_override_reaches_every_section() {
        let mut config = SeqtrainConfig::default();
        let run = RunArgs {
            corpus: PathBuf::from("c"),
            output: PathBuf::from("o"),
            seed: Some(42),
        };
        apply_run_overrides(&mut config, &run);
        assert_eq!(config.trainer.seed, Some(42));
        assert_eq!(config.lr_finder.seed, Some(42));
        assert_eq!(config.classifier.seed, 42);
    }
}
