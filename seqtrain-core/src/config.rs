//! Layered configuration loading.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> explicit file -> environment -> explicit overrides.
//! The concrete configuration type is owned by the caller; this module only
//! knows how to stack the sources.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};

/// Environment variable prefix, e.g. `SEQTRAIN_TRAINER__LEARNING_RATE=0.05`.
pub const ENV_PREFIX: &str = "SEQTRAIN_";

/// Path of the workspace-local configuration file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".seqtrain").join("config.toml")
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "seqtrain", "seqtrain")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `SEQTRAIN_`, `__` separates sections)
/// 3. Explicit config file (`--config`)
/// 4. Workspace-local config (`.seqtrain/config.toml`)
/// 5. User config (`~/.config/seqtrain/config.toml`)
/// 6. Built-in defaults
pub fn load_layered<T>(
    workspace: Option<&Path>,
    explicit_file: Option<&Path>,
    overrides: Option<&T>,
) -> Result<T, Box<figment::Error>>
where
    T: Default + Serialize + DeserializeOwned,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            tracing::debug!(path = %user_config.display(), "Merging user config");
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            tracing::debug!(path = %ws_config.display(), "Merging workspace config");
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = explicit_file {
        figment = figment.merge(Toml::file(file));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether any seqtrain configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        learning_rate: f64,
        max_epochs: usize,
        #[serde(default)]
        tag: Option<String>,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                learning_rate: 0.1,
                max_epochs: 100,
                tag: None,
            }
        }
    }

    #[test]
    fn test_defaults_when_no_sources() {
        let dir = TempDir::new().unwrap();
        let loaded: Sample = load_layered(Some(dir.path()), None, None).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_workspace_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "max_epochs = 7\n").unwrap();

        let loaded: Sample = load_layered(Some(dir.path()), None, None).unwrap();
        assert_eq!(loaded.max_epochs, 7);
        assert_eq!(loaded.learning_rate, 0.1);
        assert!(config_exists(Some(dir.path())));
    }

    #[test]
    fn test_explicit_file_beats_workspace_file() {
        let dir = TempDir::new().unwrap();
        let ws = workspace_config_path(dir.path());
        std::fs::create_dir_all(ws.parent().unwrap()).unwrap();
        std::fs::write(&ws, "max_epochs = 7\n").unwrap();
        let explicit = dir.path().join("run.toml");
        std::fs::write(&explicit, "max_epochs = 2\ntag = \"sweep\"\n").unwrap();

        let loaded: Sample = load_layered(Some(dir.path()), Some(&explicit), None).unwrap();
        assert_eq!(loaded.max_epochs, 2);
        assert_eq!(loaded.tag.as_deref(), Some("sweep"));
    }

    #[test]
    fn test_overrides_win() {
        let dir = TempDir::new().unwrap();
        let overrides = Sample {
            learning_rate: 0.5,
            max_epochs: 1,
            tag: None,
        };
        let loaded: Sample = load_layered(Some(dir.path()), None, Some(&overrides)).unwrap();
        assert_eq!(loaded.learning_rate, 0.5);
        assert_eq!(loaded.max_epochs, 1);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("bad.toml");
        std::fs::write(&explicit, "max_epochs = \"many\"\n").unwrap();

        let result: Result<Sample, _> = load_layered(Some(dir.path()), Some(&explicit), None);
        assert!(result.is_err());
    }
}
