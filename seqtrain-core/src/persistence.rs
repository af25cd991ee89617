//! Shared persistence utilities: atomic file writes, append-only logs, JSON load/save.
//!
//! Two write disciplines are supported: snapshots (model artifacts,
//! checkpoints) are replaced atomically via a `.tmp` sibling and a rename,
//! while logs (`loss.tsv`, `training.log`) only ever grow, so a crash in the
//! middle of a write can at worst truncate the last line.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a `.tmp` sibling file,
/// then atomically renames to the target path.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
///
/// Writes to a `.tmp` sibling file, flushes it to disk, then renames it over
/// the target path. Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
/// Returns `Err` on I/O errors or deserialization failures.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// An append-only, line-oriented output file.
///
/// The file is opened for every write so that each line lands on disk
/// independently of the others.
#[derive(Debug, Clone)]
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    /// Create (or truncate) the file and write an optional header line.
    pub fn create(path: impl Into<PathBuf>, header: Option<&str>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        if let Some(header) = header {
            writeln!(file, "{header}")?;
        }
        file.flush()?;
        Ok(Self { path })
    }

    /// Open an existing file for appending, creating it empty if needed.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path })
    }

    /// Append one line. A trailing newline is added.
    pub fn append_line(&self, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        epoch: usize,
        loss: f64,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint.pt");

        let data = Snapshot {
            epoch: 3,
            loss: 0.25,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Snapshot> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("models").join("best-model.pt");

        atomic_write(&path, b"{}").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("final-model.pt");

        atomic_write_json(&path, &"weights").unwrap();

        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_json_nonexistent() {
        let result: io::Result<Option<Snapshot>> = load_json(Path::new("/nonexistent/file.json"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_load_json_malformed_is_invalid_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_json::<Snapshot>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_append_log_keeps_history() {
        let dir = TempDir::new().unwrap();
        let log = AppendLog::create(dir.path().join("loss.tsv"), Some("EPOCH\tLOSS")).unwrap();
        log.append_line("0\t1.5").unwrap();
        log.append_line("1\t1.2").unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content, "EPOCH\tLOSS\n0\t1.5\n1\t1.2\n");
    }

    #[test]
    fn test_append_log_create_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("learning_rate.tsv");
        std::fs::write(&path, "stale\n").unwrap();

        AppendLog::create(&path, Some("ITERATION")).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ITERATION\n");
    }

    #[test]
    fn test_append_log_open_preserves_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("training.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let log = AppendLog::open(&path).unwrap();
        log.append_line("next run").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "earlier run\nnext run\n"
        );
    }
}
