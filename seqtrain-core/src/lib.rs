//! # seqtrain-core
//!
//! Shared building blocks for the seqtrain workspace: crash-safe file
//! persistence (atomic replace for snapshots, append-only for logs) and
//! layered configuration loading.

pub mod config;
pub mod persistence;

pub use config::{config_exists, load_layered, workspace_config_path};
pub use persistence::{AppendLog, atomic_write, atomic_write_json, load_json};
