//! Hot-reloadable alias -> target mapping table
//!
//! Loaded from a TOML file (the external config source spec treats as
//! opaque). Readers never observe a half-mutated list: reload parses a
//! whole new `Vec<Entry>` off to the side and only then swaps it in under
//! the write lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::Metrics;

/// A single alias -> target mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub alias: String,
    pub target: String,
}

#[derive(Debug, Deserialize)]
struct MappingFile {
    #[serde(default, rename = "mappings")]
    entries: Vec<Entry>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read mapping file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse mapping file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Thread-safe, hot-reloadable mapping table.
pub struct MappingTable {
    entries: RwLock<Vec<Entry>>,
    path: RwLock<Option<PathBuf>>,
    metrics: Arc<Metrics>,
}

impl MappingTable {
    /// An empty table, not yet backed by any file.
    pub fn empty(metrics: Arc<Metrics>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            path: RwLock::new(None),
            metrics,
        }
    }

    /// Parse `path` and atomically replace the current sequence. Increments
    /// `reloads` on success; on failure, the previous mapping is kept.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: MappingFile = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        {
            let mut guard = self.entries.write();
            *guard = parsed.entries;
        }
        *self.path.write() = Some(path.to_path_buf());
        self.metrics.reloads.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Reload from whatever path was last used successfully.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let path = self.path.read().clone();
        match path {
            Some(path) => self.load(path),
            None => Ok(()),
        }
    }

    /// Cheap snapshot of the current mapping sequence.
    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.read().clone()
    }

    /// Resolve `alias` to a target, recording a cache hit or miss.
    pub fn resolve_by_alias(&self, alias: &str) -> Option<String> {
        let guard = self.entries.read();
        let found = guard.iter().find(|e| e.alias == alias).map(|e| e.target.clone());
        if found.is_some() {
            self.metrics.cache_hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            self.metrics.cache_misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        found
    }
}
