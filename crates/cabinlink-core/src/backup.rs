//! Hub configuration backup.
//!
//! Bundles the hub's automation, script, and scene files into one JSON
//! snapshot for the portal. Files are optional; an unreadable one is
//! logged and left out rather than failing the snapshot.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

/// Snapshot format version understood by the portal.
const SNAPSHOT_VERSION: &str = "1.0";

/// Configuration files included in a snapshot, relative to the hub's
/// config directory.
const CONFIG_FILES: &[(&str, &str)] = &[
    ("automations", "automations.yaml"),
    ("scripts", "scripts.yaml"),
    ("scenes", "scenes.yaml"),
];

#[derive(Debug, Clone)]
pub struct BackupCollector {
    config_dir: PathBuf,
}

impl BackupCollector {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self { config_dir: config_dir.into() }
    }

    /// Build a snapshot of whatever config files are present right now.
    pub fn snapshot(&self) -> Value {
        let mut snapshot = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "version": SNAPSHOT_VERSION,
        });

        for &(key, file_name) in CONFIG_FILES {
            let path = self.config_dir.join(file_name);
            if let Some(contents) = read_optional(&path) {
                snapshot[key] = Value::String(contents);
            }
        }

        snapshot
    }
}

fn read_optional(path: &Path) -> Option<String> {
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not read config file");
            None
        }
    }
}
