//! Engine state persistence
//!
//! A snapshot is a single JSON document holding every service, counter and
//! token. It is written at shutdown and read back at startup so label
//! sequences, positions and pending no-show deadlines survive a restart.

use crate::domain::token::Token;
use crate::domain::types::{Counter, Service};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub services: Vec<Service>,
    pub counters: Vec<Counter>,
    pub tokens: Vec<Token>,
}

impl EngineSnapshot {
    /// Write to `path` via a temporary file and rename
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let json = serde_json::to_vec_pretty(self).context("Failed to serialize snapshot")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;

        info!(
            file = %path.display(),
            services = %self.services.len(),
            tokens = %self.tokens.len(),
            "snapshot_saved"
        );
        Ok(())
    }

    /// Read from `path`. A missing file is not an error.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read(path).with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        let snapshot: Self = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;

        info!(
            file = %path.display(),
            services = %snapshot.services.len(),
            tokens = %snapshot.tokens.len(),
            "snapshot_loaded"
        );
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::PriorityClass;
    use chrono::Utc;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(EngineSnapshot::load(dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_preserves_tokens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/snapshot.json");

        let mut token = Token::new(
            "PER-004".into(),
            4,
            "citizen".into(),
            "permits".into(),
            PriorityClass::Disabled,
            None,
            Utc::now(),
        );
        token.queue_position = Some(1);
        let snapshot = EngineSnapshot {
            services: vec![Service::new("permits", "Permits", 7)],
            counters: vec![Counter::new("c1", 1, "permits")],
            tokens: vec![token],
        };
        snapshot.save(&path).unwrap();

        let loaded = EngineSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "{not json").unwrap();
        let err = EngineSnapshot::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse snapshot"));
    }
}
