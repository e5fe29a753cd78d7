//! Atomic rename-based JSON persistence (spec.md §4.8).
//!
//! Every write serializes to a sibling `*.tmp` file, fsyncs the file
//! descriptor, then renames it over the target — atomic on a POSIX-like
//! filesystem within the same directory, so a concurrent reader always
//! observes either the fully pre-update or fully post-update content
//! (invariant #4, spec.md §8). Grounded on the teacher's
//! `infrastructure/settings_persistence.rs` `SettingsPersistence::save`,
//! generalised to four per-key file kinds and extended with the fsync
//! step and corrupt-file quarantine the teacher's version doesn't need.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use crate::domain::errors::EngineError;
use crate::domain::partial::PartialState;
use crate::domain::risk::RiskPosition;
use crate::domain::signal::Signal;

#[derive(Debug, Clone)]
pub struct PersistenceLayer {
    root: PathBuf,
}

impl PersistenceLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, kind: &str, parts: &[&str]) -> PathBuf {
        let mut p = self.root.join(kind);
        for (i, part) in parts.iter().enumerate() {
            if i + 1 == parts.len() {
                p = p.join(format!("{part}.json"));
            } else {
                p = p.join(part);
            }
        }
        p
    }

    pub async fn save_signal(
        &self,
        strategy_name: &str,
        symbol: &str,
        signal: &Signal,
    ) -> Result<(), EngineError> {
        write_atomic(&self.path("signal", &[strategy_name, symbol]), signal).await
    }

    pub async fn load_signal(
        &self,
        strategy_name: &str,
        symbol: &str,
    ) -> Result<Option<Signal>, EngineError> {
        read_json(&self.path("signal", &[strategy_name, symbol])).await
    }

    pub async fn delete_signal(&self, strategy_name: &str, symbol: &str) -> Result<(), EngineError> {
        delete(&self.path("signal", &[strategy_name, symbol])).await
    }

    pub async fn save_schedule(
        &self,
        strategy_name: &str,
        symbol: &str,
        signal: &Signal,
    ) -> Result<(), EngineError> {
        write_atomic(&self.path("schedule", &[strategy_name, symbol]), signal).await
    }

    pub async fn load_schedule(
        &self,
        strategy_name: &str,
        symbol: &str,
    ) -> Result<Option<Signal>, EngineError> {
        read_json(&self.path("schedule", &[strategy_name, symbol])).await
    }

    pub async fn delete_schedule(
        &self,
        strategy_name: &str,
        symbol: &str,
    ) -> Result<(), EngineError> {
        delete(&self.path("schedule", &[strategy_name, symbol])).await
    }

    pub async fn save_risk(
        &self,
        risk_name: &str,
        positions: &[RiskPosition],
    ) -> Result<(), EngineError> {
        write_atomic(&self.path("risk", &[risk_name]), &positions.to_vec()).await
    }

    pub async fn load_risk(&self, risk_name: &str) -> Result<Vec<RiskPosition>, EngineError> {
        Ok(read_json(&self.path("risk", &[risk_name]))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_partial(
        &self,
        strategy_name: &str,
        symbol: &str,
        state: &HashMap<String, PartialState>,
    ) -> Result<(), EngineError> {
        write_atomic(&self.path("partial", &[strategy_name, symbol]), state).await
    }

    pub async fn load_partial(
        &self,
        strategy_name: &str,
        symbol: &str,
    ) -> Result<HashMap<String, PartialState>, EngineError> {
        Ok(read_json(&self.path("partial", &[strategy_name, symbol]))
            .await?
            .unwrap_or_default())
    }

    pub async fn delete_partial(
        &self,
        strategy_name: &str,
        symbol: &str,
    ) -> Result<(), EngineError> {
        delete(&self.path("partial", &[strategy_name, symbol])).await
    }
}

async fn write_atomic<T: Serialize + Send + 'static>(
    path: &Path,
    value: &T,
) -> Result<(), EngineError> {
    let path = path.to_path_buf();
    let payload = serde_json::to_vec_pretty(value).map_err(|e| EngineError::Persistence {
        op: "serialize".into(),
        reason: e.to_string(),
    })?;

    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &payload))
        .await
        .map_err(|e| EngineError::Persistence {
            op: "write".into(),
            reason: format!("task join error: {e}"),
        })?
}

fn write_atomic_blocking(path: &Path, payload: &[u8]) -> Result<(), EngineError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| EngineError::Persistence {
        op: "mkdir".into(),
        reason: e.to_string(),
    })?;

    let tmp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp_path).map_err(|e| EngineError::Persistence {
        op: "create tmp".into(),
        reason: e.to_string(),
    })?;
    file.write_all(payload).map_err(|e| EngineError::Persistence {
        op: "write tmp".into(),
        reason: e.to_string(),
    })?;
    file.sync_all().map_err(|e| EngineError::Persistence {
        op: "fsync".into(),
        reason: e.to_string(),
    })?;
    drop(file);

    std::fs::rename(&tmp_path, path).map_err(|e| EngineError::Persistence {
        op: "rename".into(),
        reason: e.to_string(),
    })?;

    Ok(())
}

async fn read_json<T: DeserializeOwned + Send + 'static>(
    path: &Path,
) -> Result<Option<T>, EngineError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_json_blocking::<T>(&path))
        .await
        .map_err(|e| EngineError::Persistence {
            op: "read".into(),
            reason: format!("task join error: {e}"),
        })?
}

fn read_json_blocking<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, EngineError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            error!("persistence read error for {:?}: {e}", path);
            return Err(EngineError::Persistence {
                op: "read".into(),
                reason: e.to_string(),
            });
        }
    };

    match serde_json::from_str::<T>(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            // Self-heal: quarantine the corrupt file (rename, never
            // silently delete, per spec.md §9 REDESIGN FLAGS) and treat
            // the key as absent from here on.
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            let quarantine = path.with_extension(format!("corrupt-{now}"));
            warn!(
                "corrupt persistence file {:?} ({e}); quarantining to {:?}",
                path, quarantine
            );
            let _ = std::fs::rename(path, &quarantine);
            Ok(None)
        }
    }
}

async fn delete(path: &Path) -> Result<(), EngineError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| EngineError::Persistence {
                op: "delete".into(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    })
    .await
    .map_err(|e| EngineError::Persistence {
        op: "delete".into(),
        reason: format!("task join error: {e}"),
    })?
}
