//! Persistence for the one record that must survive a host restart: which
//! tab (if any) the previous incarnation had attached to.
//!
//! Clearing `isActive` but retaining `activeTabId` on exit is the
//! correctness lever that lets a fresh incarnation find and tear down a
//! stale attachment rather than colliding with it.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;

use core_types::{AgentError, AgentErrorKind, PersistentSessionRecord};

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load(&self) -> Result<PersistentSessionRecord, AgentError>;
    async fn save(&self, record: &PersistentSessionRecord) -> Result<(), AgentError>;
}

/// In-memory store; loses its record across process restarts, so only
/// useful for tests and for hosts that don't need cross-incarnation
/// reconciliation.
#[derive(Default)]
pub struct MemoryStore {
    record: RwLock<PersistentSessionRecord>,
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn load(&self) -> Result<PersistentSessionRecord, AgentError> {
        Ok(self.record.read().await.clone())
    }

    async fn save(&self, record: &PersistentSessionRecord) -> Result<(), AgentError> {
        *self.record.write().await = record.clone();
        Ok(())
    }
}

/// JSON-file-backed store, for hosts (a plain long-running process) that
/// can lose and regain this controller's memory across restarts.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn load(&self) -> Result<PersistentSessionRecord, AgentError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                AgentError::new(AgentErrorKind::Internal)
                    .with_hint(format!("corrupt session record: {err}"))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(PersistentSessionRecord::default())
            }
            Err(err) => Err(AgentError::new(AgentErrorKind::Internal).with_hint(err.to_string())),
        }
    }

    async fn save(&self, record: &PersistentSessionRecord) -> Result<(), AgentError> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|err| {
            AgentError::new(AgentErrorKind::Internal).with_hint(err.to_string())
        })?;
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        fs::write(&self.path, bytes)
            .await
            .map_err(|err| AgentError::new(AgentErrorKind::Internal).with_hint(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trips_and_defaults_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("session.json"));

        let loaded = store.load().await.unwrap();
        assert!(!loaded.is_active);
        assert!(loaded.active_tab.is_none());

        let mut record = PersistentSessionRecord {
            active_tab: Some(core_types::TabHandle(7)),
            session_id: Some(core_types::SessionId::new()),
            is_active: true,
            last_update: None,
        };
        record.touch();
        store.save(&record).await.unwrap();

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.active_tab, Some(core_types::TabHandle(7)));
        assert!(reloaded.is_active);
    }
}
