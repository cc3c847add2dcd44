//! Session persistence.
//!
//! A session serializes to a single JSON document. [`JsonSessionStore`]
//! keeps one `<session-id>.json` file per session under a base directory
//! and writes atomically (temp file + rename) so a crash mid-save never
//! leaves a truncated document. [`MemorySessionStore`] backs tests.
//!
//! Persistence failures are never fatal to a workflow: callers log them
//! and continue with the in-memory state as authoritative.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::session::Session;

/// Errors from session persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize session {id}: {source}")]
    Serialize {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse session document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistence contract for sessions.
///
/// Save is invoked after every phase change, every task start/complete/
/// fail, every adversarial increment and review, and every group advance.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &Session) -> Result<(), StoreError>;
    async fn load(&self, id: Uuid) -> Result<Option<Session>, StoreError>;
    async fn list(&self) -> Result<Vec<Session>, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// File-backed store: one pretty-printed JSON document per session.
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    base_dir: PathBuf,
}

impl JsonSessionStore {
    /// Create a store rooted at `base_dir`. The directory is created on
    /// first save, not here.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Default store location: `$XDG_DATA_HOME/ensemble/sessions` or
    /// `~/.local/share/ensemble/sessions`.
    pub fn default_dir() -> PathBuf {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("ensemble").join("sessions");
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local")
            .join("share")
            .join("ensemble")
            .join("sessions")
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.base_dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.base_dir).map_err(|e| StoreError::Io {
            path: self.base_dir.clone(),
            source: e,
        })?;

        let json =
            serde_json::to_string_pretty(session).map_err(|e| StoreError::Serialize {
                id: session.id,
                source: e,
            })?;

        // Atomic write: temp file in the same directory, then rename.
        let final_path = self.session_path(session.id);
        let temp_path = self.base_dir.join(format!("{}.json.tmp", session.id));
        std::fs::write(&temp_path, json).map_err(|e| StoreError::Io {
            path: temp_path.clone(),
            source: e,
        })?;
        std::fs::rename(&temp_path, &final_path).map_err(|e| StoreError::Io {
            path: final_path.clone(),
            source: e,
        })?;

        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let path = self.session_path(id);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Io {
                    path,
                    source: e,
                });
            }
        };

        let session =
            serde_json::from_str(&contents).map_err(|e| StoreError::Parse { path, source: e })?;
        Ok(Some(session))
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.base_dir.clone(),
                    source: e,
                });
            }
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.base_dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let contents = std::fs::read_to_string(&path).map_err(|e| StoreError::Io {
                path: path.clone(),
                source: e,
            })?;
            match serde_json::from_str::<Session>(&contents) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    // A corrupt document should not hide every other session.
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable session document"
                    );
                }
            }
        }

        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let path = self.session_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }
}

/// In-memory store for tests and dry runs. Stores the serialized document
/// so save/load exercises the same round trip as the file store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    documents: Mutex<HashMap<Uuid, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.documents.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let json =
            serde_json::to_string_pretty(session).map_err(|e| StoreError::Serialize {
                id: session.id,
                source: e,
            })?;
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id, json);
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        let Some(json) = documents.get(&id) else {
            return Ok(None);
        };
        let session = serde_json::from_str(json).map_err(|e| StoreError::Parse {
            path: PathBuf::from(format!("<memory:{id}>")),
            source: e,
        })?;
        Ok(Some(session))
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        let mut sessions = Vec::new();
        for json in documents.values() {
            if let Ok(session) = serde_json::from_str::<Session>(json) {
                sessions.push(session);
            }
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{IterativeState, ModePayload, Session, SessionConfig};

    fn test_session() -> Session {
        Session::new(
            "test objective",
            SessionConfig::default(),
            ModePayload::Iterative(IterativeState::new("prompt", "DONE", 50)),
        )
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());

        let session = test_session();
        store.save(&session).await.unwrap();

        let loaded = store.load(session.id).await.unwrap().expect("session");
        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn save_restore_save_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());

        let session = test_session();
        store.save(&session).await.unwrap();
        let path = dir.path().join(format!("{}.json", session.id));
        let first = std::fs::read_to_string(&path).unwrap();

        let restored = store.load(session.id).await.unwrap().unwrap();
        store.save(&restored).await.unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn load_missing_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_skips_corrupt_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());

        let session = test_session();
        store.save(&session).await.unwrap();
        std::fs::write(dir.path().join("garbage.json"), "not json at all").unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, session.id);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());

        let session = test_session();
        store.save(&session).await.unwrap();

        store.delete(session.id).await.unwrap();
        assert!(store.load(session.id).await.unwrap().is_none());
        // Second delete is a no-op.
        store.delete(session.id).await.unwrap();
    }

    #[tokio::test]
    async fn list_on_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_temp_files_left_behind_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSessionStore::new(dir.path());
        store.save(&test_session()).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemorySessionStore::new();
        let session = test_session();
        store.save(&session).await.unwrap();
        assert_eq!(store.len(), 1);

        let loaded = store.load(session.id).await.unwrap().unwrap();
        assert_eq!(loaded, session);

        store.delete(session.id).await.unwrap();
        assert!(store.is_empty());
    }
}
