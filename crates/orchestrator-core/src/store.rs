//! Durable JSON snapshot of session state (spec §4.6).
//!
//! Write path follows the teacher's `PersistenceManager::save_session`
//! (serialize, write, `sync_all`) generalized to a single top-level snapshot
//! file with the write-tmp-then-rename atomicity the spec requires instead
//! of per-session directories.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::model::{ManagerState, SessionInfo, SessionMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub info: SessionInfo,
    pub messages: Vec<SessionMessage>,
    pub session_token: String,
    pub container_id: Option<String>,
    pub manager_api_token: Option<String>,
    pub manager_state: Option<ManagerState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub sessions: Vec<PersistedSession>,
    pub internal_secret: String,
}

impl PersistedState {
    fn shape_is_valid(value: &serde_json::Value) -> bool {
        value.is_object()
            && value.get("sessions").is_some_and(|s| s.is_array())
            && value
                .get("internalSecret")
                .is_some_and(|s| s.is_string())
    }
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns `None` on an absent or corrupt/shape-mismatched file (spec
    /// §4.6, §6 "a shape mismatch falls back to empty").
    pub async fn load(&self) -> Option<PersistedState> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(d) => d,
            Err(_) => return None,
        };

        let value: serde_json::Value = match serde_json::from_slice(&data) {
            Ok(v) => v,
            Err(_) => return None,
        };
        if !PersistedState::shape_is_valid(&value) {
            return None;
        }

        serde_json::from_value(value).ok()
    }

    /// Serializes `state`, writes to `path.tmp`, then renames into place.
    /// On write failure the tempfile is unlinked so a partial write never
    /// masquerades as the real snapshot.
    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        let tmp_path = self.tmp_path();
        let data = serde_json::to_vec_pretty(state)?;

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContextUsage, PermissionMode, SessionStatus};
    use chrono::Utc;
    use proptest::prelude::*;

    fn sample_state() -> PersistedState {
        sample_state_with("s1", "deadbeef", "cafebabe")
    }

    fn sample_state_with(id: &str, session_token: &str, internal_secret: &str) -> PersistedState {
        PersistedState {
            sessions: vec![PersistedSession {
                info: SessionInfo {
                    id: id.into(),
                    name: "demo".into(),
                    creator: "alice".into(),
                    repo_url: "https://github.com/a/b".into(),
                    branch: "main".into(),
                    docker_access: false,
                    is_manager: false,
                    permission_mode: PermissionMode::Normal,
                    model: "opus".into(),
                    notifications_enabled: true,
                    container_id: Some("c1".into()),
                    status: SessionStatus::Idle,
                    created_at: Utc::now(),
                    last_message_at: None,
                    last_message_preview: None,
                    total_cost_usd: 0.0,
                    context_usage: ContextUsage::default(),
                    last_turn_usage: ContextUsage::default(),
                    pending_approval: None,
                    pending_question: None,
                    manager_state: None,
                },
                messages: vec![],
                session_token: session_token.into(),
                container_id: Some("c1".into()),
                manager_api_token: None,
                manager_state: None,
            }],
            internal_secret: internal_secret.into(),
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        let state = sample_state();

        store.save(&state).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded.sessions.len(), 1);
        assert_eq!(loaded.sessions[0].info.id, "s1");
        assert_eq!(loaded.internal_secret, "cafebabe");
    }

    proptest! {
        /// Invariant: save(load(save(s))) == save(s) (spec §8 round-trip
        /// property) for arbitrary id/token/secret strings.
        #[test]
        fn save_load_roundtrips_for_arbitrary_strings(
            id in "[a-zA-Z0-9_-]{1,16}",
            session_token in "[a-f0-9]{8,32}",
            internal_secret in "[a-f0-9]{8,32}",
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let store = SessionStore::new(dir.path().join("sessions.json"));
                let state = sample_state_with(&id, &session_token, &internal_secret);

                store.save(&state).await.unwrap();
                let loaded = store.load().await.unwrap();

                prop_assert_eq!(loaded.sessions.len(), 1);
                prop_assert_eq!(loaded.sessions[0].info.id.clone(), id);
                prop_assert_eq!(loaded.sessions[0].session_token.clone(), session_token);
                prop_assert_eq!(loaded.internal_secret.clone(), internal_secret);

                // A second save/load of the loaded state reproduces the same bytes.
                store.save(&loaded).await.unwrap();
                let reloaded = store.load().await.unwrap();
                prop_assert_eq!(
                    serde_json::to_vec(&loaded).unwrap(),
                    serde_json::to_vec(&reloaded).unwrap()
                );
                Ok(())
            })?;
        }
    }

    #[tokio::test]
    async fn load_on_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("missing.json"));
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn load_on_corrupt_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, b"not json at all").await.unwrap();
        let store = SessionStore::new(path);
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn load_on_shape_mismatch_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, br#"{"foo": "bar"}"#).await.unwrap();
        let store = SessionStore::new(path);
        assert!(store.load().await.is_none());
    }

    #[tokio::test]
    async fn save_no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        store.save(&sample_state()).await.unwrap();
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions.json"));
        store.delete().await.unwrap();
        store.save(&sample_state()).await.unwrap();
        store.delete().await.unwrap();
        assert!(store.load().await.is_none());
        store.delete().await.unwrap();
    }
}
