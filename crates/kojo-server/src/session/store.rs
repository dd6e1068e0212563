//! Atomic persistence of session metadata.
//!
//! Sessions are written as a JSON array to a single file under the
//! per-user config directory. Writes go through a temp file and rename so
//! a crash never leaves a half-written sessions file behind.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use kojo_core::{KojoError, KojoResult, SessionInfo};

const APP_DIR: &str = "kojo";
const SESSIONS_FILE: &str = "sessions.json";

/// Persists session metadata to disk.
pub struct Store {
    path: PathBuf,
    retention: Duration,
    lock: Mutex<()>,
}

impl Store {
    /// A store at the default per-user location, or at `path` when given
    /// (used by tests and the config override).
    pub fn new(path: Option<PathBuf>, retention_days: u32) -> Self {
        let path = path.unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join(SESSIONS_FILE)
        });
        Self {
            path,
            retention: Duration::days(i64::from(retention_days)),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write session info to disk using an atomic rename. Persistence is
    /// best-effort: failures are logged, never surfaced.
    pub async fn save(&self, infos: &[SessionInfo]) {
        let _guard = self.lock.lock().await;

        let data = match serde_json::to_vec_pretty(infos) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to marshal sessions");
                return;
            }
        };

        if let Some(dir) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                warn!(error = %e, "failed to create config dir");
                return;
            }
            let _ = tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755)).await;
        }

        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            warn!(error = %e, "failed to write tmp sessions file");
            return;
        }
        let _ = tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).await;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(error = %e, "failed to rename sessions file");
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }

    /// Read persisted sessions, filtering out entries older than the
    /// retention cutoff.
    ///
    /// Returns `Ok(empty)` when the file does not exist (first run) and
    /// `Err` on read/parse errors, so callers can distinguish "no
    /// sessions" from "failed to load"; orphan cleanup must only run
    /// after a successful load.
    pub async fn load(&self) -> KojoResult<Vec<SessionInfo>> {
        let _guard = self.lock.lock().await;

        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                warn!(error = %e, "failed to read sessions file");
                return Err(KojoError::Io(e));
            }
        };

        let infos: Vec<SessionInfo> = serde_json::from_slice(&data).map_err(|e| {
            warn!(error = %e, "failed to parse sessions file");
            KojoError::Store(format!("parse sessions file: {e}"))
        })?;

        let cutoff = Utc::now() - self.retention;
        Ok(infos
            .into_iter()
            .filter(|info| match DateTime::parse_from_rfc3339(&info.created_at) {
                Ok(t) => t.with_timezone(&Utc) > cutoff,
                Err(_) => false,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SecondsFormat;
    use kojo_core::SessionStatus;

    fn info(id: &str, created_at: String) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            tool: "claude".into(),
            work_dir: "/tmp".into(),
            args: vec![],
            status: SessionStatus::Exited,
            exit_code: Some(0),
            yolo_mode: false,
            internal: false,
            created_at,
            tool_session_id: None,
            parent_id: None,
            mux_name: None,
            last_output: None,
            last_cols: None,
            last_rows: None,
        }
    }

    fn store_at(dir: &Path) -> Store {
        Store::new(Some(dir.join("sessions.json")), 7)
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        store.save(&[info("s_1", now.clone()), info("s_2", now)]).await;

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "s_1");
    }

    #[tokio::test]
    async fn absent_file_is_an_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let loaded = store.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn malformed_file_is_an_error_not_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        std::fs::write(store.path(), "{").unwrap();

        // A parse failure must be distinguishable from "no sessions":
        // treating it as empty would let orphan cleanup kill live sessions.
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn load_filters_entries_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        let fresh = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let stale = (Utc::now() - Duration::days(8)).to_rfc3339_opts(SecondsFormat::Secs, true);
        store
            .save(&[info("s_fresh", fresh), info("s_stale", stale)])
            .await;

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "s_fresh");
    }

    #[tokio::test]
    async fn unparseable_timestamps_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        store.save(&[info("s_bad", "not-a-date".into())]).await;

        let loaded = store.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn save_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        store.save(&[info("s_1", now.clone())]).await;
        store.save(&[info("s_2", now)]).await;

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "s_2");
        // no temp file left behind
        assert!(!dir.path().join("sessions.json.tmp").exists());
    }
}
