//! Persistent record of supervised sessions.
//!
//! In-memory map behind a mutex, written through to a single JSON document
//! (temp-file + rename). Disk failures are logged and surfaced to the
//! caller but never roll back in-memory state.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Idle,
    Stopping,
    Stopped,
    Orphaned,
}

impl SessionStatus {
    /// Stopped and Orphaned records are done running; they linger only for
    /// the retention window.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Orphaned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadBinding {
    pub thread_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub cwd: PathBuf,
    pub project_dir: PathBuf,
    /// 0 = unknown / externally started.
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub command: Vec<String>,
    pub name: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ThreadBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_window: Option<String>,
}

impl Session {
    pub fn new(id: String, cwd: PathBuf, project_dir: PathBuf, command: Vec<String>) -> Self {
        let name = if command.is_empty() {
            id.clone()
        } else {
            command.join(" ")
        };
        let now = Utc::now();
        Self {
            id,
            cwd,
            project_dir,
            pid: 0,
            command,
            name,
            status: SessionStatus::Starting,
            started_at: now,
            last_verified_at: now,
            thread: None,
            terminal_window: None,
        }
    }

    /// Path of this session's append-only event log.
    pub fn event_log_path(&self) -> PathBuf {
        self.project_dir.join(format!("{}.jsonl", self.id))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    entries: Vec<Session>,
}

type StatusCallback = Box<dyn Fn(&Session, SessionStatus) + Send + Sync>;

struct Inner {
    sessions: HashMap<String, Session>,
    reconciling: HashSet<String>,
}

pub struct Registry {
    path: PathBuf,
    inner: Mutex<Inner>,
    on_status_change: Mutex<Option<StatusCallback>>,
}

impl Registry {
    /// Open the registry, loading any persisted document at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        let sessions = match std::fs::read_to_string(&path) {
            Ok(body) => {
                let file: RegistryFile = serde_json::from_str(&body)
                    .with_context(|| format!("failed parsing registry file {}", path.display()))?;
                file.entries
                    .into_iter()
                    .map(|session| (session.id.clone(), session))
                    .collect()
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed reading registry file {}", path.display()));
            }
        };

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                sessions,
                reconciling: HashSet::new(),
            }),
            on_status_change: Mutex::new(None),
        })
    }

    /// Install the status-change callback. Invoked from `set_status` for
    /// every effective transition, with the updated session and the old
    /// status.
    pub fn set_on_status_change(&self, callback: StatusCallback) {
        *self.on_status_change.lock() = Some(callback);
    }

    pub fn upsert(&self, session: Session) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.sessions.insert(session.id.clone(), session);
            snapshot_entries(&inner)
        };
        self.persist(snapshot)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().sessions.contains_key(id)
    }

    /// Write-through status transition. Stopped is absorbing: attempts to
    /// leave it are ignored with a warning. Returns the previous status.
    pub fn set_status(&self, id: &str, new: SessionStatus) -> Result<SessionStatus> {
        let (old, changed_session, snapshot) = {
            let mut inner = self.inner.lock();
            let session = match inner.sessions.get_mut(id) {
                Some(session) => session,
                None => bail!("unknown session '{id}'"),
            };
            let old = session.status;
            if old == SessionStatus::Stopped && new != SessionStatus::Stopped {
                tracing::warn!(
                    target = "session_relay::registry",
                    session = %id,
                    requested = ?new,
                    "ignoring status transition out of stopped"
                );
                return Ok(old);
            }
            if old == new {
                return Ok(old);
            }
            session.status = new;
            session.last_verified_at = Utc::now();
            let changed = session.clone();
            (old, changed, snapshot_entries(&inner))
        };

        if let Some(callback) = self.on_status_change.lock().as_ref() {
            callback(&changed_session, old);
        }

        self.persist(snapshot)?;
        Ok(old)
    }

    pub fn set_thread(&self, id: &str, thread: ThreadBinding) -> Result<()> {
        self.update(id, |session| session.thread = Some(thread))
    }

    pub fn set_name(&self, id: &str, name: String) -> Result<()> {
        self.update(id, |session| session.name = name)
    }

    pub fn set_pid(&self, id: &str, pid: u32) -> Result<()> {
        self.update(id, |session| session.pid = pid)
    }

    pub fn touch_verified(&self, id: &str) -> Result<()> {
        self.update(id, |session| session.last_verified_at = Utc::now())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock();
            if inner.sessions.remove(id).is_none() {
                bail!("unknown session '{id}'");
            }
            snapshot_entries(&inner)
        };
        self.persist(snapshot)
    }

    pub fn all(&self) -> Vec<Session> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    pub fn list_active(&self) -> Vec<Session> {
        self.list(|session| !session.status.is_terminal())
    }

    pub fn list_terminal(&self) -> Vec<Session> {
        self.list(|session| session.status.is_terminal())
    }

    pub fn list(&self, filter: impl Fn(&Session) -> bool) -> Vec<Session> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|session| filter(session))
            .cloned()
            .collect()
    }

    pub fn count_active(&self) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|session| !session.status.is_terminal())
            .count()
    }

    // Reconciling fence: session ids whose shutdown is in progress. Late
    // connections for fenced ids are ignored rather than resurrected.

    pub fn mark_reconciling(&self, id: &str) {
        self.inner.lock().reconciling.insert(id.to_string());
    }

    pub fn unmark_reconciling(&self, id: &str) {
        self.inner.lock().reconciling.remove(id);
    }

    pub fn is_reconciling(&self, id: &str) -> bool {
        self.inner.lock().reconciling.contains(id)
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut Session)) -> Result<()> {
        let snapshot = {
            let mut inner = self.inner.lock();
            let session = match inner.sessions.get_mut(id) {
                Some(session) => session,
                None => bail!("unknown session '{id}'"),
            };
            apply(session);
            snapshot_entries(&inner)
        };
        self.persist(snapshot)
    }

    fn persist(&self, entries: Vec<Session>) -> Result<()> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            entries,
        };
        let body = serde_json::to_vec_pretty(&file)?;
        let dir = self
            .path
            .parent()
            .with_context(|| format!("registry path has no parent: {}", self.path.display()))?;
        let result = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed creating temp file in {}", dir.display()))
            .and_then(|mut tmp| {
                std::io::Write::write_all(&mut tmp, &body)
                    .context("failed writing to temp registry file")?;
                tmp.persist(&self.path).with_context(|| {
                    format!("failed persisting registry file to {}", self.path.display())
                })?;
                Ok(())
            });
        if let Err(error) = &result {
            tracing::error!(
                target = "session_relay::registry",
                path = %self.path.display(),
                error = %error,
                "registry write failed; in-memory state retained"
            );
        }
        result
    }
}

fn snapshot_entries(inner: &Inner) -> Vec<Session> {
    let mut entries: Vec<Session> = inner.sessions.values().cloned().collect();
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    entries
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{Registry, Session, SessionStatus, ThreadBinding};

    fn test_session(id: &str) -> Session {
        Session::new(
            id.to_string(),
            PathBuf::from("/work"),
            PathBuf::from("/proj"),
            vec!["claude".to_string()],
        )
    }

    fn open_registry(dir: &std::path::Path) -> Registry {
        Registry::open(dir.join("registry.json")).unwrap()
    }

    #[test]
    fn upsert_persists_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = open_registry(tmp.path());
        registry.upsert(test_session("A")).unwrap();
        registry
            .set_thread(
                "A",
                ThreadBinding {
                    thread_id: "T1".into(),
                    channel_id: "C1".into(),
                },
            )
            .unwrap();

        let reopened = open_registry(tmp.path());
        let session = reopened.get("A").unwrap();
        assert_eq!(session.status, SessionStatus::Starting);
        assert_eq!(session.thread.as_ref().unwrap().thread_id, "T1");
        assert_eq!(session.name, "claude");
    }

    #[test]
    fn status_callback_fires_on_change_only() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = open_registry(tmp.path());
        registry.upsert(test_session("A")).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.set_on_status_change(Box::new(move |session, old| {
            assert_eq!(session.id, "A");
            assert_eq!(old, SessionStatus::Starting);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.set_status("A", SessionStatus::Running).unwrap();
        // Same status again is a no-op.
        let registry2 = registry;
        registry2.set_status("A", SessionStatus::Running).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stopped_is_absorbing() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = open_registry(tmp.path());
        registry.upsert(test_session("A")).unwrap();
        registry.set_status("A", SessionStatus::Running).unwrap();
        registry.set_status("A", SessionStatus::Stopped).unwrap();

        registry.set_status("A", SessionStatus::Running).unwrap();
        assert_eq!(registry.get("A").unwrap().status, SessionStatus::Stopped);
    }

    #[test]
    fn unknown_session_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = open_registry(tmp.path());
        assert!(registry.set_status("nope", SessionStatus::Running).is_err());
        assert!(registry.set_name("nope", "x".into()).is_err());
        assert!(registry.remove("nope").is_err());
    }

    #[test]
    fn list_splits_by_status_class() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = open_registry(tmp.path());
        registry.upsert(test_session("A")).unwrap();
        registry.upsert(test_session("B")).unwrap();
        registry.set_status("B", SessionStatus::Stopped).unwrap();

        assert_eq!(registry.list_active().len(), 1);
        assert_eq!(registry.list_terminal().len(), 1);
        assert_eq!(registry.count_active(), 1);
    }

    #[test]
    fn reconciling_fence() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = open_registry(tmp.path());
        assert!(!registry.is_reconciling("A"));
        registry.mark_reconciling("A");
        assert!(registry.is_reconciling("A"));
        registry.unmark_reconciling("A");
        assert!(!registry.is_reconciling("A"));
    }

    #[test]
    fn event_log_path_joins_project_dir_and_id() {
        let session = test_session("abc-123");
        assert_eq!(
            session.event_log_path(),
            PathBuf::from("/proj/abc-123.jsonl")
        );
    }
}
