//! Durable session-to-chat-thread mapping.
//!
//! Survives daemon restarts so a reconnecting session can be reattached to
//! its prior chat context. Stored as a JSON array beside the registry file;
//! a missing or unreadable file simply yields an empty store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::registry::ThreadBinding;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMapping {
    pub session_id: String,
    pub thread_id: String,
    pub channel_id: String,
    pub cwd: PathBuf,
}

pub struct ThreadMappings {
    path: PathBuf,
    entries: Mutex<Vec<ThreadMapping>>,
}

impl ThreadMappings {
    pub fn open(path: PathBuf) -> Self {
        let entries = load_entries(&path);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn lookup(&self, session_id: &str) -> Option<ThreadMapping> {
        self.entries
            .lock()
            .iter()
            .find(|entry| entry.session_id == session_id)
            .cloned()
    }

    /// Add or replace the mapping for a session.
    pub fn bind(&self, mapping: ThreadMapping) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock();
            entries.retain(|entry| entry.session_id != mapping.session_id);
            entries.push(mapping);
            entries.clone()
        };
        self.persist(&snapshot)
    }

    pub fn remove(&self, session_id: &str) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock();
            entries.retain(|entry| entry.session_id != session_id);
            entries.clone()
        };
        self.persist(&snapshot)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn persist(&self, entries: &[ThreadMapping]) -> Result<()> {
        let body = serde_json::to_vec_pretty(entries)?;
        let dir = self
            .path
            .parent()
            .with_context(|| format!("mapping path has no parent: {}", self.path.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed creating temp file in {}", dir.display()))?;
        std::io::Write::write_all(&mut tmp, &body)
            .context("failed writing to temp mapping file")?;
        tmp.persist(&self.path).with_context(|| {
            format!("failed persisting thread mappings to {}", self.path.display())
        })?;
        Ok(())
    }
}

impl ThreadMapping {
    pub fn binding(&self) -> ThreadBinding {
        ThreadBinding {
            thread_id: self.thread_id.clone(),
            channel_id: self.channel_id.clone(),
        }
    }
}

fn load_entries(path: &Path) -> Vec<ThreadMapping> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&body) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::warn!(
                target = "session_relay::threads",
                path = %path.display(),
                error = %error,
                "discarding unreadable thread mapping file"
            );
            Vec::new()
        }
    }
}
