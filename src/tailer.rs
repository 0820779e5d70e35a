//! Per-session tail over the agent's append-only event log.
//!
//! Each session gets one task combining a filesystem watcher (with a
//! write-quiesce stabilizer) and a backstop poll. Both paths funnel into
//! the same `process` routine on the task, so overlapping wake-ups can
//! never read the same bytes twice. Byte offset and line-hash set survive
//! within the task; replayed bytes are suppressed by hash.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dedup::SeenSet;
use crate::records::{ContentItem, LogRecord, TodoItem};
use crate::router::Router;

/// Cap on remembered line hashes per session.
pub const SEEN_CAP: usize = 10_000;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const QUIESCE: Duration = Duration::from_millis(150);

/// Normalized observation derived from one event-log record.
#[derive(Debug, Clone, PartialEq)]
pub enum TailEvent {
    NameUpdate(String),
    Todos(Vec<TodoItem>),
    PlanMode(bool),
    ToolCall {
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Message {
        role: String,
        text: String,
    },
}

pub fn line_hash(line: &str) -> String {
    let digest = Sha256::digest(line.as_bytes());
    // First 8 bytes are plenty for a bounded replay window.
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Offset, dedup, and derivation state for one tailed log.
pub struct TailState {
    path: PathBuf,
    offset: u64,
    seen: SeenSet,
    session_start: DateTime<Utc>,
    plan_mode: bool,
    todos_hash: Option<String>,
    named: bool,
}

impl TailState {
    pub fn new(path: PathBuf, session_start: DateTime<Utc>) -> Self {
        Self {
            path,
            offset: 0,
            seen: SeenSet::new(SEEN_CAP),
            session_start,
            plan_mode: false,
            todos_hash: None,
            named: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read and consume any new complete lines. A missing file is normal
    /// (the agent has not written yet) and yields nothing. The trailing
    /// fragment of an unterminated line is left unconsumed for the next
    /// cycle.
    pub async fn process(&mut self) -> Result<Vec<TailEvent>> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to stat {}", self.path.display()));
            }
        };

        let len = metadata.len();
        if len <= self.offset {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.seek(std::io::SeekFrom::Start(self.offset))
            .await
            .context("failed to seek event log")?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset)
            .read_to_end(&mut buf)
            .await
            .context("failed to read event log")?;

        // Only bytes up to the last newline are consumed.
        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => return Ok(Vec::new()),
        };
        self.offset += consumed as u64;

        let mut events = Vec::new();
        for line in String::from_utf8_lossy(&buf[..consumed]).lines() {
            self.consume_line(line, &mut events);
        }
        Ok(events)
    }

    fn consume_line(&mut self, line: &str, out: &mut Vec<TailEvent>) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if !self.seen.insert(&line_hash(trimmed)) {
            return;
        }

        let record: LogRecord = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(error) => {
                // The line is consumed either way; the offset has moved on.
                tracing::debug!(
                    target = "session_relay::tailer",
                    path = %self.path.display(),
                    error = %error,
                    "skipping malformed event-log line"
                );
                return;
            }
        };
        self.derive(&record, out);
    }

    fn derive(&mut self, record: &LogRecord, out: &mut Vec<TailEvent>) {
        if !self.named {
            if let Some(slug) = record.slug.as_deref() {
                if !slug.is_empty() {
                    self.named = true;
                    out.push(TailEvent::NameUpdate(slug.to_string()));
                }
            }
        }

        if let Some(todos) = record.todos.as_ref() {
            let hash = line_hash(&serde_json::to_string(todos).unwrap_or_default());
            if self.todos_hash.as_deref() != Some(hash.as_str()) {
                self.todos_hash = Some(hash);
                out.push(TailEvent::Todos(todos.clone()));
            }
        }

        if let Some(active) = record.plan_mode_toggle() {
            if active != self.plan_mode {
                self.plan_mode = active;
                out.push(TailEvent::PlanMode(active));
            }
        }

        for item in record.content_items() {
            match item {
                ContentItem::ToolUse { id, name, input }
                    if record.record_type.as_deref() == Some("assistant") =>
                {
                    out.push(TailEvent::ToolCall {
                        tool_use_id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
                ContentItem::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } if record.record_type.as_deref() == Some("user") => {
                    out.push(TailEvent::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: content
                            .as_ref()
                            .map(|c| c.joined_text())
                            .unwrap_or_default(),
                        is_error: *is_error,
                    });
                }
                _ => {}
            }
        }

        if record.is_conversational() {
            if let Some(ts) = record.parsed_timestamp() {
                if ts < self.session_start {
                    return;
                }
            }
            if let (Some(role), Some(text)) = (record.role(), record.text()) {
                out.push(TailEvent::Message {
                    role: role.to_string(),
                    text,
                });
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn rewind(&mut self) {
        self.offset = 0;
    }
}

/// Spawn the tail task for one session. The task exits when aborted by the
/// router at session end.
pub fn spawn(
    session_id: String,
    path: PathBuf,
    session_start: DateTime<Utc>,
    router: Arc<Router>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = TailState::new(path.clone(), session_start);
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<()>();

        // Watch the parent directory: the log file itself may not exist
        // yet. If the directory is missing too, the poll carries us until
        // it appears.
        let watch_target = path.parent().map(|p| p.to_path_buf());
        let watched_file = path.clone();
        let mut watcher: Option<RecommendedWatcher> = None;
        if let Some(dir) = watch_target.as_deref() {
            match RecommendedWatcher::new(
                move |result: Result<notify::Event, notify::Error>| {
                    if let Ok(event) = result {
                        if event.paths.iter().any(|p| p == &watched_file) {
                            let _ = notify_tx.send(());
                        }
                    }
                },
                notify::Config::default(),
            ) {
                Ok(mut w) => match w.watch(dir, RecursiveMode::NonRecursive) {
                    Ok(()) => watcher = Some(w),
                    Err(error) => {
                        tracing::debug!(
                            target = "session_relay::tailer",
                            session = %session_id,
                            error = %error,
                            "fs watch unavailable; polling only"
                        );
                    }
                },
                Err(error) => {
                    tracing::debug!(
                        target = "session_relay::tailer",
                        session = %session_id,
                        error = %error,
                        "fs watcher init failed; polling only"
                    );
                }
            }
        }
        let _watcher = watcher;

        let mut tick = tokio::time::interval(POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = notify_rx.recv() => {
                    if received.is_none() {
                        // Watcher gone; the poll is the backstop.
                        tick.tick().await;
                    } else {
                        // Stabilizer: wait for writes to quiesce, folding
                        // follow-up notifications into this cycle.
                        loop {
                            match tokio::time::timeout(QUIESCE, notify_rx.recv()).await {
                                Ok(Some(())) => continue,
                                _ => break,
                            }
                        }
                    }
                }
                _ = tick.tick() => {}
            }

            match state.process().await {
                Ok(events) => {
                    for event in events {
                        router.handle_tail_event(&session_id, event);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target = "session_relay::tailer",
                        session = %session_id,
                        error = %error,
                        "tail cycle failed; will retry"
                    );
                }
            }
        }
    })
}
