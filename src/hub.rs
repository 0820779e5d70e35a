//! RPC server on a process-local Unix socket.
//!
//! Runners (and out-of-band permission hooks) connect and exchange
//! newline-delimited JSON frames. A connection binds to at most one
//! session id via its `session_start`; the bound connection is the
//! back-channel for input delivery and permission responses.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::protocol::{DaemonFrame, RunnerFrame};
use crate::router::{Router, SessionStartInfo};

/// Delay before the carriage-return frame that commits an input line.
const INPUT_COMMIT_DELAY: Duration = Duration::from_millis(100);

struct BoundConnection {
    conn_id: u64,
    tx: UnboundedSender<DaemonFrame>,
}

pub struct RpcHub {
    socket_path: PathBuf,
    sessions: Mutex<HashMap<String, BoundConnection>>,
    next_conn_id: AtomicU64,
}

impl RpcHub {
    pub fn new(socket_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            socket_path,
            sessions: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Whether a runner connection is currently bound for this session.
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn send_frame(&self, session_id: &str, frame: DaemonFrame) -> Result<()> {
        let tx = {
            let sessions = self.sessions.lock();
            match sessions.get(session_id) {
                Some(bound) => bound.tx.clone(),
                None => bail!("no live connection for session '{session_id}'"),
            }
        };
        if tx.send(frame).is_err() {
            bail!("connection for session '{session_id}' is gone");
        }
        Ok(())
    }

    /// Deliver user text to the runner: the text frame now, then a lone
    /// carriage return shortly after to commit the line in interactive
    /// prompts.
    pub fn send_input(&self, session_id: &str, text: &str) -> Result<()> {
        let tx = {
            let sessions = self.sessions.lock();
            match sessions.get(session_id) {
                Some(bound) => bound.tx.clone(),
                None => bail!("no live connection for session '{session_id}'"),
            }
        };
        if tx
            .send(DaemonFrame::Input {
                text: text.to_string(),
            })
            .is_err()
        {
            bail!("connection for session '{session_id}' is gone");
        }
        tokio::spawn(async move {
            tokio::time::sleep(INPUT_COMMIT_DELAY).await;
            let _ = tx.send(DaemonFrame::Input { text: "\r".into() });
        });
        Ok(())
    }

    fn bind(&self, session_id: &str, conn_id: u64, tx: UnboundedSender<DaemonFrame>) {
        let mut sessions = self.sessions.lock();
        if let Some(previous) = sessions.insert(
            session_id.to_string(),
            BoundConnection { conn_id, tx },
        ) {
            // Second session_start for a live id: the newer connection
            // wins and the stale one is left to drain out.
            tracing::warn!(
                target = "session_relay::hub",
                session = %session_id,
                previous_conn = previous.conn_id,
                "replaced existing runner connection"
            );
        }
    }

    /// Drop a binding regardless of which connection owns it. Used by the
    /// router when an outbound write fails.
    pub fn unbind(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    /// Remove the binding only if it still belongs to `conn_id`. A stale
    /// connection that was replaced must not tear down its successor.
    fn unbind_if_current(&self, session_id: &str, conn_id: u64) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(session_id) {
            Some(bound) if bound.conn_id == conn_id => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Accept loop. Removes any stale socket first; the path is owned
    /// exclusively by this daemon.
    pub async fn run(self: Arc<Self>, router: Arc<Router>) -> Result<()> {
        if self.socket_path.exists() {
            tracing::warn!(
                target = "session_relay::hub",
                path = %self.socket_path.display(),
                "removing stale socket"
            );
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("failed removing {}", self.socket_path.display()))?;
        }
        if let Some(dir) = self.socket_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed creating {}", dir.display()))?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed binding {}", self.socket_path.display()))?;
        tracing::info!(
            target = "session_relay::hub",
            path = %self.socket_path.display(),
            "rpc hub listening"
        );

        loop {
            let (stream, _addr) = listener.accept().await.context("accept failed")?;
            let hub = self.clone();
            let router = router.clone();
            tokio::spawn(async move {
                hub.handle_connection(router, stream).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, router: Arc<Router>, stream: UnixStream) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel::<DaemonFrame>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let mut line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(error) => {
                        tracing::error!(
                            target = "session_relay::hub",
                            error = %error,
                            "failed encoding outbound frame"
                        );
                        continue;
                    }
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
        });

        let mut bound: Option<String> = None;
        let mut lines = BufReader::new(read_half).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(
                        target = "session_relay::hub",
                        conn = conn_id,
                        error = %error,
                        "connection read failed"
                    );
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let frame: RunnerFrame = match serde_json::from_str(&line) {
                Ok(frame) => frame,
                Err(error) => {
                    tracing::warn!(
                        target = "session_relay::hub",
                        conn = conn_id,
                        error = %error,
                        "skipping malformed frame"
                    );
                    continue;
                }
            };

            match frame {
                RunnerFrame::SessionStart {
                    id,
                    project_dir,
                    cwd,
                    command,
                    name,
                    jsonl_file,
                    pid,
                } => {
                    if let Some(existing) = bound.as_deref() {
                        if existing != id {
                            tracing::warn!(
                                target = "session_relay::hub",
                                conn = conn_id,
                                bound = %existing,
                                declared = %id,
                                "connection already bound to another session; frame dropped"
                            );
                        }
                        continue;
                    }
                    let info = SessionStartInfo {
                        id: id.clone(),
                        project_dir: project_dir.into(),
                        cwd: cwd.into(),
                        command,
                        name,
                        jsonl_file,
                        pid,
                    };
                    if router.on_session_start(info) {
                        self.bind(&id, conn_id, tx.clone());
                        bound = Some(id);
                    } else {
                        // Fenced or otherwise refused; drop the connection.
                        break;
                    }
                }
                RunnerFrame::SessionEnd { session_id } => {
                    if bound.as_deref() == Some(session_id.as_str()) {
                        if self.unbind_if_current(&session_id, conn_id) {
                            router.on_session_end(&session_id);
                        }
                        bound = None;
                        break;
                    }
                    tracing::warn!(
                        target = "session_relay::hub",
                        conn = conn_id,
                        session = %session_id,
                        "session_end for a session this connection does not own"
                    );
                }
                RunnerFrame::TitleUpdate { session_id, title } => {
                    router.on_title_update(&session_id, &title);
                }
                RunnerFrame::PtyOutput {
                    session_id,
                    content,
                    is_thinking,
                    timestamp: _,
                } => {
                    router.on_pty_output(&session_id, &content, is_thinking);
                }
                RunnerFrame::PermissionRequest {
                    request_id,
                    session_id,
                    tool_name,
                    tool_input,
                } => {
                    router.on_permission_request(
                        &request_id,
                        &session_id,
                        &tool_name,
                        tool_input,
                        tx.clone(),
                    );
                }
                RunnerFrame::PermissionResponse { request_id, .. } => {
                    // The daemon arbitrates; inbound decisions are not used.
                    tracing::debug!(
                        target = "session_relay::hub",
                        request = %request_id,
                        "ignoring inbound permission_response"
                    );
                }
            }
        }

        if let Some(session_id) = bound {
            if self.unbind_if_current(&session_id, conn_id) {
                router.on_session_end(&session_id);
            }
        }
    }
}

impl Drop for RpcHub {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
