//! Event fusion and arbitration.
//!
//! The router fuses tailer output and RPC frames into one ordered event
//! stream per session, suppresses cross-source duplicates, arbitrates
//! permission requests, and owns the per-session pending state. Its maps
//! sit behind their own mutex, distinct from the registry's.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::dedup::SeenSet;
use crate::events::{SessionEvent, SessionSummary};
use crate::hub::RpcHub;
use crate::protocol::{DaemonFrame, PermissionDecision};
use crate::questions::{QuestionAggregator, ASK_USER_TOOL};
use crate::registry::{Registry, Session, SessionStatus, ThreadBinding};
use crate::tailer::{self, line_hash, TailEvent, SEEN_CAP};
use crate::threads::{ThreadMapping, ThreadMappings};

/// Fields a runner declares in its `session_start` frame.
#[derive(Debug, Clone)]
pub struct SessionStartInfo {
    pub id: String,
    pub project_dir: PathBuf,
    pub cwd: PathBuf,
    pub command: Vec<String>,
    pub name: Option<String>,
    pub jsonl_file: String,
    pub pid: u32,
}

struct LiveSession {
    tailer: JoinHandle<()>,
    /// Cross-source message dedup, keyed `pty:<session>:<hash>`.
    seen: SeenSet,
}

struct PendingPermission {
    session_id: String,
    tool_input: Value,
    /// Back-channel to the originating connection.
    reply: UnboundedSender<DaemonFrame>,
    question: Option<QuestionAggregator>,
}

#[derive(Default)]
struct RouterState {
    live: HashMap<String, LiveSession>,
    pending: HashMap<String, PendingPermission>,
    yolo: HashSet<String>,
}

pub struct Router {
    registry: Arc<Registry>,
    threads: Arc<ThreadMappings>,
    hub: Arc<RpcHub>,
    events: UnboundedSender<SessionEvent>,
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        threads: Arc<ThreadMappings>,
        hub: Arc<RpcHub>,
        events: UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            threads,
            hub,
            events,
            state: Mutex::new(RouterState::default()),
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// A runner declared its session. Returns whether the connection may
    /// bind; ids under the reconciling fence are refused.
    pub fn on_session_start(self: &Arc<Self>, info: SessionStartInfo) -> bool {
        if self.registry.is_reconciling(&info.id) {
            tracing::warn!(
                target = "session_relay::router",
                session = %info.id,
                "ignoring session_start for reconciling session"
            );
            return false;
        }

        if self.state.lock().live.contains_key(&info.id) {
            // Duplicate session_start: the hub rebinds to the newer
            // connection; tail state and dedup window carry over.
            tracing::warn!(
                target = "session_relay::router",
                session = %info.id,
                "session already live; rebinding connection"
            );
            return true;
        }

        let session = match self.registry.get(&info.id) {
            Some(existing) => {
                if info.pid != 0 && info.pid != existing.pid {
                    let _ = self.registry.set_pid(&info.id, info.pid);
                }
                existing
            }
            None => {
                // Externally started: first contact creates the record.
                let mut session = Session::new(
                    info.id.clone(),
                    info.cwd.clone(),
                    info.project_dir.clone(),
                    info.command.clone(),
                );
                session.pid = info.pid;
                if let Some(name) = info.name.clone() {
                    if !name.is_empty() {
                        session.name = name;
                    }
                }
                if let Err(error) = self.registry.upsert(session.clone()) {
                    tracing::warn!(
                        target = "session_relay::router",
                        session = %info.id,
                        error = %error,
                        "failed persisting new session"
                    );
                }
                session
            }
        };

        self.emit(SessionEvent::SessionStart {
            session_id: session.id.clone(),
            cwd: session.cwd.to_string_lossy().into_owned(),
            name: session.name.clone(),
        });

        if session.thread.is_none() {
            if let Some(mapping) = self.threads.lookup(&session.id) {
                let binding = mapping.binding();
                let _ = self.registry.set_thread(&session.id, binding.clone());
                self.emit(SessionEvent::ThreadRestore {
                    session_id: session.id.clone(),
                    thread_id: binding.thread_id,
                    channel_id: binding.channel_id,
                });
            }
        }

        let _ = self.registry.set_status(&session.id, SessionStatus::Running);

        let file_name = if info.jsonl_file.is_empty() {
            format!("{}.jsonl", session.id)
        } else {
            info.jsonl_file.clone()
        };
        let log_path = info.project_dir.join(file_name);
        let tail_task = tailer::spawn(
            session.id.clone(),
            log_path,
            session.started_at,
            self.clone(),
        );

        self.state.lock().live.insert(
            session.id.clone(),
            LiveSession {
                tailer: tail_task,
                seen: SeenSet::new(SEEN_CAP),
            },
        );
        true
    }

    /// Session is over: the runner said so or its connection closed.
    /// Exactly one session-end is surfaced per session life; pending
    /// permissions are cancelled without a response.
    pub fn on_session_end(&self, session_id: &str) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.live.remove(session_id);
            if removed.is_some() {
                let before = state.pending.len();
                state.pending.retain(|_, p| p.session_id != session_id);
                let cancelled = before - state.pending.len();
                if cancelled > 0 {
                    tracing::info!(
                        target = "session_relay::router",
                        session = %session_id,
                        cancelled,
                        "cancelled pending permissions at session end"
                    );
                }
                state.yolo.remove(session_id);
            }
            removed
        };

        let Some(live) = removed else {
            return;
        };
        live.tailer.abort();

        if self.registry.contains(session_id) {
            let _ = self.registry.set_status(session_id, SessionStatus::Stopped);
        }
        self.emit(SessionEvent::SessionEnd {
            session_id: session_id.to_string(),
        });
    }

    pub fn on_title_update(&self, session_id: &str, title: &str) {
        self.emit(SessionEvent::TitleChange {
            session_id: session_id.to_string(),
            title: title.to_string(),
        });
    }

    /// PTY fallback text. Thinking output is transient and never part of
    /// the message stream.
    pub fn on_pty_output(&self, session_id: &str, content: &str, is_thinking: bool) {
        if is_thinking {
            return;
        }
        self.deliver_message(session_id, "assistant", content);
    }

    pub fn handle_tail_event(&self, session_id: &str, event: TailEvent) {
        match event {
            TailEvent::NameUpdate(name) => {
                let _ = self.registry.set_name(session_id, name.clone());
                self.emit(SessionEvent::NameUpdate {
                    session_id: session_id.to_string(),
                    name,
                });
            }
            TailEvent::Todos(todos) => {
                self.emit(SessionEvent::Todos {
                    session_id: session_id.to_string(),
                    todos,
                });
            }
            TailEvent::PlanMode(active) => {
                self.emit(SessionEvent::PlanModeChange {
                    session_id: session_id.to_string(),
                    active,
                });
            }
            TailEvent::ToolCall {
                tool_use_id,
                name,
                input,
            } => {
                self.emit(SessionEvent::ToolCall {
                    session_id: session_id.to_string(),
                    tool_use_id,
                    name,
                    input,
                });
            }
            TailEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                self.emit(SessionEvent::ToolResult {
                    session_id: session_id.to_string(),
                    tool_use_id,
                    content,
                    is_error,
                });
            }
            TailEvent::Message { role, text } => {
                self.deliver_message(session_id, &role, &text);
            }
        }
    }

    /// Shared message path for both sources. First arrival wins: whichever
    /// of the event log or the PTY fallback presents a text first gets to
    /// emit it; the other is suppressed by the same key.
    fn deliver_message(&self, session_id: &str, role: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }

        // Message roles drive the thinking indicator.
        let promoted = match role {
            "user" => Some(SessionStatus::Running),
            "assistant" => Some(SessionStatus::Idle),
            _ => None,
        };
        if let Some(status) = promoted {
            if self.registry.contains(session_id) {
                let _ = self.registry.set_status(session_id, status);
            }
        }

        let key = message_key(session_id, text);
        {
            let mut state = self.state.lock();
            let Some(live) = state.live.get_mut(session_id) else {
                tracing::warn!(
                    target = "session_relay::router",
                    session = %session_id,
                    "dropping message for session without live context"
                );
                return;
            };
            if !live.seen.insert(&key) {
                tracing::debug!(
                    target = "session_relay::router",
                    session = %session_id,
                    key = %key,
                    "suppressing duplicate message"
                );
                return;
            }
        }

        self.emit(SessionEvent::Message {
            session_id: session_id.to_string(),
            role: role.to_string(),
            text: text.to_string(),
        });
    }

    /// Arbitrate one permission request from a runner or hook connection.
    pub fn on_permission_request(
        &self,
        request_id: &str,
        session_id: &str,
        tool_name: &str,
        tool_input: Value,
        reply: UnboundedSender<DaemonFrame>,
    ) {
        {
            let state = self.state.lock();
            if state.pending.contains_key(request_id) {
                tracing::warn!(
                    target = "session_relay::router",
                    request = %request_id,
                    "duplicate permission_request ignored"
                );
                return;
            }
            if state.yolo.contains(session_id) {
                drop(state);
                respond(&reply, request_id, PermissionDecision::allow());
                self.emit(SessionEvent::YoloNotified {
                    session_id: session_id.to_string(),
                    request_id: request_id.to_string(),
                    tool_name: tool_name.to_string(),
                });
                return;
            }
        }

        if !self.ensure_thread_context(session_id) {
            // Local-only mode: nothing to surface the prompt on.
            tracing::warn!(
                target = "session_relay::router",
                session = %session_id,
                request = %request_id,
                "no chat thread resolvable; allowing permission request"
            );
            respond(&reply, request_id, PermissionDecision::allow());
            return;
        }

        if tool_name == ASK_USER_TOOL {
            if let Some(aggregator) =
                QuestionAggregator::from_tool_input(request_id, session_id, &tool_input)
            {
                let questions = aggregator.questions().to_vec();
                self.state.lock().pending.insert(
                    request_id.to_string(),
                    PendingPermission {
                        session_id: session_id.to_string(),
                        tool_input,
                        reply,
                        question: Some(aggregator),
                    },
                );
                self.emit(SessionEvent::StructuredQuestion {
                    session_id: session_id.to_string(),
                    request_id: request_id.to_string(),
                    questions,
                });
                return;
            }
        }

        self.state.lock().pending.insert(
            request_id.to_string(),
            PendingPermission {
                session_id: session_id.to_string(),
                tool_input: tool_input.clone(),
                reply,
                question: None,
            },
        );
        self.emit(SessionEvent::PermissionRequest {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_input,
        });
    }

    /// Apply the user's decision. The first decision per request id wins;
    /// later attempts are ignored. Returns whether a response was sent.
    pub fn send_permission_decision(&self, request_id: &str, decision: PermissionDecision) -> bool {
        let entry = self.state.lock().pending.remove(request_id);
        let Some(entry) = entry else {
            tracing::warn!(
                target = "session_relay::router",
                request = %request_id,
                "decision for unknown or already-decided request ignored"
            );
            return false;
        };
        respond(&entry.reply, request_id, decision);
        true
    }

    pub fn record_ask_user_answer(&self, session_id: &str, index: usize, answer: &str) -> bool {
        self.with_question(session_id, |aggregator| {
            aggregator.record_answer(index, answer)
        })
    }

    pub fn record_ask_user_toggle(&self, session_id: &str, index: usize, option: &str) -> bool {
        self.with_question(session_id, |aggregator| {
            aggregator.record_toggle(index, option);
            true
        })
    }

    pub fn commit_ask_user_draft(&self, session_id: &str, index: usize) -> bool {
        self.with_question(session_id, |aggregator| aggregator.commit_draft(index))
    }

    /// Adapter collected all answers itself; finalize in one call.
    pub fn allow_pending_ask_user_question(&self, session_id: &str, answers: &Value) -> bool {
        self.with_question(session_id, |aggregator| {
            aggregator.record_all(answers);
            true
        })
    }

    /// Run `apply` against the session's pending structured question, then
    /// finalize and respond if the answer set became complete.
    fn with_question(
        &self,
        session_id: &str,
        apply: impl FnOnce(&mut QuestionAggregator) -> bool,
    ) -> bool {
        let finalized = {
            let mut state = self.state.lock();
            let Some(request_id) = state
                .pending
                .iter()
                .find(|(_, p)| p.session_id == session_id && p.question.is_some())
                .map(|(id, _)| id.clone())
            else {
                tracing::warn!(
                    target = "session_relay::router",
                    session = %session_id,
                    "no pending structured question for session"
                );
                return false;
            };
            let Some(aggregator) = state
                .pending
                .get_mut(&request_id)
                .and_then(|entry| entry.question.as_mut())
            else {
                return false;
            };
            if !apply(aggregator) {
                return false;
            }
            let answers = aggregator.try_finalize();
            match answers {
                Some(answers) => state
                    .pending
                    .remove(&request_id)
                    .map(|entry| (request_id, entry, answers)),
                None => None,
            }
        };

        if let Some((request_id, entry, answers)) = finalized {
            let mut updated_input = entry.tool_input.clone();
            if let Some(object) = updated_input.as_object_mut() {
                object.insert("answers".to_string(), answers);
            } else {
                updated_input = serde_json::json!({ "answers": answers });
            }
            respond(
                &entry.reply,
                &request_id,
                PermissionDecision::allow_with_input(updated_input),
            );
        }
        true
    }

    pub fn set_yolo(&self, session_id: &str, enabled: bool) {
        let mut state = self.state.lock();
        if enabled {
            state.yolo.insert(session_id.to_string());
        } else {
            state.yolo.remove(session_id);
        }
    }

    /// Deliver user text into the session's PTY. A write failure tears
    /// down the binding and surfaces session-end.
    pub fn send_input(&self, session_id: &str, text: &str) -> Result<()> {
        match self.hub.send_input(session_id, text) {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::warn!(
                    target = "session_relay::router",
                    session = %session_id,
                    error = %error,
                    "input delivery failed; tearing down session"
                );
                self.hub.unbind(session_id);
                self.on_session_end(session_id);
                Err(error)
            }
        }
    }

    /// Record the chat thread the adapter opened for a session, both on
    /// the live record and in the durable mapping used after restarts.
    pub fn bind_thread(&self, session_id: &str, thread_id: &str, channel_id: &str) {
        let cwd = self
            .registry
            .get(session_id)
            .map(|s| s.cwd.clone())
            .unwrap_or_default();
        let binding = ThreadBinding {
            thread_id: thread_id.to_string(),
            channel_id: channel_id.to_string(),
        };
        if self.registry.contains(session_id) {
            let _ = self.registry.set_thread(session_id, binding);
        }
        if let Err(error) = self.threads.bind(ThreadMapping {
            session_id: session_id.to_string(),
            thread_id: thread_id.to_string(),
            channel_id: channel_id.to_string(),
            cwd,
        }) {
            tracing::warn!(
                target = "session_relay::router",
                session = %session_id,
                error = %error,
                "failed persisting thread mapping"
            );
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .registry
            .all()
            .into_iter()
            .map(|session| SessionSummary {
                session_id: session.id,
                name: session.name,
                status: session.status,
                cwd: session.cwd.to_string_lossy().into_owned(),
                pid: session.pid,
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Fallback chain for events that need a chat context: the session's
    /// recorded binding, then the persisted mapping (revived for the
    /// adapter via thread-restore), then a live connection whose thread
    /// the adapter is still creating.
    fn ensure_thread_context(&self, session_id: &str) -> bool {
        if let Some(session) = self.registry.get(session_id) {
            if session.thread.is_some() {
                return true;
            }
        }
        if let Some(mapping) = self.threads.lookup(session_id) {
            let binding = mapping.binding();
            if self.registry.contains(session_id) {
                let _ = self.registry.set_thread(session_id, binding.clone());
            }
            self.emit(SessionEvent::ThreadRestore {
                session_id: session_id.to_string(),
                thread_id: binding.thread_id,
                channel_id: binding.channel_id,
            });
            return true;
        }
        self.state.lock().live.contains_key(session_id)
    }
}

fn respond(reply: &UnboundedSender<DaemonFrame>, request_id: &str, decision: PermissionDecision) {
    let frame = DaemonFrame::PermissionResponse {
        request_id: request_id.to_string(),
        decision,
    };
    if reply.send(frame).is_err() {
        tracing::warn!(
            target = "session_relay::router",
            request = %request_id,
            "permission response dropped; connection gone"
        );
    }
}

/// Dedup key shared by both message sources.
fn message_key(session_id: &str, text: &str) -> String {
    let prefix: String = text.trim().chars().take(100).collect();
    format!("pty:{session_id}:{}", line_hash(&prefix))
}
