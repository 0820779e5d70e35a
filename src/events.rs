use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use crate::protocol::PermissionDecision;
use crate::questions::AskQuestion;
use crate::records::TodoItem;
use crate::registry::SessionStatus;

pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Upward event stream: everything the chat adapter can observe.
///
/// The daemon binary writes these as NDJSON on stdout; an in-process
/// adapter consumes them straight off the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    SessionStart {
        session_id: String,
        cwd: String,
        name: String,
    },
    SessionEnd {
        session_id: String,
    },
    NameUpdate {
        session_id: String,
        name: String,
    },
    StatusChange {
        session_id: String,
        old: SessionStatus,
        new: SessionStatus,
    },
    TitleChange {
        session_id: String,
        title: String,
    },
    Message {
        session_id: String,
        role: String,
        text: String,
    },
    Todos {
        session_id: String,
        todos: Vec<TodoItem>,
    },
    ToolCall {
        session_id: String,
        tool_use_id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        session_id: String,
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    PlanModeChange {
        session_id: String,
        active: bool,
    },
    PermissionRequest {
        session_id: String,
        request_id: String,
        tool_name: String,
        tool_input: Value,
    },
    /// Ask-user specialization of a permission request; no generic
    /// permission UI is emitted for these.
    StructuredQuestion {
        session_id: String,
        request_id: String,
        questions: Vec<AskQuestion>,
    },
    /// A permission request was auto-allowed because the session is in
    /// YOLO mode.
    YoloNotified {
        session_id: String,
        request_id: String,
        tool_name: String,
    },
    /// A prior chat thread was found in the persisted mapping; the
    /// adapter should un-archive it and reuse it for this session.
    ThreadRestore {
        session_id: String,
        thread_id: String,
        channel_id: String,
    },
    /// A persisted session did not survive the daemon restart; the
    /// adapter should post a notice to the thread and archive it.
    SessionLost {
        session_id: String,
        thread_id: String,
        channel_id: String,
    },
    Sessions {
        sessions: Vec<SessionSummary>,
    },
    CommandError {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub name: String,
    pub status: SessionStatus,
    pub cwd: String,
    pub pid: u32,
}

/// Commands the chat adapter sends into the core (NDJSON on stdin for the
/// daemon binary, direct method calls for an in-process adapter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AdapterCommand {
    StartSession {
        #[serde(default)]
        cwd: Option<String>,
        command: Vec<String>,
        #[serde(default)]
        terminal: bool,
    },
    StopSession {
        session_id: String,
        #[serde(default)]
        force: bool,
    },
    ListSessions {},
    SendInput {
        session_id: String,
        text: String,
    },
    PermissionDecision {
        request_id: String,
        decision: PermissionDecision,
    },
    AskUserAnswer {
        session_id: String,
        question_index: usize,
        answer: String,
    },
    AskUserToggle {
        session_id: String,
        question_index: usize,
        option: String,
    },
    AskUserCommit {
        session_id: String,
        question_index: usize,
    },
    AskUserAnswers {
        session_id: String,
        answers: Value,
    },
    SetYolo {
        session_id: String,
        enabled: bool,
    },
    /// The adapter created (or resolved) a chat thread for a session.
    BindThread {
        session_id: String,
        thread_id: String,
        channel_id: String,
    },
    Shutdown {},
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AdapterCommand, SessionEvent};
    use crate::registry::SessionStatus;

    #[test]
    fn event_kind_tag_is_snake_case() {
        let event = SessionEvent::StatusChange {
            session_id: "A".into(),
            old: SessionStatus::Starting,
            new: SessionStatus::Running,
        };
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"kind\":\"status_change\""));
        assert!(encoded.contains("\"sessionId\":\"A\""));
        assert!(encoded.contains("\"new\":\"running\""));
    }

    #[test]
    fn message_event_round_trip() {
        let event = SessionEvent::Message {
            session_id: "A".into(),
            role: "assistant".into(),
            text: "hi".into(),
        };
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: SessionEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn adapter_commands_parse() {
        let cmd: AdapterCommand = serde_json::from_value(json!({
            "type": "send_input",
            "sessionId": "A",
            "text": "hello"
        }))
        .unwrap();
        assert_eq!(
            cmd,
            AdapterCommand::SendInput {
                session_id: "A".into(),
                text: "hello".into(),
            }
        );

        let cmd: AdapterCommand = serde_json::from_value(json!({
            "type": "ask_user_answers",
            "sessionId": "A",
            "answers": {"0": "yes"}
        }))
        .unwrap();
        assert!(matches!(cmd, AdapterCommand::AskUserAnswers { .. }));
    }

    #[test]
    fn start_session_defaults() {
        let cmd: AdapterCommand =
            serde_json::from_value(json!({"type": "start_session", "command": ["claude"]}))
                .unwrap();
        match cmd {
            AdapterCommand::StartSession {
                cwd,
                command,
                terminal,
            } => {
                assert_eq!(cwd, None);
                assert_eq!(command, vec!["claude".to_string()]);
                assert!(!terminal);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
