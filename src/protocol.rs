//! Wire schema for the runner RPC channel.
//!
//! Frames are newline-delimited JSON objects. Field names follow the
//! runner's camelCase convention; the `type` tag selects the frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames a runner (or an out-of-band permission hook) sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RunnerFrame {
    /// First frame on a runner connection; binds the connection to `id`.
    SessionStart {
        id: String,
        project_dir: String,
        cwd: String,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        name: Option<String>,
        jsonl_file: String,
        #[serde(default)]
        pid: u32,
    },
    SessionEnd {
        session_id: String,
    },
    TitleUpdate {
        session_id: String,
        title: String,
    },
    /// Fallback delivery of cleaned assistant text observed on the PTY
    /// stream, for when the event log omits a record.
    PtyOutput {
        session_id: String,
        content: String,
        #[serde(default)]
        is_thinking: bool,
        #[serde(default)]
        timestamp: Option<String>,
    },
    PermissionRequest {
        request_id: String,
        session_id: String,
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
    },
    /// Accepted for schema completeness; the daemon is the decider and
    /// ignores inbound decisions.
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
    },
}

/// Frames the daemon sends back down a runner connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DaemonFrame {
    /// User text to type into the PTY.
    Input { text: String },
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub behavior: PermissionBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<Value>,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            message: None,
            updated_input: None,
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            message: Some(message.into()),
            updated_input: None,
        }
    }

    pub fn allow_with_input(updated_input: Value) -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            message: None,
            updated_input: Some(updated_input),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{DaemonFrame, PermissionBehavior, PermissionDecision, RunnerFrame};

    #[test]
    fn session_start_parses_wire_shape() {
        let raw = r#"{"type":"session_start","id":"A","projectDir":"/p","cwd":"/w","command":["claude"],"jsonlFile":"A.jsonl","pid":4242}"#;
        let frame: RunnerFrame = serde_json::from_str(raw).unwrap();
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
                assert_eq!(id, "A");
                assert_eq!(project_dir, "/p");
                assert_eq!(cwd, "/w");
                assert_eq!(command, vec!["claude".to_string()]);
                assert_eq!(name, None);
                assert_eq!(jsonl_file, "A.jsonl");
                assert_eq!(pid, 4242);
            }
            other => panic!("expected session_start, got {other:?}"),
        }
    }

    #[test]
    fn pty_output_defaults_optional_fields() {
        let raw = r#"{"type":"pty_output","sessionId":"A","content":"hi"}"#;
        let frame: RunnerFrame = serde_json::from_str(raw).unwrap();
        match frame {
            RunnerFrame::PtyOutput {
                session_id,
                content,
                is_thinking,
                timestamp,
            } => {
                assert_eq!(session_id, "A");
                assert_eq!(content, "hi");
                assert!(!is_thinking);
                assert_eq!(timestamp, None);
            }
            other => panic!("expected pty_output, got {other:?}"),
        }
    }

    #[test]
    fn permission_request_round_trip() {
        let frame = RunnerFrame::PermissionRequest {
            request_id: "r1".into(),
            session_id: "A".into(),
            tool_name: "Bash".into(),
            tool_input: json!({"command": "ls"}),
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"requestId\":\"r1\""));
        assert!(encoded.contains("\"toolName\":\"Bash\""));
        let decoded: RunnerFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn input_frame_wire_shape() {
        let frame = DaemonFrame::Input {
            text: "hello".into(),
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        assert_eq!(encoded, r#"{"type":"input","text":"hello"}"#);
    }

    #[test]
    fn permission_response_carries_updated_input() {
        let frame = DaemonFrame::PermissionResponse {
            request_id: "r2".into(),
            decision: PermissionDecision::allow_with_input(json!({
                "answers": {"0": "yes", "1": "blue"}
            })),
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: DaemonFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert!(encoded.contains("\"updatedInput\""));
    }

    #[test]
    fn deny_decision_omits_updated_input() {
        let decision = PermissionDecision::deny("Error processing request");
        let encoded = serde_json::to_string(&decision).unwrap();
        assert_eq!(
            encoded,
            r#"{"behavior":"deny","message":"Error processing request"}"#
        );
        let decoded: PermissionDecision = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.behavior, PermissionBehavior::Deny);
    }
}
