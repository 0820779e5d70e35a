//! The subset of the agent's append-only event-log schema the daemon
//! consumes. One JSON object per line, one file per session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker text the agent embeds in user records when plan mode toggles.
pub const PLAN_MODE_ON_MARKER: &str = "plan mode is active";
pub const PLAN_MODE_OFF_MARKER: &str = "exited plan mode";

#[derive(Debug, Clone, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "type")]
    pub record_type: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub todos: Option<Vec<TodoItem>>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "isMeta", default)]
    pub is_meta: bool,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub message: Option<MessageBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

/// `message.content` is either a plain string or a list of typed items.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Items(Vec<ContentItem>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    /// Thinking blocks and future item types pass through unobserved.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Items(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub content: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
}

impl LogRecord {
    pub fn role(&self) -> Option<&str> {
        self.message.as_ref()?.role.as_deref()
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Joined text of all plain-text content parts.
    pub fn text(&self) -> Option<String> {
        let content = self.message.as_ref()?.content.as_ref()?;
        let text = match content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Items(items) => {
                let parts: Vec<&str> = items
                    .iter()
                    .filter_map(|item| match item {
                        ContentItem::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if parts.is_empty() {
                    return None;
                }
                parts.join("\n")
            }
        };
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn content_items(&self) -> &[ContentItem] {
        match self.message.as_ref().and_then(|m| m.content.as_ref()) {
            Some(MessageContent::Items(items)) => items,
            _ => &[],
        }
    }

    /// True for plain conversational records the adapter should see:
    /// role-bearing, not meta, not a subtyped synthetic.
    pub fn is_conversational(&self) -> bool {
        if self.is_meta || self.subtype.is_some() {
            return false;
        }
        matches!(self.role(), Some("user") | Some("assistant"))
    }

    pub fn plan_mode_toggle(&self) -> Option<bool> {
        if self.record_type.as_deref() != Some("user") {
            return None;
        }
        let text = self.text()?;
        let lowered = text.to_lowercase();
        if lowered.contains(PLAN_MODE_ON_MARKER) {
            Some(true)
        } else if lowered.contains(PLAN_MODE_OFF_MARKER) {
            Some(false)
        } else {
            None
        }
    }
}

impl ToolResultContent {
    /// Joined textual content; array form joins its `text` parts.
    pub fn joined_text(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Items(items) => items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentItem, LogRecord, MessageContent};

    fn parse(raw: &str) -> LogRecord {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn assistant_text_record() {
        let record = parse(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"hi"}]},"timestamp":"2026-08-02T10:00:00Z"}"#,
        );
        assert!(record.is_conversational());
        assert_eq!(record.text().as_deref(), Some("hi"));
        assert!(record.parsed_timestamp().is_some());
    }

    #[test]
    fn string_content_is_text() {
        let record = parse(r#"{"type":"user","message":{"role":"user","content":"do the thing"}}"#);
        assert_eq!(record.text().as_deref(), Some("do the thing"));
    }

    #[test]
    fn meta_and_subtyped_records_are_not_conversational() {
        let meta = parse(r#"{"type":"user","isMeta":true,"message":{"role":"user","content":"x"}}"#);
        assert!(!meta.is_conversational());
        let synthetic = parse(
            r#"{"type":"user","subtype":"compact_boundary","message":{"role":"user","content":"x"}}"#,
        );
        assert!(!synthetic.is_conversational());
    }

    #[test]
    fn tool_use_items_parse() {
        let record = parse(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#,
        );
        let items = record.content_items();
        assert_eq!(items.len(), 1);
        match &items[0] {
            ContentItem::ToolUse { id, name, input } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "Bash");
                assert_eq!(input["command"], "ls");
            }
            other => panic!("expected tool_use, got {other:?}"),
        }
    }

    #[test]
    fn tool_result_joins_text_parts() {
        let record = parse(
            r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}],"is_error":false}]}}"#,
        );
        match &record.content_items()[0] {
            ContentItem::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(content.as_ref().unwrap().joined_text(), "a\nb");
                assert!(!is_error);
            }
            other => panic!("expected tool_result, got {other:?}"),
        }
    }

    #[test]
    fn unknown_content_item_types_tolerated() {
        let record = parse(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"thinking","thinking":"..."},{"type":"text","text":"done"}]}}"#,
        );
        assert_eq!(record.text().as_deref(), Some("done"));
    }

    #[test]
    fn plan_mode_markers_detected_in_user_records_only() {
        let on = parse(
            r#"{"type":"user","message":{"role":"user","content":"<system-reminder>Plan mode is active.</system-reminder>"}}"#,
        );
        assert_eq!(on.plan_mode_toggle(), Some(true));

        let off = parse(
            r#"{"type":"user","message":{"role":"user","content":"User exited plan mode."}}"#,
        );
        assert_eq!(off.plan_mode_toggle(), Some(false));

        let assistant = parse(
            r#"{"type":"assistant","message":{"role":"assistant","content":"plan mode is active"}}"#,
        );
        assert_eq!(assistant.plan_mode_toggle(), None);
    }

    #[test]
    fn todos_parse_with_active_form() {
        let record = parse(
            r#"{"type":"user","todos":[{"content":"write tests","status":"in_progress","activeForm":"Writing tests"}]}"#,
        );
        let todos = record.todos.unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].status, "in_progress");
        assert_eq!(todos[0].active_form.as_deref(), Some("Writing tests"));
    }

    #[test]
    fn whitespace_only_text_is_none() {
        let record = parse(r#"{"type":"user","message":{"role":"user","content":"   "}}"#);
        assert!(record.text().is_none());
        assert!(matches!(
            record.message.as_ref().unwrap().content,
            Some(MessageContent::Text(_))
        ));
    }
}
