//! Answer collection for the structured ask-user permission flow.
//!
//! A single permission request may carry several user-answerable questions.
//! The aggregator owns the full list, the per-question captured answers and
//! the multi-select drafts, and enforces the completion rule: no decision
//! leaves the daemon until every question has an answer.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Tool name that marks a permission request as a structured question.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskQuestion {
    pub question: String,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub multi_select: bool,
}

#[derive(Debug, Clone)]
enum Answer {
    Pending,
    Chosen(Value),
}

#[derive(Debug)]
pub struct QuestionAggregator {
    request_id: String,
    session_id: String,
    questions: Vec<AskQuestion>,
    answers: Vec<Answer>,
    drafts: Vec<Vec<String>>,
}

impl QuestionAggregator {
    /// Build from a `permission_request`'s tool input. Returns `None` when
    /// the input carries no question list.
    pub fn from_tool_input(request_id: &str, session_id: &str, tool_input: &Value) -> Option<Self> {
        #[derive(Deserialize)]
        struct AskInput {
            questions: Vec<AskQuestion>,
        }
        let input: AskInput = serde_json::from_value(tool_input.clone()).ok()?;
        if input.questions.is_empty() {
            return None;
        }
        let count = input.questions.len();
        Some(Self {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            questions: input.questions,
            answers: vec![Answer::Pending; count],
            drafts: vec![Vec::new(); count],
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn questions(&self) -> &[AskQuestion] {
        &self.questions
    }

    /// Capture a single-value answer for one question.
    pub fn record_answer(&mut self, index: usize, answer: &str) -> bool {
        if index >= self.answers.len() {
            return false;
        }
        self.answers[index] = Answer::Chosen(Value::String(answer.to_string()));
        true
    }

    /// Toggle one option in a multi-select draft. Returns whether the
    /// option is selected after the toggle.
    pub fn record_toggle(&mut self, index: usize, option: &str) -> bool {
        let Some(draft) = self.drafts.get_mut(index) else {
            return false;
        };
        if let Some(pos) = draft.iter().position(|o| o == option) {
            draft.remove(pos);
            false
        } else {
            draft.push(option.to_string());
            true
        }
    }

    /// Promote a multi-select draft to the captured answer.
    pub fn commit_draft(&mut self, index: usize) -> bool {
        if index >= self.answers.len() {
            return false;
        }
        let selected = std::mem::take(&mut self.drafts[index]);
        self.answers[index] = Answer::Chosen(json!(selected));
        true
    }

    pub fn is_complete(&self) -> bool {
        self.answers
            .iter()
            .all(|answer| matches!(answer, Answer::Chosen(_)))
    }

    /// The `updatedInput.answers` object, keyed "0", "1", …, once every
    /// question has an answer.
    pub fn try_finalize(&self) -> Option<Value> {
        if !self.is_complete() {
            return None;
        }
        let mut answers = Map::new();
        for (index, answer) in self.answers.iter().enumerate() {
            if let Answer::Chosen(value) = answer {
                answers.insert(index.to_string(), value.clone());
            }
        }
        Some(Value::Object(answers))
    }

    /// Overwrite every answer at once (adapter collected them itself).
    pub fn record_all(&mut self, answers: &Value) -> bool {
        let Some(map) = answers.as_object() else {
            return false;
        };
        for (key, value) in map {
            let Ok(index) = key.parse::<usize>() else {
                return false;
            };
            if index >= self.answers.len() {
                return false;
            }
            self.answers[index] = Answer::Chosen(value.clone());
        }
        self.is_complete()
    }
}
