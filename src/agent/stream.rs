//! Parsing the agent CLI's `stream-json` output.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// One line of `--output-format stream-json`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Short description of a tool call for debug logs.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = match name {
        "Read" | "Write" | "Edit" => "file_path",
        "Bash" => "command",
        "Glob" | "Grep" => "pattern",
        _ => return name.to_string(),
    };
    match input.get(field).and_then(|v| v.as_str()) {
        Some(arg) => format!("{}: {}", name, truncate(arg, 60)),
        None => name.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}

/// Accumulates a stream into the final text and session id.
#[derive(Debug, Default)]
pub struct StreamCollector {
    text: String,
    result: Option<String>,
    session_id: Option<String>,
    is_error: bool,
}

/// What a finished stream produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// The `result` event text when present, otherwise all assistant text.
    pub output: String,
    pub session_id: Option<String>,
    pub is_error: bool,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let event = match serde_json::from_str::<StreamEvent>(line) {
            Ok(event) => event,
            Err(_) => {
                // Plain text from a CLI that ignored the output format.
                self.text.push_str(line);
                self.text.push('\n');
                return;
            }
        };

        match event {
            StreamEvent::System { session_id, .. } => self.note_session(session_id),
            StreamEvent::Assistant {
                message,
                session_id,
            } => {
                self.note_session(session_id);
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.text.push_str(&text);
                            self.text.push('\n');
                        }
                        ContentBlock::ToolUse { name, input } => {
                            debug!(tool = %describe_tool_use(&name, &input), "Agent tool use");
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::Result {
                result,
                is_error,
                session_id,
                ..
            } => {
                self.note_session(session_id);
                self.result = result;
                self.is_error = is_error;
            }
            StreamEvent::Other => {}
        }
    }

    fn note_session(&mut self, session_id: Option<String>) {
        if let Some(id) = session_id.filter(|s| !s.is_empty()) {
            self.session_id = Some(id);
        }
    }

    pub fn finish(self) -> StreamOutcome {
        StreamOutcome {
            output: self.result.unwrap_or(self.text),
            session_id: self.session_id,
            is_error: self.is_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_event_wins_over_assistant_text() {
        let mut collector = StreamCollector::new();
        collector.push_line(r#"{"type":"system","subtype":"init","session_id":"s-1"}"#);
        collector.push_line(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"thinking"}]},"session_id":"s-1"}"#,
        );
        collector.push_line(
            r#"{"type":"result","subtype":"success","result":"IMPLEMENTATION_COMPLETE feat/x","is_error":false,"session_id":"s-1"}"#,
        );
        let outcome = collector.finish();
        assert_eq!(outcome.output, "IMPLEMENTATION_COMPLETE feat/x");
        assert_eq!(outcome.session_id.as_deref(), Some("s-1"));
        assert!(!outcome.is_error);
    }

    #[test]
    fn test_assistant_text_used_without_result() {
        let mut collector = StreamCollector::new();
        collector.push_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/a/b.rs"}},{"type":"text","text":"done"}]}}"#,
        );
        let outcome = collector.finish();
        assert_eq!(outcome.output, "done\n");
        assert!(outcome.session_id.is_none());
    }

    #[test]
    fn test_non_json_lines_are_kept() {
        let mut collector = StreamCollector::new();
        collector.push_line("plain output");
        collector.push_line("");
        collector.push_line(r#"{"type":"user","message":{}}"#);
        assert_eq!(collector.finish().output, "plain output\n");
    }

    #[test]
    fn test_error_result_is_flagged() {
        let mut collector = StreamCollector::new();
        collector.push_line(
            r#"{"type":"result","subtype":"error_during_execution","result":"API Error: 529 overloaded","is_error":true}"#,
        );
        let outcome = collector.finish();
        assert!(outcome.is_error);
        assert!(outcome.output.contains("overloaded"));
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"command": "cargo test --workspace"});
        assert_eq!(describe_tool_use("Bash", &input), "Bash: cargo test --workspace");
        assert_eq!(describe_tool_use("Task", &input), "Task");
        let long = serde_json::json!({"pattern": "x".repeat(100)});
        assert!(describe_tool_use("Grep", &long).ends_with("..."));
    }
}
