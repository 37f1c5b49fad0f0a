//! Codex harness adapter.
//!
//! `codex exec --json` emits one JSON object per line:
//!
//! ```text
//! {"type":"thread.started","thread_id":"..."}
//! {"type":"turn.started"}
//! {"type":"item.completed","item":{"type":"agent_message","text":"..."}}
//! {"type":"turn.completed","usage":{...}}
//! ```
//!
//! A turn ends with either `turn.completed` or `turn.failed`; a top-level
//! `error` event also marks the run as failed.

use serde_json::Value;
use tracing::debug;

use super::trait_def::{Harness, StreamHandler};
use super::types::{CommandOptions, HarnessCommand, str_field};

/// Harness adapter for the Codex CLI.
#[derive(Debug, Clone)]
pub struct CodexAdapter {
    binary: String,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self::with_binary("codex")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    fn build_command(&self, prompt: &str, options: &CommandOptions) -> HarnessCommand {
        let mut cmd = HarnessCommand::new(&self.binary).args(["exec", "--json", "--full-auto"]);
        if let Some(model) = &options.model {
            cmd = cmd.arg("--model").arg(model);
        }
        cmd = cmd.args(options.extra_args.iter().cloned());
        // The prompt is positional and must come last.
        if let Some(token) = &options.resume_token {
            cmd = cmd.arg("resume").arg(token);
        }
        cmd.arg(prompt)
    }

    fn stream_handler(&self) -> Box<dyn StreamHandler> {
        Box::new(CodexStream::default())
    }
}

/// Accumulates one Codex run.
#[derive(Debug, Default)]
pub struct CodexStream {
    thread_id: Option<String>,
    messages: Vec<String>,
    completed: bool,
    failure: Option<String>,
}

impl CodexStream {
    fn on_item(&mut self, v: &Value) {
        let Some(item) = v.get("item") else {
            return;
        };
        if !matches!(
            str_field(item, "type"),
            Some("agent_message" | "assistant_message")
        ) {
            return;
        }
        match str_field(item, "text") {
            Some(text) if !text.trim().is_empty() => self.messages.push(text.to_string()),
            _ => {}
        }
    }

    fn fail(&mut self, v: &Value) {
        let message = str_field(v, "message")
            .or_else(|| v.get("error").and_then(|e| str_field(e, "message")))
            .unwrap_or("codex turn failed");
        self.failure = Some(message.to_string());
        self.completed = false;
    }
}

impl StreamHandler for CodexStream {
    fn on_event(&mut self, event: &Value) {
        match str_field(event, "type").unwrap_or("") {
            "thread.started" => {
                if let Some(id) = str_field(event, "thread_id") {
                    self.thread_id = Some(id.to_string());
                }
            }
            "item.completed" => self.on_item(event),
            "turn.completed" => {
                if self.failure.is_none() {
                    self.completed = true;
                }
            }
            "turn.failed" | "error" => self.fail(event),
            "turn.started" | "item.started" | "item.updated" => {}
            other => debug!(event_type = other, "ignoring unrecognised codex event type"),
        }
    }

    fn is_complete(&self) -> bool {
        self.completed
    }

    fn result(&self) -> String {
        let mut out = self.messages.join("\n");
        if let Some(failure) = &self.failure {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(failure);
        }
        out
    }

    fn resume_token(&self) -> Option<String> {
        self.thread_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(events: &[Value]) -> Box<dyn StreamHandler> {
        let mut handler = CodexAdapter::new().stream_handler();
        for e in events {
            handler.on_event(e);
        }
        handler
    }

    #[test]
    fn prompt_is_the_last_argument() {
        let cmd = CodexAdapter::new().build_command(
            "fix tests",
            &CommandOptions {
                model: Some("o4".into()),
                resume_token: None,
                extra_args: vec!["--skip-git-repo-check".into()],
            },
        );
        assert_eq!(cmd.program, "codex");
        assert_eq!(
            cmd.args,
            vec![
                "exec",
                "--json",
                "--full-auto",
                "--model",
                "o4",
                "--skip-git-repo-check",
                "fix tests",
            ]
        );
    }

    #[test]
    fn resume_uses_subcommand_form() {
        let cmd = CodexAdapter::with_binary("/opt/codex").build_command(
            "continue",
            &CommandOptions {
                resume_token: Some("th-1".into()),
                ..Default::default()
            },
        );
        assert_eq!(cmd.program, "/opt/codex");
        assert_eq!(
            cmd.args,
            vec!["exec", "--json", "--full-auto", "resume", "th-1", "continue"]
        );
    }

    #[test]
    fn completed_turn_is_success() {
        let h = feed(&[
            json!({"type":"thread.started","thread_id":"th-42"}),
            json!({"type":"turn.started"}),
            json!({"type":"item.completed","item":{"type":"reasoning","text":"thinking"}}),
            json!({"type":"item.completed","item":{"type":"agent_message","text":"patched it"}}),
            json!({"type":"turn.completed","usage":{"input_tokens":10}}),
        ]);
        assert!(h.is_complete());
        assert_eq!(h.result(), "patched it");
        assert_eq!(h.resume_token().as_deref(), Some("th-42"));
    }

    #[test]
    fn failed_turn_is_not_success_even_if_completed_follows() {
        let h = feed(&[
            json!({"type":"item.completed","item":{"type":"agent_message","text":"half"}}),
            json!({"type":"turn.failed","error":{"message":"rate limited"}}),
            json!({"type":"turn.completed"}),
        ]);
        assert!(!h.is_complete());
        assert_eq!(h.result(), "half\nrate limited");
    }

    #[test]
    fn error_event_marks_failure() {
        let h = feed(&[json!({"type":"error","message":"stream disconnected"})]);
        assert!(!h.is_complete());
        assert_eq!(h.result(), "stream disconnected");
    }

    #[test]
    fn stream_without_turn_end_is_incomplete() {
        let h = feed(&[
            json!({"type":"item.completed","item":{"type":"agent_message","text":"partial"}}),
            json!({"type":"something.new"}),
            json!(42),
        ]);
        assert!(!h.is_complete());
        assert_eq!(h.result(), "partial");
        assert!(h.resume_token().is_none());
    }
}
