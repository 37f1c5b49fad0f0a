//! Gemini CLI harness adapter.
//!
//! With `--output-format stream-json` the CLI emits an `init` event carrying
//! the session id, role-tagged `message` events (assistant messages may be
//! split into `delta` chunks), tool events, and a final `result` event whose
//! `status` is `success` or `error`.

use serde_json::Value;
use tracing::debug;

use super::trait_def::{Harness, StreamHandler};
use super::types::{CommandOptions, HarnessCommand, str_field};

#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    binary: String,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self::with_binary("gemini")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn build_command(&self, prompt: &str, options: &CommandOptions) -> HarnessCommand {
        let mut cmd = HarnessCommand::new(&self.binary).args([
            "-p",
            prompt,
            "--output-format",
            "stream-json",
            "--yolo",
        ]);
        if let Some(model) = &options.model {
            cmd = cmd.arg("--model").arg(model);
        }
        if let Some(token) = &options.resume_token {
            cmd = cmd.arg("--resume").arg(token);
        }
        cmd.args(options.extra_args.iter().cloned())
    }

    fn stream_handler(&self) -> Box<dyn StreamHandler> {
        Box::new(GeminiStream::default())
    }
}

/// Accumulates one Gemini run.
#[derive(Debug, Default)]
pub struct GeminiStream {
    session_id: Option<String>,
    messages: Vec<String>,
    success: bool,
    error: Option<String>,
}

impl GeminiStream {
    fn on_message(&mut self, v: &Value) {
        if str_field(v, "role") != Some("assistant") {
            return;
        }
        let Some(content) = str_field(v, "content") else {
            return;
        };
        let delta = v.get("delta").and_then(Value::as_bool).unwrap_or(false);
        match self.messages.last_mut() {
            Some(last) if delta => last.push_str(content),
            _ => self.messages.push(content.to_string()),
        }
    }

    fn on_result(&mut self, v: &Value) {
        if str_field(v, "status") == Some("success") {
            self.success = true;
            return;
        }
        let message = v
            .get("error")
            .and_then(|e| str_field(e, "message"))
            .unwrap_or("gemini reported an error");
        self.error = Some(message.to_string());
    }
}

impl StreamHandler for GeminiStream {
    fn on_event(&mut self, event: &Value) {
        match str_field(event, "type").unwrap_or("") {
            "init" => {
                if let Some(id) = str_field(event, "session_id") {
                    self.session_id = Some(id.to_string());
                }
            }
            "message" => self.on_message(event),
            "result" => self.on_result(event),
            "tool_use" | "tool_result" => {}
            other => debug!(event_type = other, "ignoring unrecognised gemini event type"),
        }
    }

    fn is_complete(&self) -> bool {
        self.success
    }

    fn result(&self) -> String {
        let mut out = self
            .messages
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(error) = &self.error {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(error);
        }
        out
    }

    fn resume_token(&self) -> Option<String> {
        self.session_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(events: &[Value]) -> Box<dyn StreamHandler> {
        let mut handler = GeminiAdapter::new().stream_handler();
        for e in events {
            handler.on_event(e);
        }
        handler
    }

    #[test]
    fn command_layout() {
        let cmd = GeminiAdapter::new().build_command(
            "review",
            &CommandOptions {
                model: Some("gemini-2.5-pro".into()),
                resume_token: Some("s-1".into()),
                extra_args: vec![],
            },
        );
        assert_eq!(cmd.program, "gemini");
        assert_eq!(
            cmd.args,
            vec![
                "-p",
                "review",
                "--output-format",
                "stream-json",
                "--yolo",
                "--model",
                "gemini-2.5-pro",
                "--resume",
                "s-1",
            ]
        );
    }

    #[test]
    fn deltas_are_joined_into_one_message() {
        let h = feed(&[
            json!({"type":"init","session_id":"g-7","model":"x"}),
            json!({"type":"message","role":"user","content":"the prompt"}),
            json!({"type":"message","role":"assistant","content":"Hel","delta":true}),
            json!({"type":"message","role":"assistant","content":"lo","delta":true}),
            json!({"type":"tool_use","tool_name":"shell"}),
            json!({"type":"message","role":"assistant","content":"Done."}),
            json!({"type":"result","status":"success","stats":{}}),
        ]);
        assert!(h.is_complete());
        assert_eq!(h.result(), "Hello\nDone.");
        assert_eq!(h.resume_token().as_deref(), Some("g-7"));
    }

    #[test]
    fn error_result_fails() {
        let h = feed(&[
            json!({"type":"message","role":"assistant","content":"trying"}),
            json!({"type":"result","status":"error","error":{"message":"quota exceeded"}}),
        ]);
        assert!(!h.is_complete());
        assert_eq!(h.result(), "trying\nquota exceeded");
    }

    #[test]
    fn missing_result_is_incomplete() {
        let h = feed(&[
            json!({"type":"message","role":"assistant","content":"partial"}),
            json!({"type":"mystery"}),
            json!(null),
        ]);
        assert!(!h.is_complete());
        assert_eq!(h.result(), "partial");
    }
}
