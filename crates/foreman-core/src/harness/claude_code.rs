//! Claude Code harness adapter.
//!
//! Runs `claude -p <prompt> --output-format stream-json --verbose`. The
//! stream is a sequence of `system`, `assistant` and `user` events ended by
//! a single `result` event whose `subtype` is `success` or an `error_*`
//! variant.

use serde_json::Value;
use tracing::debug;

use super::trait_def::{Harness, StreamHandler};
use super::types::{CommandOptions, HarnessCommand, str_field};

/// Harness adapter for [Claude Code](https://docs.anthropic.com/en/docs/claude-code).
#[derive(Debug, Clone)]
pub struct ClaudeCodeAdapter {
    /// Path to the `claude` binary. Defaults to `"claude"` (found via `$PATH`).
    claude_binary_path: String,
}

impl ClaudeCodeAdapter {
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Use a custom binary, e.g. a fake agent script in tests.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            claude_binary_path: path.into(),
        }
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude-code"
    }

    fn build_command(&self, prompt: &str, options: &CommandOptions) -> HarnessCommand {
        let mut cmd = HarnessCommand::new(&self.claude_binary_path).args([
            "-p",
            prompt,
            "--output-format",
            "stream-json",
            "--verbose",
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
        Box::new(ClaudeStream::default())
    }
}

// ---------------------------------------------------------------------------
// Stream handling
// ---------------------------------------------------------------------------

/// Accumulates one Claude Code run.
#[derive(Debug, Default)]
pub struct ClaudeStream {
    session_id: Option<String>,
    /// Assistant text blocks, kept as the fallback result.
    texts: Vec<String>,
    final_result: Option<String>,
    success: bool,
    error: Option<String>,
}

impl ClaudeStream {
    fn on_assistant(&mut self, v: &Value) {
        let Some(blocks) = v
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
        else {
            return;
        };
        let texts = blocks
            .iter()
            .filter(|b| str_field(b, "type") == Some("text"))
            .filter_map(|b| str_field(b, "text"))
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string);
        self.texts.extend(texts);
    }

    fn on_result(&mut self, v: &Value) {
        let subtype = str_field(v, "subtype").unwrap_or("");
        let is_error = v.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        if let Some(text) = str_field(v, "result") {
            self.final_result = Some(text.to_string());
        }
        if subtype == "success" && !is_error {
            self.success = true;
        } else {
            self.error = Some(format!("claude reported {subtype:?}"));
        }
    }
}

impl StreamHandler for ClaudeStream {
    fn on_event(&mut self, event: &Value) {
        if let Some(id) = str_field(event, "session_id") {
            self.session_id = Some(id.to_string());
        }
        match str_field(event, "type").unwrap_or("") {
            "assistant" => self.on_assistant(event),
            "result" => self.on_result(event),
            "system" | "user" => {}
            other => debug!(event_type = other, "ignoring unrecognised stream-json event type"),
        }
    }

    fn is_complete(&self) -> bool {
        self.success
    }

    fn result(&self) -> String {
        let mut out = match &self.final_result {
            Some(text) if !text.is_empty() => text.clone(),
            _ => self.texts.join("\n"),
        };
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
