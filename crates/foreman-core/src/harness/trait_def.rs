//! The `Harness` and `StreamHandler` traits.
//!
//! Both are object-safe so adapters can live as `Box<dyn Harness>` in the
//! [`super::HarnessRegistry`] and handlers can be driven as
//! `Box<dyn StreamHandler>` by the runner.

use serde_json::Value;

use super::types::{CommandOptions, HarnessCommand};

/// Adapter for one kind of agent CLI.
pub trait Harness: Send + Sync {
    /// Registry key for this harness (e.g. "claude-code").
    fn name(&self) -> &str;

    /// Build the process invocation for a prompt.
    fn build_command(&self, prompt: &str, options: &CommandOptions) -> HarnessCommand;

    /// A fresh handler for one run's event stream.
    fn stream_handler(&self) -> Box<dyn StreamHandler>;
}

/// Incremental parser for one process's event stream.
///
/// Events arrive as already-decoded JSON values, one per stdout line.
/// Unknown or malformed events must be ignored, never fatal.
pub trait StreamHandler: Send {
    fn on_event(&mut self, event: &Value);

    /// Whether the stream reached the harness's success terminator.
    fn is_complete(&self) -> bool;

    /// Result text accumulated so far. Partial if the run did not complete.
    fn result(&self) -> String;

    /// Session id reported by the harness, if any.
    fn resume_token(&self) -> Option<String>;
}

// Compile-time assertion: both traits must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Harness, _: &dyn StreamHandler) {}
};
