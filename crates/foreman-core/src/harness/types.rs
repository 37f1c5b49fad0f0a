//! Plain data passed between the runner and harness adapters.

use serde::{Deserialize, Serialize};

/// Per-launch knobs a harness may translate into flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOptions {
    /// Model override, passed through verbatim.
    pub model: Option<String>,
    /// Session to continue instead of starting fresh.
    pub resume_token: Option<String>,
    /// Extra arguments appended after the harness's fixed flags.
    pub extra_args: Vec<String>,
}

/// A fully built process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HarnessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Read a string field from a JSON object.
pub(crate) fn str_field<'a>(v: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|f| f.as_str())
}
