//! Harness adapters for agent CLIs.
//!
//! A [`Harness`] turns a prompt into a process invocation and hands out a
//! fresh [`StreamHandler`] per run. The handler folds the process's JSONL
//! events into one completion contract, so the runner never branches on
//! the harness kind after launch.
//!
//! ```text
//! Runner
//!     |
//!     v
//! HarnessRegistry --get("codex")--> &dyn Harness
//!     |                                  |
//!     |   build_command(prompt, opts) ---+--> HarnessCommand { program, args }
//!     |   stream_handler() --------------+--> Box<dyn StreamHandler>
//!     |                                          on_event(&Value)
//!     |                                          is_complete() / result()
//!     |                                          resume_token()
//! ```

pub mod claude_code;
pub mod codex;
pub mod gemini;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use claude_code::ClaudeCodeAdapter;
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;
pub use registry::HarnessRegistry;
pub use trait_def::{Harness, StreamHandler};
pub use types::{CommandOptions, HarnessCommand};
