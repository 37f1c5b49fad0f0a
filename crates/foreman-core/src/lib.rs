//! Scheduling, supervision and feedback for foreman work graphs.
//!
//! The pieces line up as a loop: a [`store::WorkStore`] pushes namespace
//! snapshots, [`scheduler::ready`] picks the eligible jobs, the
//! [`runner::Runner`] launches them through a [`harness::Harness`], and the
//! [`feedback::FeedbackController`] grows the graph from each outcome.

pub mod feedback;
pub mod harness;
pub mod prompt;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod store;
