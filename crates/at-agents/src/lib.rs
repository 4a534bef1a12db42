//! Agent activity detection.
//!
//! Reads the agent's JSONL session transcripts and infers whether it is
//! waiting at its prompt, busy processing, or idle.

pub mod activity_monitor;
pub mod classifier;
pub mod locator;
pub mod transcript;

pub use activity_monitor::{ActivityEvent, ActivityMonitor, MonitorError, StateChange};
