//! Background daemon for auto-claude.
//!
//! - [`scheduler`]: kanban queue promotion under a parallelism cap, with
//!   failure-triggered blocking ([`failure_detection`]).
//! - [`recovery`]: at-most-one-in-flight recovery messages into the agent's
//!   terminal, composed by [`recovery_prompt`].
//! - [`daemon`]: wires both to the activity monitor and runs until shutdown.

pub mod daemon;
pub mod failure_detection;
mod guard;
pub mod recovery;
pub mod recovery_prompt;
pub mod scheduler;
pub mod shutdown;
