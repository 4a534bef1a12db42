//! Delivery of text into the terminal that hosts the coding agent.
//!
//! - [`channel`]: the [`channel::SendChannel`] contract (send + busy query)
//! - [`tmux`]: implementation that targets a tmux pane by its stable id

pub mod channel;
pub mod tmux;
