//! Bridge layer connecting the monitor, scheduler and recovery loop to
//! whatever is listening (the CLI, a UI shell, tests).
//!
//! - [`event_bus`]: flume-backed pub/sub, generic over the message type
//! - [`protocol`]: the [`protocol::BridgeMessage`] wire enum

pub mod event_bus;
pub mod protocol;
