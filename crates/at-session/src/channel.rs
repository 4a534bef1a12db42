use async_trait::async_trait;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TerminalError {
    /// The destination (pane, session, process) no longer exists.
    #[error("destination not found: {0}")]
    NotFound(String),

    #[error("terminal command failed: {0}")]
    CommandFailed(String),

    #[error("terminal I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TerminalError>;

// ---------------------------------------------------------------------------
// SendChannel
// ---------------------------------------------------------------------------

/// Outbound channel into the agent's terminal.
///
/// Destinations are stable handles (a tmux pane id such as `%3`, a process
/// id) rather than display titles, which the agent rewrites freely.
#[async_trait]
pub trait SendChannel: Send + Sync {
    /// Type `text` into `destination` and submit it.
    async fn send(&self, destination: &str, text: &str) -> Result<()>;

    /// `true` when the agent in `destination` is visibly mid-turn.
    async fn is_busy(&self, destination: &str) -> Result<bool>;
}
