use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::channel::{Result, SendChannel, TerminalError};

/// Name of the tmux paste buffer used for outgoing messages.
const PASTE_BUFFER: &str = "auto-claude-recovery";

/// Number of trailing pane lines inspected by the busy check.
const CAPTURE_LINES: i32 = 15;

/// Markers the agent prints in its status line while a turn is running.
fn default_busy_markers() -> Vec<String> {
    vec![
        "esc to interrupt".to_string(),
        "ctrl+c to interrupt".to_string(),
    ]
}

/// [`SendChannel`] that drives a tmux pane.
///
/// Messages go through a named paste buffer with bracketed paste so that
/// multi-line text arrives as one input instead of being submitted line by
/// line, followed by a single `Enter`.
#[derive(Debug, Clone)]
pub struct TmuxChannel {
    binary: String,
    busy_markers: Vec<String>,
}

impl TmuxChannel {
    pub fn new() -> Self {
        Self {
            binary: "tmux".to_string(),
            busy_markers: default_busy_markers(),
        }
    }

    /// Use a different tmux binary (absolute path or alternate name).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_busy_markers(mut self, markers: Vec<String>) -> Self {
        self.busy_markers = markers;
        self
    }

    async fn run(&self, destination: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary).args(args).output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(classify_failure(
            destination,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn load_buffer(&self, destination: &str, text: &str) -> Result<()> {
        let mut child = Command::new(&self.binary)
            .args(["load-buffer", "-b", PASTE_BUFFER, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(
                destination,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

impl Default for TmuxChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SendChannel for TmuxChannel {
    async fn send(&self, destination: &str, text: &str) -> Result<()> {
        // Copy mode swallows pasted input.
        let in_mode = self
            .run(destination, &["display-message", "-p", "-t", destination, "#{pane_in_mode}"])
            .await?;
        if in_mode.trim() == "1" {
            self.run(destination, &["send-keys", "-t", destination, "-X", "cancel"])
                .await?;
        }

        self.load_buffer(destination, text).await?;
        self.run(
            destination,
            &["paste-buffer", "-p", "-d", "-b", PASTE_BUFFER, "-t", destination],
        )
        .await?;
        self.run(destination, &["send-keys", "-t", destination, "Enter"])
            .await?;

        info!(destination, bytes = text.len(), "message sent to tmux pane");
        Ok(())
    }

    async fn is_busy(&self, destination: &str) -> Result<bool> {
        let start = format!("-{CAPTURE_LINES}");
        let screen = self
            .run(
                destination,
                &["capture-pane", "-p", "-J", "-t", destination, "-S", &start],
            )
            .await?;
        let busy = screen_shows_busy(&screen, &self.busy_markers);
        debug!(destination, busy, "tmux busy check");
        Ok(busy)
    }
}

/// `true` if any busy marker appears on the captured screen (case-insensitive).
pub fn screen_shows_busy(screen: &str, markers: &[String]) -> bool {
    let lower = screen.to_lowercase();
    markers
        .iter()
        .any(|m| lower.contains(&m.to_lowercase()))
}

/// Map tmux's stderr onto a [`TerminalError`].
fn classify_failure(destination: &str, stderr: &str) -> TerminalError {
    let lower = stderr.to_lowercase();
    if lower.contains("can't find")
        || lower.contains("no such")
        || lower.contains("no server running")
        || lower.contains("session not found")
    {
        TerminalError::NotFound(destination.to_string())
    } else {
        TerminalError::CommandFailed(stderr.trim().to_string())
    }
}
