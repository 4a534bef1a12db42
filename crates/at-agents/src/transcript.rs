//! Parsing of agent session transcripts.
//!
//! A transcript is a JSONL file: one JSON object per line, appended as the
//! session runs. Only `user` and `assistant` entries matter for activity
//! detection; summaries, system notices and anything unparseable are skipped.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes read from the end of a transcript before falling back to the whole
/// file. Transcripts grow without bound; the last entry is almost always in
/// the tail.
const TAIL_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    Other(String),
}

impl StopReason {
    fn parse(raw: &str) -> Self {
        match raw {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            other => StopReason::Other(other.to_string()),
        }
    }
}

/// The last conversational entry of a transcript, reduced to what the
/// classifier needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub kind: EntryKind,
    pub stop_reason: Option<StopReason>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Text of the last text block, if the entry has one.
    pub last_text: Option<String>,
}

impl TranscriptEntry {
    /// Age of the entry by its own timestamp, or `fallback` (usually the
    /// file age) when it has none. Future timestamps count as zero.
    pub fn age(&self, now: DateTime<Utc>, fallback: Duration) -> Duration {
        match self.timestamp {
            Some(ts) => (now - ts).to_std().unwrap_or(Duration::ZERO),
            None => fallback,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    content: Value,
}

/// Text of the last `text` block. Content is either a bare string or a list
/// of typed blocks; blocks of any other shape are ignored.
fn last_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => blocks.iter().rev().find_map(|block| {
            if block.get("type").and_then(Value::as_str) != Some("text") {
                return None;
            }
            block.get("text").and_then(Value::as_str).map(str::to_string)
        }),
        _ => None,
    }
}

/// Parse one transcript line. Returns `None` for malformed JSON and for
/// entries that are neither `user` nor `assistant`.
pub fn parse_line(line: &str) -> Option<TranscriptEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: RawLine = serde_json::from_str(line).ok()?;
    let kind = match raw.kind.as_str() {
        "user" => EntryKind::User,
        "assistant" => EntryKind::Assistant,
        _ => return None,
    };

    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc));

    let (stop_reason, last_text) = match raw.message {
        Some(message) => (
            message.stop_reason.as_deref().map(StopReason::parse),
            last_text(&message.content),
        ),
        None => (None, None),
    };

    Some(TranscriptEntry {
        kind,
        stop_reason,
        timestamp,
        last_text,
    })
}

/// Find the last `user`/`assistant` entry in transcript text.
///
/// Lines are scanned from the end, so a truncated final line or trailing
/// garbage simply falls through to the previous valid entry.
pub fn last_entry(text: &str) -> Option<TranscriptEntry> {
    text.lines().rev().find_map(parse_line)
}

/// Read a transcript file and return its last conversational entry.
///
/// Only the tail of the file is read first; if the tail holds no usable
/// entry (one huge line, for instance) the whole file is read.
pub async fn read_last_entry(path: &Path) -> std::io::Result<Option<TranscriptEntry>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    if len > TAIL_BYTES {
        let offset = len - TAIL_BYTES;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(TAIL_BYTES as usize);
        file.read_to_end(&mut buf).await?;
        let tail = String::from_utf8_lossy(&buf);
        // The first line of the tail is almost certainly cut in half.
        let tail = tail.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        if let Some(entry) = last_entry(tail) {
            return Ok(Some(entry));
        }
        file.seek(SeekFrom::Start(0)).await?;
    }

    let mut buf = Vec::with_capacity(len as usize);
    file.read_to_end(&mut buf).await?;
    Ok(last_entry(&String::from_utf8_lossy(&buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_entry_with_blocks() {
        let line = r#"{"type":"assistant","timestamp":"2026-01-05T10:00:00.000Z","message":{"stop_reason":"end_turn","content":[{"type":"thinking","thinking":"hm"},{"type":"text","text":"first"},{"type":"tool_use","id":"t1","name":"Bash","input":{}},{"type":"text","text":"Shall I continue?"}]}}"#;
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.kind, EntryKind::Assistant);
        assert_eq!(entry.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(entry.last_text.as_deref(), Some("Shall I continue?"));
        assert!(entry.timestamp.is_some());
    }

    #[test]
    fn user_entry_with_plain_string_content() {
        let line = r#"{"type":"user","message":{"role":"user","content":"fix the tests"}}"#;
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.kind, EntryKind::User);
        assert_eq!(entry.stop_reason, None);
        assert_eq!(entry.last_text.as_deref(), Some("fix the tests"));
        assert_eq!(entry.timestamp, None);
    }

    #[test]
    fn null_stop_reason_is_none() {
        let line = r#"{"type":"assistant","message":{"stop_reason":null,"content":[]}}"#;
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.stop_reason, None);
        assert_eq!(entry.last_text, None);
    }

    #[test]
    fn unknown_stop_reason_is_kept() {
        let line = r#"{"type":"assistant","message":{"stop_reason":"max_tokens"}}"#;
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.stop_reason, Some(StopReason::Other("max_tokens".into())));
    }

    #[test]
    fn age_prefers_entry_timestamp() {
        let line = r#"{"type":"user","timestamp":"2026-01-05T10:00:00Z","message":{"content":"hi"}}"#;
        let entry = parse_line(line).unwrap();
        let now = DateTime::parse_from_rfc3339("2026-01-05T10:06:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let fallback = Duration::from_secs(7);
        assert_eq!(entry.age(now, fallback), Duration::from_secs(360));

        let early = DateTime::parse_from_rfc3339("2026-01-05T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(entry.age(early, fallback), Duration::ZERO);

        let untimed = parse_line(r#"{"type":"user","message":{"content":"hi"}}"#).unwrap();
        assert_eq!(untimed.age(now, fallback), fallback);
    }

    #[test]
    fn non_conversation_entries_are_skipped() {
        assert!(parse_line(r#"{"type":"summary","summary":"x"}"#).is_none());
        assert!(parse_line(r#"{"type":"system","content":"x"}"#).is_none());
        assert!(parse_line("not json").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn last_entry_skips_truncated_tail() {
        let text = concat!(
            r#"{"type":"user","message":{"content":"go"}}"#,
            "\n",
            r#"{"type":"assistant","message":{"stop_reason":"tool_use","content":[]}}"#,
            "\n",
            r#"{"type":"summary","summary":"s"}"#,
            "\n",
            r#"{"type":"assistant","message":{"stop_re"#,
        );
        let entry = last_entry(text).unwrap();
        assert_eq!(entry.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn last_entry_of_empty_text_is_none() {
        assert!(last_entry("").is_none());
        assert!(last_entry("\n\n{\"type\":\"summary\"}\n").is_none());
    }

    #[tokio::test]
    async fn read_last_entry_handles_large_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.jsonl");

        let filler = format!(
            "{{\"type\":\"user\",\"message\":{{\"content\":\"{}\"}}}}\n",
            "x".repeat(1024)
        );
        let mut text = filler.repeat(400);
        text.push_str(r#"{"type":"assistant","message":{"stop_reason":"end_turn","content":[{"type":"text","text":"done"}]}}"#);
        text.push('\n');
        std::fs::write(&path, text).unwrap();

        let entry = read_last_entry(&path).await.unwrap().unwrap();
        assert_eq!(entry.kind, EntryKind::Assistant);
        assert_eq!(entry.last_text.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn read_last_entry_falls_back_to_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one-huge-line.jsonl");

        let mut text = String::from(r#"{"type":"user","message":{"content":"start"}}"#);
        text.push('\n');
        // A single entry longer than the tail window.
        text.push_str(&format!(
            "{{\"type\":\"assistant\",\"message\":{{\"stop_reason\":\"tool_use\",\"content\":[{{\"type\":\"text\",\"text\":\"{}\"}}]}}}}\n",
            "y".repeat(300 * 1024)
        ));
        std::fs::write(&path, text).unwrap();

        let entry = read_last_entry(&path).await.unwrap().unwrap();
        assert_eq!(entry.stop_reason, Some(StopReason::ToolUse));
    }
}
