//! JSONL transcript reading
//!
//! Session transcripts are append-only JSONL files. The first line carries
//! the session header (with its id); message lines hold a `message` object.
//! Readers are bounded: the header scan looks at the first 4 KiB, the tail
//! scan at the last 16 KiB / 20 lines.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

const HEADER_MAX_BYTES: usize = 4096;
const LAST_MSG_MAX_BYTES: u64 = 16_384;
const LAST_MSG_MAX_LINES: usize = 20;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptMessage {
    pub role: Option<String>,
    pub content: Option<Value>,
    pub timestamp: Option<Value>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptLine {
    #[serde(rename = "type")]
    pub line_type: Option<String>,
    pub id: Option<String>,
    pub timestamp: Option<Value>,
    pub message: Option<TranscriptMessage>,
}

/// First parseable JSON line within the head of the file.
pub fn read_first_json_line(path: &Path) -> Option<TranscriptLine> {
    let file = File::open(path).ok()?;
    let mut buf = vec![0u8; HEADER_MAX_BYTES];
    let mut reader = BufReader::new(file);
    let read = reader.read(&mut buf).ok()?;
    if read == 0 {
        return None;
    }
    let chunk = String::from_utf8_lossy(&buf[..read]);
    chunk
        .lines()
        .filter(|line| !line.trim().is_empty())
        .find_map(|line| serde_json::from_str(line).ok())
}

/// Latest line carrying a message, scanning the bounded tail backwards.
pub fn read_last_message_line(path: &Path) -> Option<TranscriptLine> {
    let mut file = File::open(path).ok()?;
    let size = file.metadata().ok()?.len();
    if size == 0 {
        return None;
    }
    let start = size.saturating_sub(LAST_MSG_MAX_BYTES);
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut bytes = Vec::new();
    file.take(LAST_MSG_MAX_BYTES).read_to_end(&mut bytes).ok()?;
    // The window may start mid-character; lossy decode keeps later lines intact.
    let chunk = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = chunk.lines().filter(|line| !line.trim().is_empty()).collect();
    lines
        .iter()
        .rev()
        .take(LAST_MSG_MAX_LINES)
        .find_map(|line| {
            serde_json::from_str::<TranscriptLine>(line)
                .ok()
                .filter(|parsed| parsed.message.is_some())
        })
}

/// Full scan for the message whose entry id (message id or line id) matches.
pub fn read_message_by_entry_id(path: &Path, entry_id: &str) -> Option<TranscriptLine> {
    let file = File::open(path).ok()?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line.ok()?;
        if line.trim().is_empty() {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<TranscriptLine>(&line) else {
            continue;
        };
        if parsed.message.is_none() {
            continue;
        }
        let line_id = parsed
            .message
            .as_ref()
            .and_then(|m| m.id.as_deref())
            .or(parsed.id.as_deref());
        if line_id == Some(entry_id) {
            return Some(parsed);
        }
    }
    None
}

/// Trimmed text from string content or the first text-bearing part.
pub fn extract_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Array(parts) => parts.iter().find_map(|part| {
            let text = part.get("text")?.as_str()?;
            let part_type = part.get("type").and_then(Value::as_str).unwrap_or("");
            if matches!(part_type, "text" | "output_text" | "input_text" | "") {
                let trimmed = text.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            } else {
                None
            }
        }),
        _ => None,
    }
}

/// Epoch milliseconds from a numeric or RFC 3339 timestamp value.
pub fn coerce_timestamp(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(|f| f.floor() as i64),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

/// Entry id for a message line: the message id, the line id, or a
/// `<sessionId>:<timestamp>` fallback.
pub fn resolve_entry_id(session_id: &str, line: &TranscriptLine, timestamp: i64) -> String {
    let explicit = line
        .message
        .as_ref()
        .and_then(|m| m.id.as_deref())
        .or(line.id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty());
    match explicit {
        Some(id) => id.to_string(),
        None => format!("{session_id}:{timestamp}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_transcript(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn header_and_tail_parsing() {
        let file = write_transcript(&[
            r#"{"type":"session","id":"sid-42"}"#,
            "not json",
            r#"{"type":"message","id":"m1","message":{"role":"user","content":"hello"}}"#,
            r#"{"type":"message","id":"m2","message":{"role":"assistant","content":"hi there"}}"#,
        ]);
        let header = read_first_json_line(file.path()).unwrap();
        assert_eq!(header.id.as_deref(), Some("sid-42"));
        let last = read_last_message_line(file.path()).unwrap();
        assert_eq!(last.id.as_deref(), Some("m2"));
        assert_eq!(
            extract_text(last.message.unwrap().content.as_ref()).as_deref(),
            Some("hi there")
        );
    }

    #[test]
    fn lookup_by_entry_id() {
        let file = write_transcript(&[
            r#"{"type":"session","id":"sid"}"#,
            r#"{"type":"message","id":"m1","message":{"role":"user","content":"first"}}"#,
            r#"{"type":"message","id":"m2","message":{"role":"user","content":"second"}}"#,
        ]);
        let line = read_message_by_entry_id(file.path(), "m1").unwrap();
        assert_eq!(
            extract_text(line.message.unwrap().content.as_ref()).as_deref(),
            Some("first")
        );
        assert!(read_message_by_entry_id(file.path(), "m9").is_none());
    }

    #[test]
    fn text_extraction_from_parts() {
        let parts = json!([
            { "type": "tool_use", "text": "ignored" },
            { "type": "output_text", "text": "  answer  " }
        ]);
        assert_eq!(extract_text(Some(&parts)).as_deref(), Some("answer"));
        assert!(extract_text(Some(&json!("   "))).is_none());
        assert!(extract_text(Some(&json!(7))).is_none());
    }

    #[test]
    fn timestamp_coercion() {
        assert_eq!(coerce_timestamp(Some(&json!(1700.9))), Some(1700));
        assert_eq!(
            coerce_timestamp(Some(&json!("1970-01-01T00:00:01Z"))),
            Some(1000)
        );
        assert!(coerce_timestamp(Some(&json!("not a date"))).is_none());
    }

    #[test]
    fn entry_id_fallback() {
        let line = TranscriptLine::default();
        assert_eq!(resolve_entry_id("sid", &line, 123), "sid:123");
        let line = TranscriptLine {
            id: Some("line-1".into()),
            ..TranscriptLine::default()
        };
        assert_eq!(resolve_entry_id("sid", &line, 123), "line-1");
    }
}
