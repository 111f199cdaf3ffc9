//! Incremental parser for the chat response event stream.
//!
//! Chat replies arrive as a framed body: logical records separated by a
//! blank line, each carrying an `event:` type line and a `data:` JSON line.
//! The parser accepts arbitrary byte chunks (records may split anywhere,
//! including mid-line and mid-CRLF) and yields complete records as they
//! close.

use serde_json::Value;
use tracing::debug;

/// One complete record from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    /// Record type, e.g. `message:chunk` or `done`.
    pub event: String,
    /// Parsed `data:` payload, when present and valid JSON.
    pub data: Option<Value>,
}

/// Stateful parser fed from the response byte stream.
///
/// Bytes are buffered raw and only decoded as UTF-8 once a record closes, so
/// a multi-byte character split across network chunks survives intact.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        StreamParser::default()
    }

    /// Feed a chunk of bytes, returning every record completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamRecord> {
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some((start, end)) = find_blank_line(&self.buffer) {
            let block = String::from_utf8_lossy(&self.buffer[..start]).into_owned();
            self.buffer.drain(..end);
            if let Some(record) = parse_record(&block) {
                records.push(record);
            }
        }
        records
    }

    /// Bytes currently buffered without a closing blank line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Locate the first blank-line delimiter, tolerating CRLF.
fn find_blank_line(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find_subslice(buffer, b"\n\n").map(|i| (i, i + 2));
    let crlf = find_subslice(buffer, b"\n\r\n").map(|i| (i, i + 3));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_record(block: &str) -> Option<StreamRecord> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    let event = event?;
    let data = if data_lines.is_empty() {
        None
    } else {
        let raw = data_lines.join("\n");
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Unparsable data line for event '{}': {}", event, e);
                None
            }
        }
    };

    Some(StreamRecord { event, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_record() {
        let mut parser = StreamParser::new();
        let records =
            parser.push(b"event: message:start\ndata: {\"id\":\"m1\"}\n\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "message:start");
        assert_eq!(records[0].data, Some(json!({"id": "m1"})));
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_record_split_across_chunks() {
        let mut parser = StreamParser::new();
        assert!(parser.push(b"event: message:ch").is_empty());
        assert!(parser.push(b"unk\ndata: {\"content\":\"He").is_empty());
        let records = parser.push(b"llo\"}\n\nevent: done\n\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "message:chunk");
        assert_eq!(records[0].data, Some(json!({"content": "Hello"})));
        assert_eq!(records[1].event, "done");
        assert_eq!(records[1].data, None);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let mut parser = StreamParser::new();
        let body = "event: message:chunk\ndata: {\"content\":\"héllo\"}\n\n".as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let (head, tail) = body.split_at(split);

        assert!(parser.push(head).is_empty());
        let records = parser.push(tail);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, Some(json!({"content": "héllo"})));
    }

    #[test]
    fn test_crlf_framing() {
        let mut parser = StreamParser::new();
        let records = parser
            .push(b"event: message:complete\r\ndata: {\"id\":\"m1\",\"content\":\"hi\"}\r\n\r\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "message:complete");
        assert_eq!(
            records[0].data,
            Some(json!({"id": "m1", "content": "hi"}))
        );
    }

    #[test]
    fn test_multiple_records_in_one_chunk() {
        let mut parser = StreamParser::new();
        let body = b"event: tool:started\ndata: {\"name\":\"search\"}\n\n\
event: tool:completed\ndata: {\"name\":\"search\"}\n\n\
event: done\n\n";
        let records = parser.push(body);
        let events: Vec<_> = records.iter().map(|r| r.event.as_str()).collect();
        assert_eq!(events, ["tool:started", "tool:completed", "done"]);
    }

    #[test]
    fn test_record_without_event_line_is_dropped() {
        let mut parser = StreamParser::new();
        let records = parser.push(b"data: {\"orphan\":true}\n\nevent: done\n\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "done");
    }

    #[test]
    fn test_invalid_json_data_yields_none() {
        let mut parser = StreamParser::new();
        let records = parser.push(b"event: message:chunk\ndata: {broken\n\n");
        assert_eq!(records.len(), 1);
        assert!(records[0].data.is_none());
    }
}
