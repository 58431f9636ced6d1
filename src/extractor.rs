use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::Schedule;

/// Name of the JSON field streamed to the user while the model is writing.
pub const RESPONSE_FIELD: &str = "response";

/// Append-only accumulation of stream fragments.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    text: String,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment and returns the buffer length before the append.
    pub fn push(&mut self, fragment: &str) -> usize {
        let prev_len = self.text.len();
        self.text.push_str(fragment);
        prev_len
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorState {
    Searching,
    Emitting,
    Closed,
}

/// Streams the raw contents of one JSON string field out of a token stream
/// that is still being written.
///
/// Emitted slices are taken verbatim from the buffer: escape sequences such
/// as `\"` or `\n` are passed through undecoded.
#[derive(Debug)]
pub struct FieldExtractor {
    buffer: StreamBuffer,
    opening: Regex,
    state: ExtractorState,
    response_start_index: Option<usize>,
    last_emitted_index: usize,
    // A backslash at the end of one fragment escapes the first char of the next.
    escape_pending: bool,
}

impl FieldExtractor {
    pub fn new(field: &str) -> Self {
        let pattern = format!(r#""{}"\s*:\s*""#, regex::escape(field));
        Self {
            buffer: StreamBuffer::new(),
            opening: Regex::new(&pattern).expect("field-opening pattern is a valid regex"),
            state: ExtractorState::Searching,
            response_start_index: None,
            last_emitted_index: 0,
            escape_pending: false,
        }
    }

    pub fn for_response() -> Self {
        Self::new(RESPONSE_FIELD)
    }

    pub fn state(&self) -> ExtractorState {
        self.state
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    /// Appends `fragment` and returns the newly readable part of the field.
    pub fn feed(&mut self, fragment: &str) -> Vec<String> {
        if fragment.is_empty() {
            return Vec::new();
        }
        let prev_len = self.buffer.push(fragment);

        if self.state == ExtractorState::Searching {
            // The opening pattern can straddle fragments, so rescan everything.
            if let Some(found) = self.opening.find(self.buffer.as_str()) {
                let start = found.end();
                debug!(start, "response field opened");
                self.response_start_index = Some(start);
                self.last_emitted_index = start;
                self.state = ExtractorState::Emitting;
            }
        }

        let mut emitted = Vec::new();
        if self.state != ExtractorState::Emitting {
            return emitted;
        }
        let Some(start) = self.response_start_index else {
            return emitted;
        };

        let text = self.buffer.as_str();
        let scan_from = prev_len.max(start);
        let mut close = None;
        // Multi-byte UTF-8 sequences never contain `\` or `"`, so bytes are safe here.
        for (offset, byte) in text.as_bytes()[scan_from..].iter().enumerate() {
            if self.escape_pending {
                self.escape_pending = false;
                continue;
            }
            match byte {
                b'\\' => self.escape_pending = true,
                b'"' => {
                    close = Some(scan_from + offset);
                    break;
                }
                _ => {}
            }
        }

        let end = close.unwrap_or(text.len());
        if end > self.last_emitted_index {
            emitted.push(text[self.last_emitted_index..end].to_string());
            self.last_emitted_index = end;
        }
        if close.is_some() {
            debug!(end, "response field closed");
            self.state = ExtractorState::Closed;
        }
        emitted
    }

    /// Parses the whole buffer once the stream has ended and returns the
    /// calendar payload when the model asked for one.
    pub fn finalize(&self) -> Option<Schedule> {
        let parsed: Value = match serde_json::from_str(self.buffer.as_str()) {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "stream output is not JSON; no structured payload");
                return None;
            }
        };

        if parsed.get("action").and_then(Value::as_str) != Some("generate_ics") {
            return None;
        }
        let ics_data = parsed.get("ics_data")?;
        if !ics_data.as_object().is_some_and(|obj| !obj.is_empty()) {
            return None;
        }

        match serde_json::from_value(ics_data.clone()) {
            Ok(schedule) => Some(schedule),
            Err(err) => {
                warn!(error = %err, "ics_data does not describe a schedule");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(extractor: &mut FieldExtractor, fragments: &[&str]) -> String {
        fragments
            .iter()
            .flat_map(|fragment| extractor.feed(fragment))
            .collect()
    }

    const FULL: &str = r#"{"action": "chat", "response": "Sure \"thing\", see\nyou at 3pm \\ ok", "ics_data": {}}"#;
    const FIELD: &str = r#"Sure \"thing\", see\nyou at 3pm \\ ok"#;

    #[test]
    fn test_output_independent_of_fragmentation() {
        // Every split into two fragments
        for split in 1..FULL.len() {
            let mut extractor = FieldExtractor::for_response();
            let out = feed_all(&mut extractor, &[&FULL[..split], &FULL[split..]]);
            assert_eq!(out, FIELD, "split at {split}");
            assert_eq!(extractor.state(), ExtractorState::Closed);
        }

        // One character at a time
        let mut extractor = FieldExtractor::for_response();
        let chars: Vec<String> = FULL.chars().map(String::from).collect();
        let refs: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(feed_all(&mut extractor, &refs), FIELD);

        // Whole thing at once
        let mut extractor = FieldExtractor::for_response();
        assert_eq!(feed_all(&mut extractor, &[FULL]), FIELD);
    }

    #[test]
    fn test_never_reemits() {
        let mut extractor = FieldExtractor::for_response();
        assert!(extractor.feed(r#"{"response": "#).is_empty());
        assert!(extractor.feed(r#"""#).is_empty());
        assert_eq!(extractor.feed("Hel"), vec!["Hel"]);
        assert_eq!(extractor.feed("lo"), vec!["lo"]);
        assert_eq!(extractor.feed(r#"", "x": "y"}"#), Vec::<String>::new());
        assert_eq!(extractor.state(), ExtractorState::Closed);
        assert!(extractor.feed(r#"more "response": "again""#).is_empty());
    }

    #[test]
    fn test_escaped_quote_does_not_terminate() {
        let mut extractor = FieldExtractor::for_response();
        let out = feed_all(&mut extractor, &[r#""response": "a\"b"#]);
        assert_eq!(out, r#"a\"b"#);
        assert_eq!(extractor.state(), ExtractorState::Emitting);
    }

    #[test]
    fn test_plain_quote_terminates() {
        let mut extractor = FieldExtractor::for_response();
        let out = feed_all(&mut extractor, &[r#""response": "a", "action": "chat"}"#]);
        assert_eq!(out, "a");
        assert_eq!(extractor.state(), ExtractorState::Closed);
    }

    #[test]
    fn test_escaped_backslash_then_terminator() {
        let mut extractor = FieldExtractor::for_response();
        let out = feed_all(&mut extractor, &[r#""response": "a\\" , "b": "c""#]);
        assert_eq!(out, r#"a\\"#);
        assert_eq!(extractor.state(), ExtractorState::Closed);
    }

    #[test]
    fn test_backslash_at_fragment_boundary() {
        let mut extractor = FieldExtractor::for_response();
        let out = feed_all(&mut extractor, &[r#""response": "say \"#, r#""hi\"" }"#]);
        assert_eq!(out, r#"say \"hi\""#);
        assert_eq!(extractor.state(), ExtractorState::Closed);
    }

    #[test]
    fn test_escapes_are_not_decoded() {
        let mut extractor = FieldExtractor::for_response();
        let out = feed_all(&mut extractor, &[r#"{"response": "line1\nline2é"}"#]);
        assert_eq!(out, r"line1\nline2é");
    }

    #[test]
    fn test_opening_pattern_allows_whitespace() {
        let mut extractor = FieldExtractor::for_response();
        let out = feed_all(&mut extractor, &["{\"response\"\n  :\t \"ok\"}"]);
        assert_eq!(out, "ok");
    }

    #[test]
    fn test_missing_field_emits_nothing() {
        let mut extractor = FieldExtractor::for_response();
        let out = feed_all(&mut extractor, &["Just some ", "plain text reply"]);
        assert!(out.is_empty());
        assert_eq!(extractor.state(), ExtractorState::Searching);
        assert!(extractor.finalize().is_none());
    }

    #[test]
    fn test_multibyte_content() {
        let mut extractor = FieldExtractor::for_response();
        let out = feed_all(&mut extractor, &[r#"{"response": "café "#, r#"日本語"}"#]);
        assert_eq!(out, "café 日本語");
    }

    #[test]
    fn test_finalize_invalid_json_is_silent() {
        let mut extractor = FieldExtractor::for_response();
        extractor.feed(r#"{"action": "generate_ics", "response": "half"#);
        assert!(extractor.finalize().is_none());
        // Calling again changes nothing
        assert!(extractor.finalize().is_none());
    }

    #[test]
    fn test_finalize_returns_schedule() {
        let mut extractor = FieldExtractor::for_response();
        extractor.feed(
            r#"{"action": "generate_ics", "response": "Done!", "ics_data": {"course_name": "Custom Schedule", "course_code": "CUSTOM", "events": [{"title": "Dentist", "start_time": "2025-09-12T15:00:00", "end_time": "2025-09-12T16:00:00"}]}}"#,
        );
        let schedule = extractor.finalize().expect("schedule payload");
        assert_eq!(schedule.course_code.as_deref(), Some("CUSTOM"));
        assert_eq!(schedule.events.len(), 1);
        assert_eq!(schedule.events[0].title, "Dentist");
    }

    #[test]
    fn test_finalize_requires_generate_action_and_data() {
        let mut chat = FieldExtractor::for_response();
        chat.feed(r#"{"action": "chat", "response": "hi", "ics_data": {"events": []}}"#);
        assert!(chat.finalize().is_none());

        let mut empty = FieldExtractor::for_response();
        empty.feed(r#"{"action": "generate_ics", "response": "hi", "ics_data": {}}"#);
        assert!(empty.finalize().is_none());
    }

    #[test]
    fn test_stream_buffer_push_reports_previous_length() {
        let mut buffer = StreamBuffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.push("abc"), 0);
        assert_eq!(buffer.push("de"), 3);
        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.as_str(), "abcde");
    }
}
