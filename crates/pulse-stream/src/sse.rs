//! # SSE frame decoder
//!
//! Incremental decoder for `text/event-stream` bodies. Bytes are fed as they
//! arrive; complete frames come out as [`DecodedFrame`]s.
//!
//! - Lines end in `\n` or `\r\n` and may be split across chunks
//! - `event:` names the frame, `data:` lines are joined with `\n`
//! - `id:` updates the last event id, `retry:` updates the reconnect hint
//! - Comment lines (`:`) and unknown fields are ignored
//! - A blank line ends the frame; frames without `data` are not delivered
//! - A line longer than the limit is reported once and its frame is dropped
//!
//! Without an `event:` line the payload's `"type"` string is the event name,
//! falling back to `"message"`.

use bytes::BytesMut;
use pulse_core::errors::ParseError;
use pulse_core::events::EventRecord;
use pulse_core::text::truncate_str;
use serde_json::Value;

/// Event name used when a frame carries no discriminator.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// Longest raw frame preview attached to a parse failure.
const RAW_PREVIEW_BYTES: usize = 200;

/// Default longest line the decoder buffers before giving up on it.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedFrame {
    /// A well-formed frame.
    Event(EventRecord),
    /// A frame that could not be decoded.
    Malformed {
        /// What was wrong.
        error: ParseError,
        /// Truncated raw data.
        raw: String,
    },
}

/// Fields accumulated for the frame being read.
#[derive(Default)]
struct PendingFrame {
    event: Option<String>,
    data: Option<String>,
    invalid_utf8: bool,
    /// Part of the frame was discarded; the rest is skipped.
    truncated: bool,
}

/// Incremental SSE decoder.
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Bytes of `buffer` already searched for a newline.
    scanned: usize,
    max_line_bytes: usize,
    /// Dropping the rest of an oversized line.
    discarding: bool,
    frame: PendingFrame,
    last_event_id: Option<String>,
    retry_hint_ms: Option<u64>,
}

impl FrameDecoder {
    /// A decoder with no prior event id.
    pub fn new() -> Self {
        Self::resuming(None)
    }

    /// A decoder continuing after `last_event_id`.
    pub fn resuming(last_event_id: Option<String>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            scanned: 0,
            max_line_bytes: MAX_LINE_BYTES,
            discarding: false,
            frame: PendingFrame::default(),
            last_event_id,
            retry_hint_ms: None,
        }
    }

    /// Override the line length limit.
    #[must_use]
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// The most recent `id:` value seen.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// The most recent `retry:` value seen, in milliseconds.
    pub fn retry_hint_ms(&self) -> Option<u64> {
        self.retry_hint_ms
    }

    /// Append `chunk` and return every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_line_bytes {
                    if !self.discarding {
                        let raw = lossy_preview(&self.buffer);
                        frames.push(self.line_too_long(raw));
                    }
                    self.discarding = true;
                    self.buffer.clear();
                    self.scanned = 0;
                }
                break;
            };
            let newline_pos = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buffer.split_to(newline_pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_line_bytes {
                frames.push(self.line_too_long(lossy_preview(&line)));
                continue;
            }
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.is_empty() {
                if let Some(frame) = self.finish_frame() {
                    frames.push(frame);
                }
                continue;
            }

            match std::str::from_utf8(&line) {
                Ok(text) => {
                    if let Some(frame) = self.process_line(text) {
                        frames.push(frame);
                    }
                }
                Err(_) => self.frame.invalid_utf8 = true,
            }
        }

        frames
    }

    /// Bytes buffered but not yet terminated by a newline.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Report an oversized line and drop the frame it belongs to.
    fn line_too_long(&mut self, raw: String) -> DecodedFrame {
        self.frame = PendingFrame {
            truncated: true,
            ..PendingFrame::default()
        };
        DecodedFrame::Malformed {
            error: ParseError::LineTooLong {
                limit: self.max_line_bytes,
            },
            raw,
        }
    }

    fn process_line(&mut self, line: &str) -> Option<DecodedFrame> {
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.frame.event = Some(value.to_string()),
            "data" => match &mut self.frame.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.frame.data = Some(value.to_string()),
            },
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => match value.parse::<u64>() {
                Ok(ms) => self.retry_hint_ms = Some(ms),
                Err(_) => {
                    return Some(DecodedFrame::Malformed {
                        error: ParseError::InvalidRetry {
                            value: value.to_string(),
                        },
                        raw: truncate_str(line, RAW_PREVIEW_BYTES).to_string(),
                    });
                }
            },
            _ => {}
        }
        None
    }

    fn finish_frame(&mut self) -> Option<DecodedFrame> {
        let frame = std::mem::take(&mut self.frame);
        if frame.truncated {
            return None;
        }

        if frame.invalid_utf8 {
            return Some(DecodedFrame::Malformed {
                error: ParseError::InvalidUtf8,
                raw: frame
                    .data
                    .map(|d| truncate_str(&d, RAW_PREVIEW_BYTES).to_string())
                    .unwrap_or_default(),
            });
        }

        let data = frame.data?;
        let payload = if data.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str::<Value>(&data) {
                Ok(value) => value,
                Err(e) => {
                    return Some(DecodedFrame::Malformed {
                        error: ParseError::InvalidJson {
                            message: e.to_string(),
                        },
                        raw: truncate_str(&data, RAW_PREVIEW_BYTES).to_string(),
                    });
                }
            }
        };

        let name = frame
            .event
            .filter(|e| !e.is_empty())
            .or_else(|| payload.get("type").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string());

        Some(DecodedFrame::Event(EventRecord::server(
            name,
            payload,
            self.last_event_id.clone(),
        )))
    }
}

fn lossy_preview(bytes: &[u8]) -> String {
    let head = &bytes[..bytes.len().min(RAW_PREVIEW_BYTES)];
    truncate_str(&String::from_utf8_lossy(head), RAW_PREVIEW_BYTES).to_string()
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn events(frames: &[DecodedFrame]) -> Vec<(String, Value)> {
        frames
            .iter()
            .filter_map(|f| match f {
                DecodedFrame::Event(r) => Some((r.event_type().to_string(), r.payload().clone())),
                DecodedFrame::Malformed { .. } => None,
            })
            .collect()
    }

    #[test]
    fn named_event_with_json_data() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: token\ndata: {\"text\":\"hi\"}\n\n");
        assert_eq!(events(&frames), vec![("token".into(), json!({"text": "hi"}))]);
    }

    #[test]
    fn discriminator_from_payload_type() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"data: {\"type\":\"progress\",\"pct\":10}\n\n");
        assert_eq!(events(&frames)[0].0, "progress");
    }

    #[test]
    fn falls_back_to_message() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"data: [1,2]\n\n");
        assert_eq!(events(&frames), vec![("message".into(), json!([1, 2]))]);
    }

    #[test]
    fn event_line_wins_over_payload_type() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: done\ndata: {\"type\":\"other\"}\n\n");
        assert_eq!(events(&frames)[0].0, "done");
    }

    #[test]
    fn multiline_data_is_joined() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: stage-update\ndata: {\"stage\":\ndata: \"render\"}\n\n");
        assert_eq!(events(&frames), vec![("stage-update".into(), json!({"stage": "render"}))]);
    }

    #[test]
    fn split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"event: tok").is_empty());
        assert!(decoder.feed(b"en\ndata: {\"par").is_empty());
        assert!(decoder.buffered_len() > 0);
        let frames = decoder.feed(b"tial\":true}\n\n");
        assert_eq!(events(&frames), vec![("token".into(), json!({"partial": true}))]);
    }

    #[test]
    fn multiple_frames_in_one_chunk_keep_order() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(
            b"event: connected\ndata: {}\n\nevent: token\ndata: {}\n\nevent: done\ndata: {}\n\n",
        );
        let names: Vec<String> = events(&frames).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["connected", "token", "done"]);
    }

    #[test]
    fn crlf_line_endings() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: token\r\ndata: {\"cr\":true}\r\n\r\n");
        assert_eq!(events(&frames), vec![("token".into(), json!({"cr": true}))]);
    }

    #[test]
    fn comments_and_unknown_fields_ignored() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b": keep-alive\n\nfoo: bar\nevent: token\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn frame_without_data_is_not_delivered() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"event: ping\n\n").is_empty());
    }

    #[test]
    fn empty_data_is_null_payload() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: ping\ndata:\n\n");
        assert_eq!(events(&frames), vec![("ping".into(), Value::Null)]);
    }

    #[test]
    fn id_is_tracked_and_attached() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"id: 41\nevent: token\ndata: {}\n\n");
        assert_eq!(decoder.last_event_id(), Some("41"));
        assert_matches!(&frames[0], DecodedFrame::Event(r) if r.last_event_id() == Some("41"));
    }

    #[test]
    fn resuming_decoder_keeps_prior_id() {
        let mut decoder = FrameDecoder::resuming(Some("9".into()));
        let frames = decoder.feed(b"data: {}\n\n");
        assert_matches!(&frames[0], DecodedFrame::Event(r) if r.last_event_id() == Some("9"));
    }

    #[test]
    fn retry_sets_hint() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"retry: 2500\n\n").is_empty());
        assert_eq!(decoder.retry_hint_ms(), Some(2500));
    }

    #[test]
    fn invalid_retry_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"retry: soon\n\n");
        assert_matches!(
            &frames[0],
            DecodedFrame::Malformed { error: ParseError::InvalidRetry { value }, .. } if value == "soon"
        );
        assert_eq!(decoder.retry_hint_ms(), None);
    }

    #[test]
    fn invalid_json_is_malformed_and_decoder_recovers() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: token\ndata: {not json\n\nevent: done\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_matches!(
            &frames[0],
            DecodedFrame::Malformed { error: ParseError::InvalidJson { .. }, raw } if raw == "{not json"
        );
        assert_eq!(events(&frames)[0].0, "done");
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"data: \xff\xfe\n\n");
        assert_matches!(&frames[0], DecodedFrame::Malformed { error: ParseError::InvalidUtf8, .. });
    }

    #[test]
    fn raw_preview_is_truncated() {
        let mut decoder = FrameDecoder::new();
        let long = format!("data: {}\n\n", "x".repeat(1000));
        let frames = decoder.feed(long.as_bytes());
        assert_matches!(&frames[0], DecodedFrame::Malformed { raw, .. } if raw.len() == RAW_PREVIEW_BYTES);
    }

    #[test]
    fn unterminated_long_line_is_dropped_once() {
        let mut decoder = FrameDecoder::new().with_max_line_bytes(16);
        let frames = decoder.feed(b"event: token\ndata: {\"text\":\"aaaaaaaa");
        assert_matches!(
            &frames[..],
            [DecodedFrame::Malformed { error: ParseError::LineTooLong { limit: 16 }, .. }]
        );
        assert_eq!(decoder.buffered_len(), 0);

        assert!(decoder.feed(b"aaaaaaaaaaaaaaaaaaaa").is_empty());
        assert_eq!(decoder.buffered_len(), 0);
        assert!(decoder.feed(b"aaaa\"}\n\n").is_empty());

        let frames = decoder.feed(b"event: done\ndata: {}\n\n");
        assert_eq!(events(&frames), vec![("done".into(), json!({}))]);
    }

    #[test]
    fn complete_long_line_drops_its_frame() {
        let mut decoder = FrameDecoder::new().with_max_line_bytes(16);
        let frames = decoder.feed(b"event: token\ndata: {\"text\":\"aaaaaaaaaa\"}\n\nevent: done\ndata: {}\n\n");
        assert_eq!(frames.len(), 2);
        assert_matches!(
            &frames[0],
            DecodedFrame::Malformed { error: ParseError::LineTooLong { .. }, raw } if raw.starts_with("data: ")
        );
        assert_eq!(events(&frames), vec![("done".into(), json!({}))]);
    }

    #[test]
    fn line_split_across_many_chunks_is_kept() {
        let mut decoder = FrameDecoder::new();
        for chunk in [&b"data: {\"te"[..], &b"xt\":"[..], &b"\"slow\""[..], &b"}\n"[..], &b"\n"[..]] {
            let frames = decoder.feed(chunk);
            if chunk == b"\n" {
                assert_eq!(events(&frames), vec![("message".into(), json!({"text": "slow"}))]);
            } else {
                assert!(frames.is_empty());
            }
        }
    }

    #[test]
    fn colliding_reserved_name_stays_server_event() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(b"event: connection-closed\ndata: {}\n\n");
        assert_matches!(&frames[0], DecodedFrame::Event(r) if !r.event_type().is_reserved());
    }
}
