use bytes::BytesMut;
use serde::Serialize;
use serde_json::Value;

use crate::frame::FrameError;

/// Wire delimiter terminating every frame on the relay pipe.
pub const FRAME_DELIMITER: &[u8] = b"\r\n";

/// Serialize `value` as one frame: compact JSON followed by [`FRAME_DELIMITER`].
///
/// `serde_json` escapes control characters inside strings and never emits
/// whitespace between tokens in compact mode, so the delimiter cannot appear
/// inside the body.
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FrameError> {
    let mut bytes = serde_json::to_vec(value).map_err(FrameError::Encode)?;
    if find_delimiter(&bytes).is_some() {
        return Err(FrameError::EmbeddedDelimiter);
    }
    bytes.extend_from_slice(FRAME_DELIMITER);
    Ok(bytes)
}

/// Largest frame body the decoder accepts by default.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Incremental decoder turning arbitrary byte chunks into JSON frames.
///
/// Chunks may end anywhere, including mid-frame or inside a multi-byte UTF-8
/// sequence; incomplete bytes stay buffered until the delimiter arrives.
/// A frame longer than the configured maximum is reported once and its
/// bytes are dropped up to the next delimiter.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no delimiter
    scanned: usize,
    max_frame: usize,
    discarding: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_frame,
            discarding: false,
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Append a chunk read from the source.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Decode the next complete frame, if any.
    ///
    /// Whitespace-only frames are skipped. A frame that is not valid JSON is
    /// consumed and reported; the bytes after it stay buffered.
    pub fn next_frame(&mut self) -> Result<Option<Value>, FrameError> {
        loop {
            let Some(pos) = self.scan() else {
                if self.discarding {
                    self.drop_unterminated();
                } else if self.buffer.len() > self.max_frame {
                    let size = self.buffer.len();
                    self.drop_unterminated();
                    self.discarding = true;
                    return Err(FrameError::TooLarge {
                        size,
                        max: self.max_frame,
                    });
                }
                return Ok(None);
            };

            let frame = self.buffer.split_to(pos + FRAME_DELIMITER.len());
            self.scanned = 0;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if pos > self.max_frame {
                return Err(FrameError::TooLarge {
                    size: pos,
                    max: self.max_frame,
                });
            }
            if let Some(value) = parse_frame(&frame[..pos])? {
                return Ok(Some(value));
            }
        }
    }

    /// Decode whatever remains once the source is exhausted.
    ///
    /// A final frame without a trailing delimiter is still accepted.
    pub fn finish(&mut self) -> Result<Option<Value>, FrameError> {
        if let Some(value) = self.next_frame()? {
            return Ok(Some(value));
        }
        let rest = self.buffer.split();
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return Ok(None);
        }
        parse_frame(&rest)
    }

    /// Position of the next delimiter, resuming where the last scan stopped.
    fn scan(&mut self) -> Option<usize> {
        match find_delimiter(&self.buffer[self.scanned..]) {
            Some(offset) => Some(self.scanned + offset),
            None => {
                // A delimiter may straddle the end of the buffer
                self.scanned = self
                    .buffer
                    .len()
                    .saturating_sub(FRAME_DELIMITER.len() - 1);
                None
            }
        }
    }

    /// Drop buffered bytes that cannot start a delimiter.
    fn drop_unterminated(&mut self) {
        let keep = self.buffer.len().min(FRAME_DELIMITER.len() - 1);
        let _ = self.buffer.split_to(self.buffer.len() - keep);
        self.scanned = 0;
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
}

fn parse_frame(bytes: &[u8]) -> Result<Option<Value>, FrameError> {
    let text = std::str::from_utf8(bytes)?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|source| FrameError::Parse {
            frame: text.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_values() -> Vec<Value> {
        vec![
            json!({"type": "ready"}),
            json!({"type": "request", "url": "https://example.test/x", "body": "line1\r\nline2"}),
            json!({"type": "response", "status": 200, "body": "ünïcödé ✓ 🚀"}),
            json!([1, 2, 3]),
            json!("plain string"),
            json!(null),
        ]
    }

    fn encode_all(values: &[Value]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| encode_frame(v).unwrap())
            .collect()
    }

    fn decode_in_chunks(bytes: &[u8], chunk_size: usize) -> Vec<Value> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for chunk in bytes.chunks(chunk_size) {
            decoder.push(chunk);
            while let Some(value) = decoder.next_frame().unwrap() {
                out.push(value);
            }
        }
        if let Some(value) = decoder.finish().unwrap() {
            out.push(value);
        }
        out
    }

    #[test]
    fn test_encoded_frame_ends_with_single_delimiter() {
        let bytes = encode_frame(&json!({"body": "a\r\nb"})).unwrap();
        assert!(bytes.ends_with(FRAME_DELIMITER));
        assert_eq!(find_delimiter(&bytes), Some(bytes.len() - 2));
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_buffer() {
        let values = sample_values();
        let bytes = encode_all(&values);

        let whole = decode_in_chunks(&bytes, bytes.len());
        let single = decode_in_chunks(&bytes, 1);
        let odd = decode_in_chunks(&bytes, 7);

        assert_eq!(whole, values);
        assert_eq!(single, values);
        assert_eq!(odd, values);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"type\":\"re");
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 11);

        decoder.push(b"ady\"}\r");
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.push(b"\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(json!({"type": "ready"})));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_blank_frames_are_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"\r\n   \r\n\t\r\n{\"a\":1}\r\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(json!({"a": 1})));
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_malformed_frame_reports_error_and_keeps_rest() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{not json}\r\n{\"ok\":true}\r\n");

        match decoder.next_frame() {
            Err(FrameError::Parse { frame, .. }) => assert_eq!(frame, "{not json}"),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert_eq!(decoder.next_frame().unwrap(), Some(json!({"ok": true})));
    }

    #[test]
    fn test_finish_accepts_unterminated_tail() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"tail\":1}");
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.finish().unwrap(), Some(json!({"tail": 1})));
        assert!(decoder.finish().unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_is_reported_and_stream_recovers() {
        let mut decoder = FrameDecoder::with_max_frame(16);
        decoder.push(b"{\"big\":\"0123456789abcdef\"}\r\n{\"ok\":1}\r\n");

        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { size: 26, max: 16 })
        ));
        assert_eq!(decoder.next_frame().unwrap(), Some(json!({"ok": 1})));
    }

    #[test]
    fn test_unterminated_oversized_frame_is_dropped_until_delimiter() {
        let mut decoder = FrameDecoder::with_max_frame(8);
        decoder.push(b"{\"big\":\"");
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.push(b"0123456789");
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { size: 18, max: 8 })
        ));
        assert!(decoder.buffered() < FRAME_DELIMITER.len());

        // The rest of the oversized frame never surfaces as a frame of its own
        decoder.push(b"still the same frame\"}\r");
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 1);
        decoder.push(b"\n{\"ok\":2}\r\n");
        assert_eq!(decoder.next_frame().unwrap(), Some(json!({"ok": 2})));
    }

    #[test]
    fn test_scan_resumes_across_small_chunks() {
        let body = format!("{{\"pad\":\"{}\"}}", "x".repeat(64 * 1024));
        let mut decoder = FrameDecoder::new();
        for chunk in body.as_bytes().chunks(3) {
            decoder.push(chunk);
            assert!(decoder.next_frame().unwrap().is_none());
            assert!(decoder.scanned + FRAME_DELIMITER.len() > decoder.buffered());
        }

        // Delimiter split across two pushes
        decoder.push(b"\r");
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.push(b"\n");
        let value = decoder.next_frame().unwrap().unwrap();
        assert_eq!(value["pad"].as_str().map(str::len), Some(64 * 1024));
        assert_eq!(decoder.scanned, 0);
    }
}
