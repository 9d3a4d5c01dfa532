//! Wire form of OSC invocations inside a terminal byte stream.
//!
//! An invocation is `ESC ] <id> ; data ; <correlationId> ; <base64Json> BEL`.
//! The scanner also accepts the `ESC \` string terminator.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BytesMut};
use serde_json::Value;

use crate::error::Result;
use crate::osc::payload::DATA_PAYLOAD_TYPE;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
const OSC_INTRODUCER: u8 = b']';
const STRING_TERMINATOR: u8 = b'\\';

/// Unterminated sequences longer than this are passed through as text.
const MAX_SEQUENCE_BYTES: usize = 4 * 1024 * 1024;

/// Build the escape sequence that invokes `channel` with `data`.
pub fn encode_invocation(channel: u32, correlation_id: &str, data: &Value) -> Result<String> {
    let json = serde_json::to_string(data)?;
    Ok(format!(
        "\x1b]{};{};{};{}\x07",
        channel,
        DATA_PAYLOAD_TYPE,
        correlation_id,
        STANDARD.encode(json.as_bytes())
    ))
}

/// A piece of scanned output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    /// Bytes that are not a numeric OSC sequence, unchanged
    Passthrough(Vec<u8>),
    /// A complete numeric OSC sequence; `payload` is the text after `<id>;`
    Invocation { channel: u32, payload: String },
}

/// Splits numeric OSC sequences out of a byte stream.
///
/// Sequences may be split across chunks; incomplete ones are held until the
/// rest arrives.
#[derive(Debug, Default)]
pub struct OscScanner {
    pending: BytesMut,
    /// Channels to extract; everything else stays in the stream
    channels: Option<HashSet<u32>>,
}

enum Step {
    Text(usize),
    Invocation {
        channel: u32,
        payload: (usize, usize),
        consumed: usize,
    },
    NeedMore,
}

impl OscScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only extract sequences for `channels`. Other numeric sequences, such
    /// as window titles on 0 and 2, pass through untouched.
    pub fn for_channels(channels: impl IntoIterator<Item = u32>) -> Self {
        Self {
            pending: BytesMut::new(),
            channels: Some(channels.into_iter().collect()),
        }
    }

    /// Feed a chunk and collect everything that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ScanItem> {
        self.pending.extend_from_slice(chunk);

        let mut items = Vec::new();
        while !self.pending.is_empty() {
            match self.step() {
                Step::Text(len) => {
                    let text = self.pending.split_to(len);
                    push_text(&mut items, &text);
                }
                Step::Invocation {
                    channel,
                    payload: (start, end),
                    consumed,
                } => {
                    let payload = String::from_utf8_lossy(&self.pending[start..end]).into_owned();
                    self.pending.advance(consumed);
                    items.push(ScanItem::Invocation { channel, payload });
                }
                Step::NeedMore => break,
            }
        }
        items
    }

    /// Release whatever is still held at end of stream.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().to_vec())
        }
    }

    fn step(&self) -> Step {
        let buf = &self.pending[..];

        let Some(esc) = buf.iter().position(|&b| b == ESC) else {
            return Step::Text(buf.len());
        };
        if esc > 0 {
            return Step::Text(esc);
        }
        if buf.len() < 2 {
            return Step::NeedMore;
        }
        if buf[1] != OSC_INTRODUCER {
            return Step::Text(1);
        }

        let digits = buf[2..].iter().take_while(|b| b.is_ascii_digit()).count();
        let separator = 2 + digits;
        if separator == buf.len() {
            return self.hold_or_release();
        }
        if digits == 0 || buf[separator] != b';' {
            // Not ours (window title and friends); leave it to the terminal
            return Step::Text(2);
        }

        let body = separator + 1;
        let mut i = body;
        while i < buf.len() {
            match buf[i] {
                BEL => return self.invocation(buf, separator, body, i, i + 1),
                ESC if i + 1 == buf.len() => return self.hold_or_release(),
                ESC if buf[i + 1] == STRING_TERMINATOR => {
                    return self.invocation(buf, separator, body, i, i + 2)
                }
                // A new escape aborts the unterminated sequence
                ESC => return Step::Text(i),
                _ => i += 1,
            }
        }
        self.hold_or_release()
    }

    fn invocation(&self, buf: &[u8], separator: usize, body: usize, end: usize, consumed: usize) -> Step {
        let channel = std::str::from_utf8(&buf[2..separator])
            .ok()
            .and_then(|digits| digits.parse::<u32>().ok())
            .filter(|channel| {
                self.channels
                    .as_ref()
                    .map_or(true, |wanted| wanted.contains(channel))
            });
        match channel {
            Some(channel) => Step::Invocation {
                channel,
                payload: (body, end),
                consumed,
            },
            None => Step::Text(consumed),
        }
    }

    fn hold_or_release(&self) -> Step {
        if self.pending.len() > MAX_SEQUENCE_BYTES {
            Step::Text(self.pending.len())
        } else {
            Step::NeedMore
        }
    }
}

fn push_text(items: &mut Vec<ScanItem>, text: &[u8]) {
    if let Some(ScanItem::Passthrough(last)) = items.last_mut() {
        last.extend_from_slice(text);
    } else {
        items.push(ScanItem::Passthrough(text.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::osc::payload::OscPayload;
    use serde_json::json;

    fn scan_in_chunks(input: &[u8], size: usize) -> Vec<ScanItem> {
        let mut scanner = OscScanner::for_channels([7, 8, 80085]);
        let mut items = Vec::new();
        for chunk in input.chunks(size) {
            for item in scanner.push(chunk) {
                match item {
                    ScanItem::Passthrough(text) => push_text(&mut items, &text),
                    other => items.push(other),
                }
            }
        }
        if let Some(rest) = scanner.finish() {
            push_text(&mut items, &rest);
        }
        items
    }

    #[test]
    fn test_encoded_invocation_parses_back() {
        let data = json!({"html": "<p>héllo</p>"});
        let sequence = encode_invocation(80085, "uid-1", &data).unwrap();
        assert!(sequence.starts_with("\x1b]80085;data;uid-1;"));
        assert!(sequence.ends_with('\x07'));

        let items = OscScanner::new().push(sequence.as_bytes());
        let [ScanItem::Invocation { channel, payload }] = items.as_slice() else {
            panic!("expected one invocation, got {:?}", items);
        };
        assert_eq!(*channel, 80085);
        let parsed = OscPayload::parse(payload).unwrap();
        assert_eq!(parsed.correlation_id, "uid-1");
        assert_eq!(parsed.data, data);
    }

    #[test]
    fn test_chunk_size_does_not_matter() {
        let mut input = b"before ".to_vec();
        input.extend_from_slice(encode_invocation(7, "a", &json!([1, 2])).unwrap().as_bytes());
        input.extend_from_slice(b" middle \x1b]8;data;b;e30=\x1b\\ after");

        let expected = scan_in_chunks(&input, input.len());
        assert_eq!(expected.len(), 5);
        for size in [1, 2, 3, 7] {
            assert_eq!(scan_in_chunks(&input, size), expected, "chunk size {}", size);
        }
        assert_eq!(expected[0], ScanItem::Passthrough(b"before ".to_vec()));
        assert_eq!(
            expected[3],
            ScanItem::Invocation {
                channel: 8,
                payload: "data;b;e30=".to_string()
            }
        );
        assert_eq!(expected[4], ScanItem::Passthrough(b" after".to_vec()));
    }

    #[test]
    fn test_other_escapes_pass_through_unchanged() {
        let input = b"\x1b[31mred\x1b[0m \x1b]0;title\x07 \x1b]2;x\x1b\\ \x1b]9;;\x07".to_vec();
        assert_eq!(
            scan_in_chunks(&input, 3),
            vec![ScanItem::Passthrough(input.clone())]
        );
    }

    #[test]
    fn test_unfiltered_scanner_extracts_any_channel() {
        assert_eq!(
            OscScanner::new().push(b"\x1b]0;title\x07"),
            vec![ScanItem::Invocation {
                channel: 0,
                payload: "title".to_string()
            }]
        );
    }

    #[test]
    fn test_partial_sequence_is_held() {
        let mut scanner = OscScanner::new();
        assert!(scanner.push(b"\x1b]80085;data;abc").is_empty());
        assert_eq!(
            scanner.push(b";e30=\x07tail"),
            vec![
                ScanItem::Invocation {
                    channel: 80085,
                    payload: "data;abc;e30=".to_string()
                },
                ScanItem::Passthrough(b"tail".to_vec()),
            ]
        );
        assert_eq!(scanner.finish(), None);
    }

    #[test]
    fn test_unterminated_sequence_is_released_at_end() {
        let mut scanner = OscScanner::new();
        assert!(scanner.push(b"\x1b]9;data").is_empty());
        assert_eq!(scanner.finish(), Some(b"\x1b]9;data".to_vec()));
    }

    #[test]
    fn test_interrupted_sequence_becomes_text() {
        let items = scan_in_chunks(b"\x1b]9;abc\x1b[0m", 100);
        assert_eq!(items, vec![ScanItem::Passthrough(b"\x1b]9;abc\x1b[0m".to_vec())]);
    }
}
