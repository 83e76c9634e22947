//! Message framing strategies.
//!
//! A framing strategy splits the inbound byte stream into discrete payloads and
//! wraps outbound payloads with the same boundary scheme.
//!
//! ```text
//! newline:         {"id":"1",...}\n
//! length-prefixed: 27\r\n{"id":"1",...}
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Longest accepted length header, digits only (fits any u64).
const MAX_HEADER_LEN: usize = 20;

/// Framing strategy selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One message per line.
    #[default]
    Newline,
    /// `<decimal length>\r\n<payload>`.
    LengthPrefixed,
}

/// Framing failures. Both are fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
}

/// Result of attempting to split one frame off the front of a buffer.
#[derive(Debug, PartialEq)]
pub enum FrameResult {
    /// A complete frame: its payload and the bytes it consumed.
    Complete(Bytes, usize),
    /// Bytes that carry no message (blank lines). Consume and continue.
    Skip(usize),
    /// Need more data.
    Incomplete,
    Error(FrameError),
}

impl Framing {
    /// Try to split one frame from the front of `input`.
    pub fn decode(self, input: &[u8], max_frame_size: usize) -> FrameResult {
        match self {
            Framing::Newline => decode_newline(input, max_frame_size),
            Framing::LengthPrefixed => decode_length_prefixed(input, max_frame_size),
        }
    }

    /// Append `payload` to `out` with this strategy's boundary.
    pub fn encode(self, payload: &[u8], out: &mut BytesMut) {
        match self {
            Framing::Newline => {
                out.reserve(payload.len() + 1);
                out.put_slice(payload);
                out.put_u8(b'\n');
            }
            Framing::LengthPrefixed => {
                let header = format!("{}\r\n", payload.len());
                out.reserve(header.len() + payload.len());
                out.put_slice(header.as_bytes());
                out.put_slice(payload);
            }
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newline" | "default" => Ok(Framing::Newline),
            "length-prefixed" | "length" => Ok(Framing::LengthPrefixed),
            other => Err(format!("unknown framing '{other}'")),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Newline => f.write_str("newline"),
            Framing::LengthPrefixed => f.write_str("length-prefixed"),
        }
    }
}

fn decode_newline(input: &[u8], max_frame_size: usize) -> FrameResult {
    let line_end = match input.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        // A trailing `\r` may still be the first half of the terminator.
        None if input.len() > max_frame_size + usize::from(input.last() == Some(&b'\r')) => {
            return FrameResult::Error(FrameError::TooLarge {
                len: input.len(),
                max: max_frame_size,
            })
        }
        None => return FrameResult::Incomplete,
    };

    let mut line = &input[..line_end];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }

    if line.len() > max_frame_size {
        return FrameResult::Error(FrameError::TooLarge {
            len: line.len(),
            max: max_frame_size,
        });
    }

    if line.iter().all(u8::is_ascii_whitespace) {
        return FrameResult::Skip(line_end + 1);
    }

    FrameResult::Complete(Bytes::copy_from_slice(line), line_end + 1)
}

fn decode_length_prefixed(input: &[u8], max_frame_size: usize) -> FrameResult {
    let header_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER_LEN + 1 => {
            return FrameResult::Error(FrameError::Malformed(
                "length header not terminated".to_string(),
            ))
        }
        None => return FrameResult::Incomplete,
    };

    let header = &input[..header_end];
    if header.is_empty() || header.len() > MAX_HEADER_LEN || !header.iter().all(u8::is_ascii_digit)
    {
        return FrameResult::Error(FrameError::Malformed(format!(
            "invalid length header '{}'",
            String::from_utf8_lossy(header)
        )));
    }

    // All ASCII digits, at most 20 of them; only overflow can fail here.
    let length: usize = match std::str::from_utf8(header).ok().and_then(|s| s.parse().ok()) {
        Some(len) => len,
        None => {
            return FrameResult::Error(FrameError::TooLarge {
                len: usize::MAX,
                max: max_frame_size,
            })
        }
    };

    if length > max_frame_size {
        return FrameResult::Error(FrameError::TooLarge {
            len: length,
            max: max_frame_size,
        });
    }

    let start = header_end + 2;
    if input.len() < start + length {
        return FrameResult::Incomplete;
    }

    FrameResult::Complete(
        Bytes::copy_from_slice(&input[start..start + length]),
        start + length,
    )
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 64;

    #[test]
    fn test_newline_complete() {
        match Framing::Newline.decode(b"{\"a\":1}\nrest", MAX) {
            FrameResult::Complete(frame, consumed) => {
                assert_eq!(&frame[..], b"{\"a\":1}");
                assert_eq!(consumed, 8);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_newline_strips_cr() {
        match Framing::Newline.decode(b"{}\r\n", MAX) {
            FrameResult::Complete(frame, consumed) => {
                assert_eq!(&frame[..], b"{}");
                assert_eq!(consumed, 4);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_newline_blank_line_skipped() {
        assert_eq!(Framing::Newline.decode(b"\r\n{}\n", MAX), FrameResult::Skip(2));
    }

    #[test]
    fn test_newline_incomplete() {
        assert_eq!(Framing::Newline.decode(b"{\"id\"", MAX), FrameResult::Incomplete);
    }

    #[test]
    fn test_newline_too_large_without_terminator() {
        let input = vec![b'x'; MAX + 1];
        assert_eq!(
            Framing::Newline.decode(&input, MAX),
            FrameResult::Error(FrameError::TooLarge {
                len: MAX + 1,
                max: MAX
            })
        );
    }

    #[test]
    fn test_newline_limit_with_split_crlf() {
        let line = vec![b'x'; MAX];

        let mut partial = line.clone();
        partial.push(b'\r');
        assert_eq!(Framing::Newline.decode(&partial, MAX), FrameResult::Incomplete);

        partial.push(b'\n');
        match Framing::Newline.decode(&partial, MAX) {
            FrameResult::Complete(frame, consumed) => {
                assert_eq!(&frame[..], &line[..]);
                assert_eq!(consumed, MAX + 2);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let mut over = line;
        over.extend_from_slice(b"x\r");
        assert_eq!(
            Framing::Newline.decode(&over, MAX),
            FrameResult::Error(FrameError::TooLarge {
                len: MAX + 2,
                max: MAX
            })
        );
    }

    #[test]
    fn test_length_prefixed_complete() {
        match Framing::LengthPrefixed.decode(b"5\r\nhello5\r\n", MAX) {
            FrameResult::Complete(frame, consumed) => {
                assert_eq!(&frame[..], b"hello");
                assert_eq!(consumed, 8);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_length_prefixed_incomplete_payload() {
        assert_eq!(
            Framing::LengthPrefixed.decode(b"10\r\nhello", MAX),
            FrameResult::Incomplete
        );
        assert_eq!(Framing::LengthPrefixed.decode(b"10", MAX), FrameResult::Incomplete);
    }

    #[test]
    fn test_length_prefixed_malformed_header() {
        assert!(matches!(
            Framing::LengthPrefixed.decode(b"abc\r\n", MAX),
            FrameResult::Error(FrameError::Malformed(_))
        ));
        assert!(matches!(
            Framing::LengthPrefixed.decode(&[b'9'; 40], MAX),
            FrameResult::Error(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_length_prefixed_too_large() {
        assert_eq!(
            Framing::LengthPrefixed.decode(b"100\r\n", MAX),
            FrameResult::Error(FrameError::TooLarge { len: 100, max: MAX })
        );
    }

    #[test]
    fn test_encode() {
        let mut out = BytesMut::new();
        Framing::Newline.encode(b"{}", &mut out);
        Framing::LengthPrefixed.encode(b"hello", &mut out);
        assert_eq!(&out[..], b"{}\n5\r\nhello");
    }

    #[test]
    fn test_from_str() {
        assert_eq!("newline".parse::<Framing>(), Ok(Framing::Newline));
        assert_eq!("Length-Prefixed".parse::<Framing>(), Ok(Framing::LengthPrefixed));
        assert!("brute".parse::<Framing>().is_err());
    }
}
