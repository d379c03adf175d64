//! Decoder for the Docker multiplexed stream format.
//!
//! A non-TTY attach or log stream interleaves stdout and stderr as frames:
//!
//! ```text
//! [tag][0][0][0][len: u32 big-endian][payload; len bytes]
//! ```
//!
//! `tag` is `1` for stdout and `2` for stderr. Anything else means the bytes
//! are not framed (TTY sessions, or input that was already split upstream),
//! in which case the remainder is passed through untouched.

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

/// One complete multiplexed record borrowed from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFrame<'a> {
    pub stream: StreamKind,
    pub payload: &'a [u8],
}

impl LogFrame<'_> {
    /// Header plus payload length.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Parses the frame at the start of `buf`.
///
/// Returns `None` when fewer than [`HEADER_LEN`] bytes remain, the tag is not
/// a stream tag, or the declared payload runs past the end of the buffer.
pub fn next_frame(buf: &[u8]) -> Option<LogFrame<'_>> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let stream = StreamKind::from_tag(buf[0])?;
    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let end = HEADER_LEN.checked_add(len)?;
    let payload = buf.get(HEADER_LEN..end)?;
    Some(LogFrame { stream, payload })
}

/// Strips frame headers from `buf`, concatenating payloads in order.
///
/// Once a position is reached that does not hold a complete frame, every
/// remaining byte is appended verbatim and decoding stops. Partial frames
/// therefore still surface as output instead of being dropped.
pub fn demux(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    let mut cursor = 0;
    while cursor < buf.len() {
        match next_frame(&buf[cursor..]) {
            Some(frame) => {
                out.extend_from_slice(frame.payload);
                cursor += frame.encoded_len();
            }
            None => {
                out.extend_from_slice(&buf[cursor..]);
                break;
            }
        }
    }
    out
}

/// Cleans one newline-delimited log line.
///
/// Lines longer than a header that start with a stream tag lose their first
/// eight bytes; the rest is trimmed of surrounding whitespace either way.
pub fn clean_log_line(line: &[u8]) -> String {
    let body = if line.len() > HEADER_LEN && StreamKind::from_tag(line[0]).is_some() {
        &line[HEADER_LEN..]
    } else {
        line
    };
    String::from_utf8_lossy(body).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn single_stdout_frame() {
        let buf = frame(1, b"hello");
        assert_eq!(demux(&buf), b"hello");
    }

    #[test]
    fn frames_then_trailing_bytes_keep_order() {
        let mut buf = frame(1, b"out ");
        buf.extend(frame(2, b"err "));
        buf.extend(frame(1, b""));
        buf.extend_from_slice(b"tail");
        assert_eq!(demux(&buf), b"out err tail");
    }

    #[test]
    fn truncated_payload_is_emitted_verbatim() {
        let mut buf = frame(1, b"ok");
        let mut partial = frame(2, b"truncated");
        partial.truncate(HEADER_LEN + 3);
        buf.extend_from_slice(&partial);

        let mut expected = b"ok".to_vec();
        expected.extend_from_slice(&partial);
        assert_eq!(demux(&buf), expected);
    }

    #[test]
    fn unframed_input_passes_through() {
        assert_eq!(demux(b"plain tty output\r\n"), b"plain tty output\r\n");
        assert_eq!(demux(b"\x01short"), b"\x01short");
        assert!(demux(b"").is_empty());
    }

    #[test]
    fn oversized_length_does_not_panic() {
        let buf = [2u8, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, b'x'];
        assert_eq!(demux(&buf), buf.to_vec());
    }

    #[test]
    fn next_frame_reports_stream_kind() {
        let buf = frame(2, b"boom");
        let parsed = next_frame(&buf).expect("frame");
        assert_eq!(parsed.stream, StreamKind::Stderr);
        assert_eq!(parsed.payload, b"boom");
        assert_eq!(parsed.encoded_len(), buf.len());
    }

    #[test]
    fn log_line_header_is_stripped_and_trimmed() {
        let line = frame(1, b"2024-01-01T00:00:00Z started  \r");
        assert_eq!(clean_log_line(&line), "2024-01-01T00:00:00Z started");
        assert_eq!(clean_log_line(b"  already clean \n"), "already clean");
    }
}
