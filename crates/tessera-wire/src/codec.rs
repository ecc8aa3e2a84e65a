/// Upper bound on a single frame unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const MAX_HEADER_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// `Content-Length: N` header block, blank line, then N bytes of body.
    ContentLength,
    /// One JSON document per `\n`-terminated line.
    Ndjson,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("frame header has no Content-Length")]
    MissingContentLength,
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),
}

/// Incremental decoder for one byte stream.
///
/// The framing mode is fixed by the first non-whitespace byte of the stream:
/// `{` or `[` selects NDJSON, anything else is read as a header block. After an
/// error the stream is out of sync and the connection should be closed.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    mode: Option<FrameMode>,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            mode: None,
            max_frame_bytes,
        }
    }

    pub fn mode(&self) -> Option<FrameMode> {
        self.mode
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame body, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mode = match self.mode {
            Some(mode) => mode,
            None => {
                if !self.skip_whitespace() {
                    return Ok(None);
                }
                let mode = if matches!(self.buf[0], b'{' | b'[') {
                    FrameMode::Ndjson
                } else {
                    FrameMode::ContentLength
                };
                self.mode = Some(mode);
                mode
            }
        };
        match mode {
            FrameMode::Ndjson => self.next_line(),
            FrameMode::ContentLength => self.next_content_length_frame(),
        }
    }

    /// Drops leading whitespace; returns whether any bytes remain.
    fn skip_whitespace(&mut self) -> bool {
        match self.buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => {
                self.buf.drain(..start);
                true
            }
            None => {
                self.buf.clear();
                false
            }
        }
    }

    fn next_line(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > self.max_frame_bytes {
                    return Err(FrameError::TooLarge {
                        len: self.buf.len(),
                        max: self.max_frame_bytes,
                    });
                }
                return Ok(None);
            };
            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.len() > self.max_frame_bytes {
                return Err(FrameError::TooLarge {
                    len: line.len(),
                    max: self.max_frame_bytes,
                });
            }
            return Ok(Some(line));
        }
    }

    fn next_content_length_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if !self.skip_whitespace() {
            return Ok(None);
        }
        let Some((header_len, separator_len)) = find_header_end(&self.buf) else {
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(FrameError::InvalidHeader(format!(
                    "no end of header block within {MAX_HEADER_BYTES} bytes"
                )));
            }
            return Ok(None);
        };

        let header = std::str::from_utf8(&self.buf[..header_len])
            .map_err(|_| FrameError::InvalidHeader("header block is not UTF-8".into()))?;
        let mut content_length = None;
        for line in header.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::InvalidHeader(format!("malformed line `{line}`")))?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|_| {
                    FrameError::InvalidHeader(format!("bad Content-Length `{value}`"))
                })?);
            }
        }
        let len = content_length.ok_or(FrameError::MissingContentLength)?;
        if len > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        let body_start = header_len + separator_len;
        if self.buf.len() < body_start + len {
            return Ok(None);
        }
        let frame = self.buf[body_start..body_start + len].to_vec();
        self.buf.drain(..body_start + len);
        Ok(Some(frame))
    }
}

/// Position and length of the first blank-line separator (`\r\n\r\n` or `\n\n`).
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = find(buf, b"\r\n\r\n").map(|at| (at, 4));
    let lf = find(buf, b"\n\n").map(|at| (at, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub fn encode_frame(mode: FrameMode, payload: &[u8]) -> Vec<u8> {
    match mode {
        FrameMode::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", payload.len());
            let mut out = Vec::with_capacity(header.len() + payload.len());
            out.extend_from_slice(header.as_bytes());
            out.extend_from_slice(payload);
            out
        }
        FrameMode::Ndjson => {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.extend_from_slice(payload);
            out.push(b'\n');
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(String::from_utf8(frame).unwrap());
        }
        frames
    }

    #[test]
    fn detects_ndjson_and_splits_lines() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        decoder.push(b"\n{\"a\":1}\r\n\n{\"b\"");
        assert_eq!(drain(&mut decoder), vec![r#"{"a":1}"#]);
        assert_eq!(decoder.mode(), Some(FrameMode::Ndjson));
        decoder.push(b":2}\n");
        assert_eq!(drain(&mut decoder), vec![r#"{"b":2}"#]);
    }

    #[test]
    fn detects_content_length_across_partial_reads() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        decoder.push(b"content-length: 7\r\nContent-Type: application/json\r\n\r\n{\"a\"");
        assert!(drain(&mut decoder).is_empty());
        assert_eq!(decoder.mode(), Some(FrameMode::ContentLength));
        decoder.push(b":1}Content-Length: 2\n\n[]");
        assert_eq!(drain(&mut decoder), vec![r#"{"a":1}"#, "[]"]);
    }

    #[test]
    fn missing_content_length_is_an_error() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
        decoder.push(b"X-Other: 1\r\n\r\n{}");
        assert_eq!(decoder.next_frame(), Err(FrameError::MissingContentLength));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut decoder = FrameDecoder::new(4);
        decoder.push(b"Content-Length: 10\r\n\r\n");
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { len: 10, max: 4 })
        );

        let mut decoder = FrameDecoder::new(4);
        decoder.push(b"{\"long\":true}");
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn encoded_frames_decode() {
        for mode in [FrameMode::ContentLength, FrameMode::Ndjson] {
            let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);
            decoder.push(&encode_frame(mode, br#"{"x":1}"#));
            assert_eq!(decoder.next_frame().unwrap().unwrap(), br#"{"x":1}"#);
            assert_eq!(decoder.mode(), Some(mode));
        }
    }
}
