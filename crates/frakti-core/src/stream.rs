//! Stream Extractor (C2, spec §4.2): demultiplexes a byte stream carrying
//! interleaved stdout/stderr framed as `[kind:1][reserved:3][len:4 BE][payload]`
//! back into two separate byte vectors, stateful across `extract` calls so a
//! frame header may be split arbitrarily across reads.

use crate::error::{FraktiError, Result};

const HEADER_LEN: usize = 8;

pub const STREAM_STDOUT: u8 = 1;
pub const STREAM_STDERR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadingHeader,
    ReadingBody,
}

/// Output of a single `extract` call: the stdout and stderr bytes decoded
/// from the input chunk, in the order they were framed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractedChunk {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct StreamExtractor {
    tty: bool,
    state: State,
    header_buf: [u8; HEADER_LEN],
    header_filled: usize,
    current_kind: u8,
    remaining: u32,
}

impl StreamExtractor {
    pub fn new(tty: bool) -> Self {
        Self {
            tty,
            state: State::ReadingHeader,
            header_buf: [0u8; HEADER_LEN],
            header_filled: 0,
            current_kind: 0,
            remaining: 0,
        }
    }

    /// TTY mode passes bytes through unchanged as stdout, stderr always empty.
    pub fn extract(&mut self, input: &[u8]) -> Result<ExtractedChunk> {
        if self.tty {
            return Ok(ExtractedChunk {
                stdout: input.to_vec(),
                stderr: Vec::new(),
            });
        }

        let mut out = ExtractedChunk::default();
        let mut buf = input;

        while !buf.is_empty() {
            match self.state {
                State::ReadingHeader => {
                    let need = HEADER_LEN - self.header_filled;
                    let take = need.min(buf.len());
                    self.header_buf[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&buf[..take]);
                    self.header_filled += take;
                    buf = &buf[take..];

                    if self.header_filled == HEADER_LEN {
                        let kind = self.header_buf[0];
                        if kind != STREAM_STDOUT && kind != STREAM_STDERR {
                            return Err(FraktiError::protocol_error(format!(
                                "invalid stream kind byte {kind}"
                            )));
                        }
                        let len = u32::from_be_bytes([
                            self.header_buf[4],
                            self.header_buf[5],
                            self.header_buf[6],
                            self.header_buf[7],
                        ]);
                        self.current_kind = kind;
                        self.remaining = len;
                        self.header_filled = 0;
                        self.state = State::ReadingBody;
                    }
                }
                State::ReadingBody => {
                    let take = (self.remaining as usize).min(buf.len());
                    let chunk = &buf[..take];
                    match self.current_kind {
                        STREAM_STDOUT => out.stdout.extend_from_slice(chunk),
                        STREAM_STDERR => out.stderr.extend_from_slice(chunk),
                        _ => unreachable!("validated when header was parsed"),
                    }
                    self.remaining -= take as u32;
                    buf = &buf[take..];

                    if self.remaining == 0 {
                        self.state = State::ReadingHeader;
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Build a single frame: kind byte, 3 reserved bytes, big-endian u32 length, payload.
pub fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tty_mode_passes_through_as_stdout() {
        let mut ex = StreamExtractor::new(true);
        let out = ex.extract(b"raw bytes").unwrap();
        assert_eq!(out.stdout, b"raw bytes");
        assert!(out.stderr.is_empty());
    }

    #[test]
    fn single_call_decodes_both_frames() {
        let mut input = frame(STREAM_STDOUT, b"hello");
        input.extend(frame(STREAM_STDERR, b"err"));

        let mut ex = StreamExtractor::new(false);
        let out = ex.extract(&input).unwrap();
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.stderr, b"err");
    }

    #[test]
    fn split_across_calls_in_three_byte_chunks() {
        let mut input = frame(STREAM_STDOUT, b"hello");
        input.extend(frame(STREAM_STDERR, b"err"));

        let mut ex = StreamExtractor::new(false);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        for chunk in input.chunks(3) {
            let out = ex.extract(chunk).unwrap();
            stdout.extend(out.stdout);
            stderr.extend(out.stderr);
        }
        assert_eq!(stdout, b"hello");
        assert_eq!(stderr, b"err");
    }

    #[test]
    fn invalid_kind_byte_is_protocol_error() {
        let mut bad = vec![9u8, 0, 0, 0, 0, 0, 0, 1];
        bad.push(b'x');
        let mut ex = StreamExtractor::new(false);
        let err = ex.extract(&bad).unwrap_err();
        assert!(matches!(err, FraktiError::ProtocolError { .. }));
    }

    #[test]
    fn header_split_one_byte_at_a_time() {
        let input = frame(STREAM_STDOUT, b"ab");
        let mut ex = StreamExtractor::new(false);
        let mut stdout = Vec::new();
        for b in &input {
            let out = ex.extract(std::slice::from_ref(b)).unwrap();
            stdout.extend(out.stdout);
        }
        assert_eq!(stdout, b"ab");
    }
}
