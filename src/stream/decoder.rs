//! Incremental UTF-8 decoding and newline framing for the runtime byte stream.
//!
//! Chunks arrive at arbitrary byte boundaries. Partial multi-byte sequences
//! are carried over to the next chunk, invalid sequences decode to U+FFFD, and
//! only complete lines are handed out; the trailing partial line stays
//! buffered until more bytes (or the final flush) arrive.

use memchr::memchr_iter;

const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;

/// Stateful byte-to-line decoder for one upstream response.
#[derive(Debug, Default)]
pub struct LineDecoder {
    remainder: Vec<u8>,
    buffer: String,
    read_offset: usize,
}

impl LineDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk into text, holding back an incomplete trailing sequence.
    ///
    /// The returned text is not line-framed; [`LineDecoder::feed_into`] is the
    /// framing entry point.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len());
        self.decode_into(bytes, &mut out);
        out
    }

    /// Final flush: returns whatever the decoder still holds back.
    ///
    /// An incomplete sequence at end of input becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.remainder.is_empty() {
            return String::new();
        }
        let residue = String::from_utf8_lossy(&self.remainder).into_owned();
        self.remainder.clear();
        residue
    }

    /// Decode a chunk and append every complete, non-blank line to `lines`.
    pub fn feed_into(&mut self, bytes: &[u8], lines: &mut Vec<String>) {
        let mut buffer = std::mem::take(&mut self.buffer);
        self.decode_into(bytes, &mut buffer);
        self.buffer = buffer;
        self.split_lines(lines);
    }

    /// Flush the decoder and emit the trailing buffered line, if any.
    pub fn finish_into(&mut self, lines: &mut Vec<String>) {
        let residue = self.finish();
        self.buffer.push_str(&residue);
        self.split_lines(lines);

        let tail = self.buffer[self.read_offset..].trim();
        if !tail.is_empty() {
            lines.push(tail.to_string());
        }
        self.buffer.clear();
        self.read_offset = 0;
    }

    /// Bytes of text (plus undecoded bytes) waiting for a line terminator.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.read_offset + self.remainder.len()
    }

    fn decode_into(&mut self, bytes: &[u8], out: &mut String) {
        if self.remainder.is_empty() {
            decode_lossy_into(bytes, &mut self.remainder, out);
        } else {
            let mut joined = std::mem::take(&mut self.remainder);
            joined.extend_from_slice(bytes);
            decode_lossy_into(&joined, &mut self.remainder, out);
        }
    }

    fn split_lines(&mut self, lines: &mut Vec<String>) {
        let mut processed_up_to = self.read_offset;
        let scan_start = processed_up_to;
        let bytes = self.buffer.as_bytes();
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = self.buffer[processed_up_to..line_end].trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

/// Decode `input` with replacement semantics. A truncated sequence at the end
/// is moved into `remainder` instead of being replaced.
fn decode_lossy_into(mut input: &[u8], remainder: &mut Vec<u8>, out: &mut String) {
    loop {
        match std::str::from_utf8(input) {
            Ok(text) => {
                out.push_str(text);
                return;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                out.push_str(unsafe { std::str::from_utf8_unchecked(&input[..valid_up_to]) });
                match err.error_len() {
                    Some(invalid_len) => {
                        out.push(REPLACEMENT);
                        input = &input[valid_up_to + invalid_len..];
                    }
                    None => {
                        remainder.extend_from_slice(&input[valid_up_to..]);
                        return;
                    }
                }
            }
        }
    }
}
