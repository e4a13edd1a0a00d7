//! Chunk decoding and newline framing.
//!
//! Pipes and container streams deliver arbitrary chunks: a message may be
//! split across reads, and a read may end in the middle of a multi-byte
//! UTF-8 sequence.

/// Accumulates text for one channel and yields complete lines
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; returns true if the buffer now holds a complete line
    pub fn push(&mut self, chunk: &str) -> bool {
        self.buf.push_str(chunk);
        // Only the new chunk can have introduced a newline
        chunk.contains('\n') || self.has_line()
    }

    pub fn has_line(&self) -> bool {
        self.buf.contains('\n')
    }

    /// Remove and return the first complete line, without its terminator
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buf.find('\n')?;
        let mut line: String = self.buf.drain(..=end).collect();
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Remove and return everything buffered, complete lines or not
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.buf)
    }
}

/// Incremental UTF-8 decoder that never splits a character across chunks
///
/// Incomplete trailing sequences are held back until the next chunk;
/// invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is left at end of stream
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
