//! Line reassembly for chunked transports.
//!
//! HTTP bodies arrive in arbitrary chunks; a chunk may end mid-line or carry
//! several lines at once. [`LineBuffer`] accumulates bytes and hands back
//! complete lines.

/// Upper bound on a single buffered line (1 MiB).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without the
    /// terminator. Invalid UTF-8 is replaced rather than rejected; such lines
    /// simply fail to decode later and are skipped.
    ///
    /// A line longer than [`MAX_LINE_BYTES`] is dropped up to its terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            if !self.discarding {
                self.pending.extend_from_slice(head);
                lines.push(Self::take_line(&mut self.pending));
            }
            self.pending.clear();
            self.discarding = false;
            rest = &tail[1..];
        }

        if !self.discarding {
            self.pending.extend_from_slice(rest);
            if self.pending.len() > MAX_LINE_BYTES {
                self.pending.clear();
                self.discarding = true;
            }
        }

        lines
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let discarding = std::mem::take(&mut self.discarding);
        if discarding || self.pending.is_empty() {
            self.pending.clear();
            return None;
        }
        Some(Self::take_line(&mut self.pending))
    }

    /// Bytes held for an incomplete line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn take_line(pending: &mut Vec<u8>) -> String {
        let bytes = std::mem::take(pending);
        let mut line = String::from_utf8_lossy(&bytes).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}
