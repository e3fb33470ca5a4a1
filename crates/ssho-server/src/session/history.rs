//! Bounded scrollback log replayed to newly attached viewers.
//!
//! Stores recent PTY output so that a reconnecting viewer can receive a
//! snapshot without the server keeping unbounded history. Truncation is
//! checked *before* an append: once the log has reached its limit, everything
//! but the newest `limit / 2` bytes is discarded and then the new chunk is
//! appended. The log can therefore exceed `limit` by at most one chunk.

/// Default history limit (1 MiB).
pub const DEFAULT_HISTORY_LIMIT: usize = 1024 * 1024;

/// An append-only byte log with a halving truncation policy.
#[derive(Debug)]
pub struct HistoryBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl HistoryBuffer {
    /// Create an empty log bounded to `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Append a chunk of output, truncating first if the limit was reached.
    pub fn append(&mut self, chunk: &[u8]) {
        if self.buf.len() >= self.limit {
            let keep = self.limit / 2;
            let cut = self.buf.len() - keep.min(self.buf.len());
            self.buf.drain(..cut);
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Copy of the current content, oldest byte first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
