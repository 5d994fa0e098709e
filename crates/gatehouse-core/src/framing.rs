//! TCP framing codec (component I): 4-byte big-endian length prefix
//! followed by exactly that many payload bytes.
//!
//! `extract` must copy the payload into a separate buffer *before* shifting
//! the read buffer's trailing bytes down to offset 0 — returning a pointer
//! into the sliding buffer would alias with the subsequent `memmove`. This
//! is a correctness requirement, not a style choice (spec §4.2).

use crate::error::FrameError;

/// Default read/write buffer size: 4-byte header + up to 64 KiB - 4 payload.
pub const DEFAULT_BUFSZ: usize = 65_540;

/// Result of a single [`ReadState::extract`] call.
pub enum FrameResult<'a> {
    /// A complete frame's payload, valid until the next `extract` call.
    Ready(&'a [u8]),
    /// Not enough bytes buffered yet for a complete frame.
    NeedMore,
    /// The header was malformed (zero length or over `max_payload`). The
    /// caller must disconnect the client; `ReadState` has already reset
    /// itself.
    Error(FrameError),
}

/// Per-connection read-side framing state.
pub struct ReadState {
    buffer: Vec<u8>,
    pos: usize,
    max_payload: usize,
    /// Scratch buffer the extracted payload is copied into, so the caller's
    /// borrow does not alias the subsequent `memmove` of `buffer`.
    extract_buf: Vec<u8>,
}

impl ReadState {
    pub fn new(bufsz: usize, max_payload: usize) -> Self {
        Self {
            buffer: vec![0u8; bufsz],
            pos: 0,
            max_payload,
            extract_buf: Vec::with_capacity(max_payload.min(bufsz)),
        }
    }

    /// Copy up to `data.len()` bytes into the buffer's free space; returns
    /// the number of bytes actually accepted (may be less than `data.len()`
    /// if the buffer is nearly full).
    pub fn append(&mut self, data: &[u8]) -> usize {
        let free = self.buffer.len() - self.pos;
        let n = data.len().min(free);
        self.buffer[self.pos..self.pos + n].copy_from_slice(&data[..n]);
        self.pos += n;
        n
    }

    /// Attempt to extract one complete frame. Call repeatedly until
    /// `NeedMore` to drain every frame currently buffered.
    pub fn extract(&mut self) -> FrameResult<'_> {
        if self.pos < 4 {
            return FrameResult::NeedMore;
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]);
        if len == 0 {
            self.reset();
            return FrameResult::Error(FrameError::ZeroLength);
        }
        if len as usize > self.max_payload {
            self.reset();
            return FrameResult::Error(FrameError::Oversize { declared: len, max: self.max_payload as u32 });
        }
        let total = 4 + len as usize;
        if self.pos < total {
            return FrameResult::NeedMore;
        }

        // Copy payload out before the memmove shifts it.
        self.extract_buf.clear();
        self.extract_buf.extend_from_slice(&self.buffer[4..total]);

        let remaining = self.pos - total;
        self.buffer.copy_within(total..self.pos, 0);
        self.pos = remaining;

        FrameResult::Ready(&self.extract_buf)
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    pub fn free_space(&self) -> usize {
        self.buffer.len() - self.pos
    }
}

/// Per-connection write-side framing state: a pending frame plus how much
/// of it has been written to the socket so far.
pub struct WriteState {
    buffer: Vec<u8>,
    total: usize,
    written: usize,
}

impl WriteState {
    pub fn new(bufsz: usize) -> Self {
        Self { buffer: vec![0u8; bufsz], total: 0, written: 0 }
    }

    pub fn is_pending(&self) -> bool {
        self.written < self.total
    }

    /// Queue `payload` for writing: writes the 4-byte length header plus the
    /// payload. Returns `false` if a write is already pending (caller must
    /// drain it first) or the payload does not fit.
    pub fn queue(&mut self, payload: &[u8]) -> bool {
        if self.is_pending() {
            return false;
        }
        let total = 4 + payload.len();
        if total > self.buffer.len() {
            return false;
        }
        self.buffer[0..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        self.buffer[4..total].copy_from_slice(payload);
        self.total = total;
        self.written = 0;
        true
    }

    /// The bytes remaining to be written to the socket.
    pub fn remaining(&self) -> &[u8] {
        &self.buffer[self.written..self.total]
    }

    /// Record that `n` bytes were successfully written.
    pub fn advance(&mut self, n: usize) {
        self.written += n;
        if self.written >= self.total {
            self.written = 0;
            self.total = 0;
        }
    }
}
