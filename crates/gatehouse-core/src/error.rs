//! Small `Copy` error enums for hot-path signaling.
//!
//! Per the spec's error-handling design (§7) and this workspace's split
//! between `anyhow` at the cold startup boundary and plain enums deeper in
//! the pipeline: none of these allocate, and none of them is `anyhow::Error`.

use std::fmt;

/// Framing error: the 4-byte length header was zero or exceeded `MAX_PAYLOAD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    ZeroLength,
    Oversize { declared: u32, max: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ZeroLength => write!(f, "zero-length frame header"),
            FrameError::Oversize { declared, max } => {
                write!(f, "frame length {} exceeds max payload {}", declared, max)
            }
        }
    }
}

/// Wire-protocol parse error. Carries enough to log without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer too short for the declared/detected message type.
    Truncated,
    /// First byte did not match any known protocol/message tag.
    UnknownTag(u8),
    /// A numeric field failed validation (e.g. `quantity == 0`).
    InvalidField,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated => write!(f, "truncated message"),
            ParseError::UnknownTag(b) => write!(f, "unknown tag byte 0x{:02x}", b),
            ParseError::InvalidField => write!(f, "invalid field value"),
        }
    }
}

/// A declared `user_id` did not match the connection's assigned `client_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionError {
    pub declared: u32,
    pub client_id: u32,
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "declared user_id {} != client_id {}", self.declared, self.client_id)
    }
}

/// An SPSC ring was full at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue full")
    }
}
