//! Wire codecs for the two supported protocols. Encoding/decoding routines
//! here are treated as primitives by the rest of the core — callers pick a
//! codec per message based on auto-detection (first byte) or configuration.

pub mod binary;
pub mod csv;

use crate::error::ParseError;
use crate::types::{InputMessage, OutputMessage};

/// Which wire protocol a buffer appears to be, by first byte (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Binary,
    Csv,
    Unknown,
}

pub fn detect_protocol(first_byte: u8) -> Protocol {
    if first_byte == binary::MAGIC {
        Protocol::Binary
    } else if first_byte.is_ascii_alphabetic() {
        Protocol::Csv
    } else {
        Protocol::Unknown
    }
}

/// Parse one `InputMessage` from `buf`, auto-detecting the protocol by its
/// first byte. Returns the message plus the number of bytes consumed, so
/// callers can advance a cursor over a multi-message buffer (UDP, §4.5).
///
/// On a parse failure the cursor still advances by at least one byte, per
/// spec §4.5's "always advances ≥ 1 byte on a failed parse" rule — this
/// prevents an infinite loop on a corrupt datagram.
pub fn parse_one(buf: &[u8]) -> (Result<InputMessage, ParseError>, usize) {
    if buf.is_empty() {
        return (Err(ParseError::Truncated), 0);
    }
    match detect_protocol(buf[0]) {
        Protocol::Binary => binary::parse_input(buf),
        Protocol::Csv => csv::parse_input_line(buf),
        Protocol::Unknown => (Err(ParseError::UnknownTag(buf[0])), 1),
    }
}

/// Encode `msg` with the given protocol into `out`, clearing `out` first.
/// No per-message heap allocation beyond what `out`'s existing capacity
/// already covers — callers are expected to reuse one `out` buffer per
/// thread across many calls (Design Note on pointer-returning formatters).
pub fn encode_output(msg: &OutputMessage, protocol: Protocol, out: &mut Vec<u8>) {
    out.clear();
    match protocol {
        Protocol::Binary => binary::encode_output(msg, out),
        Protocol::Csv | Protocol::Unknown => csv::encode_output(msg, out),
    }
}
