//! Line-oriented CSV protocol (spec §6). ASCII, comma-separated, optional
//! space after a comma, LF (or CR) terminated.
//!
//! Inbound: `N,1,IBM,100,50,B,1` / `C,1,1` / `F`
//! Outbound: `A, IBM, 1, 1` / `C, IBM, 1, 1` / `T, IBM, 1, 1, 2, 2, 100, 50` /
//! `B, IBM, B, 100, 50` / `B, IBM, B, -, -` (eliminated side).

use crate::error::ParseError;
use crate::types::{InputMessage, OutputMessage, Side, Symbol};

/// Find the end of the next CSV line (`\n` or `\r`) and the cursor advance
/// for it. Returns `(line_bytes, consumed)`; `consumed` always includes the
/// terminator when one is present, and covers the whole remaining buffer
/// when it is not (the UDP receiver hands us one already-delimited datagram
/// tail in that case).
fn next_line(buf: &[u8]) -> (&[u8], usize) {
    match buf.iter().position(|&b| b == b'\n' || b == b'\r') {
        Some(pos) => (&buf[..pos], pos + 1),
        None => (buf, buf.len()),
    }
}

fn fields(line: &[u8]) -> Vec<&str> {
    std::str::from_utf8(line)
        .unwrap_or("")
        .split(',')
        .map(|f| f.trim())
        .collect()
}

fn parse_u32(f: &str) -> Result<u32, ParseError> {
    f.parse::<u32>().map_err(|_| ParseError::InvalidField)
}

/// Parse one inbound CSV line starting at `buf[0..]`. Advances the cursor
/// by at least one byte even on failure.
pub fn parse_input_line(buf: &[u8]) -> (Result<InputMessage, ParseError>, usize) {
    let (line, consumed) = next_line(buf);
    let consumed = consumed.max(1);
    if line.is_empty() {
        return (Err(ParseError::Truncated), consumed);
    }
    let parts = fields(line);
    let result = match parts.first().copied() {
        Some("N") => parse_new_order(&parts),
        Some("C") => parse_cancel(&parts),
        Some("F") => {
            if parts.len() == 1 {
                Ok(InputMessage::Flush)
            } else {
                Err(ParseError::InvalidField)
            }
        }
        Some(tag) => Err(ParseError::UnknownTag(tag.as_bytes().first().copied().unwrap_or(0))),
        None => Err(ParseError::Truncated),
    };
    (result, consumed)
}

fn parse_new_order(parts: &[&str]) -> Result<InputMessage, ParseError> {
    if parts.len() != 7 {
        return Err(ParseError::InvalidField);
    }
    let user_id = parse_u32(parts[1])?;
    let symbol = Symbol::from_str_padded(parts[2]);
    let price = parse_u32(parts[3])?;
    let quantity = parse_u32(parts[4])?;
    let side = Side::from_wire_byte(parts[5].as_bytes().first().copied().unwrap_or(0))
        .ok_or(ParseError::InvalidField)?;
    let user_order_id = parse_u32(parts[6])?;
    if quantity == 0 {
        return Err(ParseError::InvalidField);
    }
    Ok(InputMessage::NewOrder { user_id, symbol, price, quantity, side, user_order_id })
}

fn parse_cancel(parts: &[&str]) -> Result<InputMessage, ParseError> {
    if parts.len() != 3 {
        return Err(ParseError::InvalidField);
    }
    Ok(InputMessage::Cancel { user_id: parse_u32(parts[1])?, user_order_id: parse_u32(parts[2])? })
}

fn symbol_str(s: &Symbol) -> String {
    format!("{:?}", s)
}

/// Encode an outbound message as one CSV line, LF-terminated, into `out`
/// (already cleared by the caller).
pub fn encode_output(msg: &OutputMessage, out: &mut Vec<u8>) {
    use std::io::Write;
    match msg {
        OutputMessage::Ack { symbol, user_id, user_order_id } => {
            write!(out, "A, {}, {}, {}", symbol_str(symbol), user_id, user_order_id).unwrap();
        }
        OutputMessage::CancelAck { symbol, user_id, user_order_id } => {
            write!(out, "C, {}, {}, {}", symbol_str(symbol), user_id, user_order_id).unwrap();
        }
        OutputMessage::Trade { symbol, buy_user, buy_order, sell_user, sell_order, price, quantity } => {
            write!(
                out,
                "T, {}, {}, {}, {}, {}, {}, {}",
                symbol_str(symbol), buy_user, buy_order, sell_user, sell_order, price, quantity
            )
            .unwrap();
        }
        OutputMessage::TopOfBook { symbol, side, price, quantity } => {
            let side_ch = side.wire_byte() as char;
            if *price == 0 && *quantity == 0 {
                write!(out, "B, {}, {}, -, -", symbol_str(symbol), side_ch).unwrap();
            } else {
                write!(out, "B, {}, {}, {}, {}", symbol_str(symbol), side_ch, price, quantity).unwrap();
            }
        }
    }
    out.push(b'\n');
}

/// Parse one outbound CSV line (used by test harnesses checking what the
/// output router wrote).
pub fn parse_output(buf: &[u8]) -> Result<OutputMessage, ParseError> {
    let (line, _) = next_line(buf);
    let parts = fields(line);
    match parts.first().copied() {
        Some("A") => {
            if parts.len() != 4 {
                return Err(ParseError::InvalidField);
            }
            Ok(OutputMessage::Ack {
                symbol: Symbol::from_str_padded(parts[1]),
                user_id: parse_u32(parts[2])?,
                user_order_id: parse_u32(parts[3])?,
            })
        }
        Some("C") => {
            if parts.len() != 4 {
                return Err(ParseError::InvalidField);
            }
            Ok(OutputMessage::CancelAck {
                symbol: Symbol::from_str_padded(parts[1]),
                user_id: parse_u32(parts[2])?,
                user_order_id: parse_u32(parts[3])?,
            })
        }
        Some("T") => {
            if parts.len() != 8 {
                return Err(ParseError::InvalidField);
            }
            Ok(OutputMessage::Trade {
                symbol: Symbol::from_str_padded(parts[1]),
                buy_user: parse_u32(parts[2])?,
                buy_order: parse_u32(parts[3])?,
                sell_user: parse_u32(parts[4])?,
                sell_order: parse_u32(parts[5])?,
                price: parse_u32(parts[6])?,
                quantity: parse_u32(parts[7])?,
            })
        }
        Some("B") => {
            if parts.len() != 5 {
                return Err(ParseError::InvalidField);
            }
            let side = Side::from_wire_byte(parts[2].as_bytes().first().copied().unwrap_or(0))
                .ok_or(ParseError::InvalidField)?;
            let symbol = Symbol::from_str_padded(parts[1]);
            if parts[3] == "-" && parts[4] == "-" {
                Ok(OutputMessage::eliminated(symbol, side))
            } else {
                Ok(OutputMessage::TopOfBook { symbol, side, price: parse_u32(parts[3])?, quantity: parse_u32(parts[4])? })
            }
        }
        _ => Err(ParseError::UnknownTag(parts.first().and_then(|s| s.as_bytes().first()).copied().unwrap_or(0))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_new_order_line() {
        let (msg, consumed) = parse_input_line(b"N,1,IBM,100,50,B,1\n");
        assert_eq!(consumed, 19);
        assert_eq!(
            msg.unwrap(),
            InputMessage::NewOrder {
                user_id: 1,
                symbol: Symbol::from_str_padded("IBM"),
                price: 100,
                quantity: 50,
                side: Side::Buy,
                user_order_id: 1,
            }
        );
    }

    #[test]
    fn parse_cancel_line() {
        let (msg, consumed) = parse_input_line(b"C,1,1\n");
        assert_eq!(consumed, 6);
        assert_eq!(msg.unwrap(), InputMessage::Cancel { user_id: 1, user_order_id: 1 });
    }

    #[test]
    fn parse_flush_line() {
        let (msg, _) = parse_input_line(b"F\n");
        assert_eq!(msg.unwrap(), InputMessage::Flush);
    }

    #[test]
    fn parse_multiple_lines_advances_cursor_each_time() {
        let buf = b"N,1,IBM,100,50,B,1\nF\n";
        let (msg1, c1) = parse_input_line(buf);
        assert!(msg1.is_ok());
        let (msg2, _c2) = parse_input_line(&buf[c1..]);
        assert_eq!(msg2.unwrap(), InputMessage::Flush);
    }

    #[test]
    fn malformed_line_advances_past_terminator() {
        let (msg, consumed) = parse_input_line(b"X,garbage\nF\n");
        assert!(msg.is_err());
        assert_eq!(consumed, 10);
    }

    #[test]
    fn encode_ack_matches_spec_example() {
        let msg = OutputMessage::Ack { symbol: Symbol::from_str_padded("IBM"), user_id: 1, user_order_id: 1 };
        let mut out = Vec::new();
        encode_output(&msg, &mut out);
        assert_eq!(&out[..out.len() - 1], b"A, IBM, 1, 1");
    }

    #[test]
    fn encode_trade_matches_spec_example() {
        let msg = OutputMessage::Trade {
            symbol: Symbol::from_str_padded("IBM"),
            buy_user: 1,
            buy_order: 1,
            sell_user: 2,
            sell_order: 2,
            price: 100,
            quantity: 50,
        };
        let mut out = Vec::new();
        encode_output(&msg, &mut out);
        assert_eq!(&out[..out.len() - 1], b"T, IBM, 1, 1, 2, 2, 100, 50");
    }

    #[test]
    fn encode_eliminated_top_of_book_matches_spec_example() {
        let msg = OutputMessage::eliminated(Symbol::from_str_padded("IBM"), Side::Buy);
        let mut out = Vec::new();
        encode_output(&msg, &mut out);
        assert_eq!(&out[..out.len() - 1], b"B, IBM, B, -, -");
    }

    #[test]
    fn encode_then_parse_top_of_book_roundtrip() {
        let msg = OutputMessage::TopOfBook { symbol: Symbol::from_str_padded("IBM"), side: Side::Sell, price: 100, quantity: 50 };
        let mut out = Vec::new();
        encode_output(&msg, &mut out);
        assert_eq!(parse_output(&out).unwrap(), msg);
    }
}
