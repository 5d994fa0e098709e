//! Fixed-layout binary protocol (spec §6). All multi-byte fields are
//! network byte order (big-endian), packed, no padding between fields.
//!
//! Layout (after the 1-byte `magic` + 1-byte `type` header common to every
//! message):
//!
//! ```text
//! NewOrder   user_id:u32 symbol[8] price:u32 quantity:u32 side:u8 user_order_id:u32
//! Cancel     user_id:u32 user_order_id:u32
//! Flush      (no body)
//! Ack        symbol[8] user_id:u32 user_order_id:u32
//! CancelAck  symbol[8] user_id:u32 user_order_id:u32
//! Trade      symbol[8] buy_user:u32 buy_order:u32 sell_user:u32 sell_order:u32 price:u32 quantity:u32
//! TopOfBook  symbol[8] side:u8 price:u32 quantity:u32
//! ```

use crate::error::ParseError;
use crate::types::{InputMessage, OutputMessage, Side, Symbol};

pub const MAGIC: u8 = 0x4D;

const TYPE_NEW_ORDER: u8 = b'N';
const TYPE_CANCEL: u8 = b'C';
const TYPE_FLUSH: u8 = b'F';
const TYPE_ACK: u8 = b'A';
const TYPE_TRADE: u8 = b'T';
const TYPE_TOP_OF_BOOK: u8 = b'B';

const HEADER_LEN: usize = 2; // magic + type

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn read_symbol(buf: &[u8], off: usize) -> Symbol {
    let mut s = [0u8; 8];
    s.copy_from_slice(&buf[off..off + 8]);
    Symbol(s)
}

fn write_symbol(out: &mut Vec<u8>, s: &Symbol) {
    out.extend_from_slice(&s.0);
}

/// The total encoded length of a message with the given type byte, or
/// `None` if unknown. Used by the UDP receiver to advance its cursor
/// without fully parsing every message in a multi-message datagram.
pub fn message_len(type_byte: u8) -> Option<usize> {
    Some(match type_byte {
        TYPE_NEW_ORDER => HEADER_LEN + 4 + 8 + 4 + 4 + 1 + 4,
        TYPE_CANCEL => HEADER_LEN + 4 + 4,
        TYPE_FLUSH => HEADER_LEN,
        TYPE_ACK => HEADER_LEN + 8 + 4 + 4,
        TYPE_TRADE => HEADER_LEN + 8 + 4 + 4 + 4 + 4 + 4 + 4,
        TYPE_TOP_OF_BOOK => HEADER_LEN + 8 + 1 + 4 + 4,
        _ => return None,
    })
}

/// Parse one inbound message from `buf[0..]`. Returns the message and the
/// number of bytes consumed (the message's declared length on success, 1
/// byte on any failure — per the "cursor always advances" rule).
pub fn parse_input(buf: &[u8]) -> (Result<InputMessage, ParseError>, usize) {
    if buf.len() < HEADER_LEN || buf[0] != MAGIC {
        return (Err(ParseError::UnknownTag(buf.first().copied().unwrap_or(0))), 1);
    }
    let type_byte = buf[1];
    let Some(len) = message_len(type_byte) else {
        return (Err(ParseError::UnknownTag(type_byte)), 1);
    };
    if buf.len() < len {
        return (Err(ParseError::Truncated), 1);
    }

    let body = &buf[HEADER_LEN..len];
    let msg = match type_byte {
        TYPE_NEW_ORDER => {
            let user_id = read_u32(body, 0);
            let symbol = read_symbol(body, 4);
            let price = read_u32(body, 12);
            let quantity = read_u32(body, 16);
            let side_byte = body[20];
            let user_order_id = read_u32(body, 21);
            let Some(side) = Side::from_wire_byte(side_byte) else {
                return (Err(ParseError::InvalidField), len);
            };
            if quantity == 0 {
                return (Err(ParseError::InvalidField), len);
            }
            InputMessage::NewOrder { user_id, symbol, price, quantity, side, user_order_id }
        }
        TYPE_CANCEL => InputMessage::Cancel { user_id: read_u32(body, 0), user_order_id: read_u32(body, 4) },
        TYPE_FLUSH => InputMessage::Flush,
        _ => return (Err(ParseError::UnknownTag(type_byte)), 1),
    };
    (Ok(msg), len)
}

/// Encode an outbound message into `out` (already cleared by the caller).
pub fn encode_output(msg: &OutputMessage, out: &mut Vec<u8>) {
    out.push(MAGIC);
    match msg {
        OutputMessage::Ack { symbol, user_id, user_order_id } => {
            out.push(TYPE_ACK);
            write_symbol(out, symbol);
            write_u32(out, *user_id);
            write_u32(out, *user_order_id);
        }
        OutputMessage::CancelAck { symbol, user_id, user_order_id } => {
            out.push(TYPE_CANCEL);
            write_symbol(out, symbol);
            write_u32(out, *user_id);
            write_u32(out, *user_order_id);
        }
        OutputMessage::Trade { symbol, buy_user, buy_order, sell_user, sell_order, price, quantity } => {
            out.push(TYPE_TRADE);
            write_symbol(out, symbol);
            write_u32(out, *buy_user);
            write_u32(out, *buy_order);
            write_u32(out, *sell_user);
            write_u32(out, *sell_order);
            write_u32(out, *price);
            write_u32(out, *quantity);
        }
        OutputMessage::TopOfBook { symbol, side, price, quantity } => {
            out.push(TYPE_TOP_OF_BOOK);
            write_symbol(out, symbol);
            out.push(side.wire_byte());
            write_u32(out, *price);
            write_u32(out, *quantity);
        }
    }
}

/// Parse one outbound message (used by test harnesses verifying what the
/// output router wrote to a client/multicast socket).
pub fn parse_output(buf: &[u8]) -> Result<OutputMessage, ParseError> {
    if buf.len() < HEADER_LEN || buf[0] != MAGIC {
        return Err(ParseError::UnknownTag(buf.first().copied().unwrap_or(0)));
    }
    let type_byte = buf[1];
    let body = &buf[HEADER_LEN..];
    match type_byte {
        TYPE_ACK => {
            if body.len() < 16 {
                return Err(ParseError::Truncated);
            }
            Ok(OutputMessage::Ack {
                symbol: read_symbol(body, 0),
                user_id: read_u32(body, 8),
                user_order_id: read_u32(body, 12),
            })
        }
        TYPE_CANCEL => {
            if body.len() < 16 {
                return Err(ParseError::Truncated);
            }
            Ok(OutputMessage::CancelAck {
                symbol: read_symbol(body, 0),
                user_id: read_u32(body, 8),
                user_order_id: read_u32(body, 12),
            })
        }
        TYPE_TRADE => {
            if body.len() < 32 {
                return Err(ParseError::Truncated);
            }
            Ok(OutputMessage::Trade {
                symbol: read_symbol(body, 0),
                buy_user: read_u32(body, 8),
                buy_order: read_u32(body, 12),
                sell_user: read_u32(body, 16),
                sell_order: read_u32(body, 20),
                price: read_u32(body, 24),
                quantity: read_u32(body, 28),
            })
        }
        TYPE_TOP_OF_BOOK => {
            if body.len() < 17 {
                return Err(ParseError::Truncated);
            }
            let Some(side) = Side::from_wire_byte(body[8]) else {
                return Err(ParseError::InvalidField);
            };
            Ok(OutputMessage::TopOfBook { symbol: read_symbol(body, 0), side, price: read_u32(body, 9), quantity: read_u32(body, 13) })
        }
        _ => Err(ParseError::UnknownTag(type_byte)),
    }
}
