//! Encoding and decoding of [`Value`] trees to and from their wire
//! representation.
//!
//! Grammar (all integers big-endian):
//!
//! ```text
//! table  := entry*
//! entry  := keylen:u8 key:[u8; keylen] value
//! value  := type:u8 length:u32 payload:[u8; length]
//! ```
//!
//! `type` is one of [`TYPE_BLOB`], [`TYPE_TABLE`], [`TYPE_LIST`]; for a
//! table or list value, `payload` is itself a nested `table`/`value*`.
//! A message body is a bare `table` with no leading type byte or length
//! (the frame layer supplies those).

use crate::cursor::Cursor;
use crate::error::{EncodeError, WireError};
use crate::value::{Table, Value};

/// Value type tag: an opaque byte string.
pub const TYPE_BLOB: u8 = 0x01;
/// Value type tag: a nested table.
pub const TYPE_TABLE: u8 = 0x02;
/// Value type tag: a list of values.
pub const TYPE_LIST: u8 = 0x03;

/// Largest accepted encoded body, matching the frame layer's ceiling on a
/// single message.
pub const MAX_WIRE_SIZE: usize = 4 * 1024 * 1024;

/// Encode a table as a message body (no outer type/length header).
pub fn encode_body(table: &Table) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    encode_table(table, &mut out)?;
    Ok(out)
}

/// Decode a message body (a bare table) from its full byte slice.
pub fn decode_body(bytes: &[u8]) -> Result<Table, WireError> {
    let mut cursor = Cursor::from_slice(bytes);
    decode_table(&mut cursor)
}

/// Append the wire encoding of `table`'s entries to `out`.
///
/// The `keylen` octet carries `actual_key_length - 1`, so a key must be at
/// least 1 byte (a zero-length key has no representation) and at most 256
/// bytes; by data-model contract keys are kept to 1-255 bytes.
pub fn encode_table(table: &Table, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    for (key, value) in table.iter() {
        let key_bytes = key.as_bytes();
        if key_bytes.is_empty() || key_bytes.len() > 256 {
            return Err(EncodeError::KeyTooLong(key.to_string()));
        }
        out.push((key_bytes.len() - 1) as u8);
        out.extend_from_slice(key_bytes);
        encode_value(value, out)?;
    }
    Ok(())
}

/// Append the wire encoding of a single value (type byte, length, payload)
/// to `out`.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    match value {
        Value::Blob(bytes) => {
            out.push(TYPE_BLOB);
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        Value::Table(table) => {
            let mut inner = Vec::new();
            encode_table(table, &mut inner)?;
            out.push(TYPE_TABLE);
            out.extend_from_slice(&(inner.len() as u32).to_be_bytes());
            out.extend_from_slice(&inner);
        }
        Value::List(items) => {
            let mut inner = Vec::new();
            for item in items {
                encode_value(item, &mut inner)?;
            }
            out.push(TYPE_LIST);
            out.extend_from_slice(&(inner.len() as u32).to_be_bytes());
            out.extend_from_slice(&inner);
        }
    }
    Ok(())
}

/// Decode a table's worth of entries from `cursor` until it is exhausted.
///
/// Each entry's `keylen` octet is `actual_key_length - 1`.
///
/// Table keys carrying `_data` do not receive special handling here: unlike
/// the reference implementation, blobs are never eagerly coerced to strings
/// during decode. Callers reach for [`Value::as_str`] /
/// [`Table::get_str`](crate::Table::get_str) wherever they expect textual
/// content, so a single `Value::Blob` representation covers both cases
/// losslessly regardless of which subtree it came from.
pub fn decode_table(cursor: &mut Cursor) -> Result<Table, WireError> {
    let mut table = Table::new();
    while !cursor.is_empty() {
        let key_len = cursor.read_u8()? as usize + 1;
        let key_bytes = cursor.take(key_len)?;
        let key = std::str::from_utf8(key_bytes)
            .map_err(|_| WireError::BadKeyEncoding)?
            .to_string();
        let value = decode_value(cursor)?;
        table.insert(key, value);
    }
    Ok(table)
}

/// Decode one length-prefixed value from `cursor`.
pub fn decode_value(cursor: &mut Cursor) -> Result<Value, WireError> {
    let type_byte = cursor.read_u8()?;
    let len = cursor.read_u32()? as usize;
    let mut body = cursor.sub_cursor(len)?;
    match type_byte {
        TYPE_BLOB => Ok(Value::Blob(body.take(len)?.to_vec())),
        TYPE_TABLE => Ok(Value::Table(decode_table(&mut body)?)),
        TYPE_LIST => Ok(Value::List(decode_list(&mut body)?)),
        other => Err(WireError::UnknownValueType(other)),
    }
}

fn decode_list(cursor: &mut Cursor) -> Result<Vec<Value>, WireError> {
    let mut items = Vec::new();
    while !cursor.is_empty() {
        items.push(decode_value(cursor)?);
    }
    Ok(items)
}
