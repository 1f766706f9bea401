//! Nested typed-value wire codec for the command-channel protocol.
//!
//! A message body is a [`Table`] of [`Value`]s, each of which is a blob, a
//! nested table, or a list. This crate knows nothing about framing,
//! authentication, or encryption — see `cmdchan-proto` for those.

mod codec;
mod cursor;
mod error;
mod value;

pub use codec::{
    decode_body, decode_table, decode_value, encode_body, encode_table, encode_value,
    MAX_WIRE_SIZE, TYPE_BLOB, TYPE_LIST, TYPE_TABLE,
};
pub use cursor::Cursor;
pub use error::{EncodeError, WireError};
pub use value::{Table, Value};
