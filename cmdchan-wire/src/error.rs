use std::fmt;

/// Everything that can go wrong decoding a value tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireError {
    /// The cursor ran out of bytes before a length-prefixed field was
    /// satisfied.
    UnexpectedEnd(&'static str),
    /// A value header named a type byte other than blob/table/list.
    UnknownValueType(u8),
    /// A table key was not valid UTF-8.
    BadKeyEncoding,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::UnexpectedEnd(what) => write!(f, "unexpected end of input: {what}"),
            WireError::UnknownValueType(t) => write!(f, "unknown value type byte 0x{t:02x}"),
            WireError::BadKeyEncoding => write!(f, "table key is not valid UTF-8"),
        }
    }
}

impl std::error::Error for WireError {}

/// Everything that can go wrong encoding a value tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodeError {
    /// A table key was empty or over 256 bytes; the wire format's
    /// key-length prefix (`actual_length - 1`) covers only 1-256 byte keys.
    KeyTooLong(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::KeyTooLong(k) => write!(f, "table key {k:?} is empty or over 256 bytes"),
        }
    }
}

impl std::error::Error for EncodeError {}
