//! The session layer's error taxonomy: every failure kind named in the
//! protocol, plus the transport/frame errors that surface through it.

use std::fmt;

use cmdchan_proto::{FrameError, ProtoError};
use cmdchan_wire::WireError;

/// Everything a session can fail with, matching the protocol's error
/// taxonomy one-for-one.
#[derive(Debug)]
pub enum SessionError {
    /// A frame declared, or would produce, a body over the 4 MiB ceiling.
    MessageTooBig,
    /// The wire version tag was not `1`.
    BadVersion(u32),
    /// A frame, value header, or crypto envelope was truncated.
    UnexpectedEnd,
    /// The message was encoded incorrectly.
    BadSyntax(String),
    /// A structural rule outside the codec's grammar was violated.
    BadForm(String),
    /// Missing, unrecognized, or mismatched HMAC.
    BadAuth(String),
    /// Encrypted traffic requires a shared secret that was not supplied.
    NeedSecret,
    /// Policy `Required` but the peer did not offer encryption.
    NotSecure,
    /// A nonce/sequence invariant was violated.
    BadNoncing(String),
    /// A handshake reply was not a response.
    NotResponse,
    /// A handshake reply answered a different request.
    BadResponse,
    /// The multi-part sequence protocol was violated.
    BadSequence(String),
    /// A response carried `_seq` but the caller did not opt in.
    UnexpectedSequence,
    /// The session closed while the caller was waiting.
    Closing,
    /// A per-call deadline elapsed.
    Timeout,
    /// A structured application error surfaced from `_data.err`.
    Error(String),
    /// A channel address literal was malformed.
    BadChannelValue(String),
    /// A channel configuration file was malformed (boundary type; the core
    /// has no parser for it, but callers that implement one report through
    /// this variant).
    BadChannelConf(String),
    /// Neither IPv4 nor IPv6.
    UnsupportedAddressFamily,
    /// The underlying transport failed.
    Io(std::io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooBig => write!(f, "message too big"),
            Self::BadVersion(v) => write!(f, "unknown CC version: {v}"),
            Self::UnexpectedEnd => write!(f, "unexpected end"),
            Self::BadSyntax(s) => write!(f, "message syntax error: {s}"),
            Self::BadForm(s) => write!(f, "message format error: {s}"),
            Self::BadAuth(s) => write!(f, "bad CC auth: {s}"),
            Self::NeedSecret => write!(f, "cannot encrypt without a secret"),
            Self::NotSecure => write!(f, "not secure"),
            Self::BadNoncing(s) => write!(f, "bad noncing: {s}"),
            Self::NotResponse => write!(f, "expected response"),
            Self::BadResponse => write!(f, "bad response"),
            Self::BadSequence(s) => write!(f, "sequence format error: {s}"),
            Self::UnexpectedSequence => write!(f, "unexpected sequence"),
            Self::Closing => write!(f, "session closing"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error(s) => write!(f, "{s}"),
            Self::BadChannelValue(s) => write!(f, "bad channel value: {s}"),
            Self::BadChannelConf(s) => write!(f, "channel.conf format error: {s}"),
            Self::UnsupportedAddressFamily => write!(f, "unsupported address family"),
            Self::Io(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtoError> for SessionError {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::Frame(fe) => fe.into(),
            ProtoError::MessageTooBig => SessionError::MessageTooBig,
            ProtoError::BadNoncing(s) => SessionError::BadNoncing(s),
            ProtoError::NotResponse => SessionError::NotResponse,
            ProtoError::BadResponse => SessionError::BadResponse,
            ProtoError::NotSecure => SessionError::NotSecure,
            ProtoError::Io(e) => SessionError::Io(e),
            ProtoError::BadChannelValue(s) => SessionError::BadChannelValue(s),
            ProtoError::UnsupportedAddressFamily => SessionError::UnsupportedAddressFamily,
        }
    }
}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Wire(w) => w.into(),
            FrameError::Crypto(c) => SessionError::BadForm(c.to_string()),
            FrameError::BadVersion(v) => SessionError::BadVersion(v),
            FrameError::UnexpectedEnd => SessionError::UnexpectedEnd,
            FrameError::BadAuth(s) => SessionError::BadAuth(s.to_string()),
            FrameError::NeedSecret => SessionError::NeedSecret,
            FrameError::BadForm(s) => SessionError::BadForm(s.to_string()),
            FrameError::TooBig => SessionError::MessageTooBig,
        }
    }
}

impl From<WireError> for SessionError {
    fn from(e: WireError) -> Self {
        SessionError::BadSyntax(e.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}
