use std::fmt;

use cmdchan_crypto::CryptoError;
use cmdchan_wire::WireError;

/// Everything the frame layer (value codec plus auth/encrypt/compress
/// envelopes) can fail with.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameError {
    /// The value codec rejected the body.
    Wire(WireError),
    /// A cryptographic primitive rejected its input.
    Crypto(CryptoError),
    /// The leading version field was not `1`.
    BadVersion(u32),
    /// The frame is shorter than a well-formed header requires.
    UnexpectedEnd,
    /// Missing, unrecognized, or mismatched HMAC.
    BadAuth(&'static str),
    /// Encrypted traffic arrived (or was requested) with no shared secret.
    NeedSecret,
    /// A structural rule outside the codec's grammar was violated.
    BadForm(&'static str),
    /// An encoded message would not fit a `u32` length prefix.
    TooBig,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "{e}"),
            Self::Crypto(e) => write!(f, "{e}"),
            Self::BadVersion(v) => write!(f, "unknown protocol version {v}"),
            Self::UnexpectedEnd => write!(f, "unexpected end of frame"),
            Self::BadAuth(why) => write!(f, "authentication failed: {why}"),
            Self::NeedSecret => write!(f, "encrypted traffic requires a shared secret"),
            Self::BadForm(why) => write!(f, "malformed message: {why}"),
            Self::TooBig => write!(f, "encoded message exceeds u32 length"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<WireError> for FrameError {
    fn from(e: WireError) -> Self {
        FrameError::Wire(e)
    }
}

impl From<CryptoError> for FrameError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::ShortCiphertext | CryptoError::NotBlockAligned => {
                FrameError::BadForm("encrypted input is not a multiple of the AES block size")
            }
            other => FrameError::Crypto(other),
        }
    }
}

/// Everything the connection layer can fail with: frame-layer failures plus
/// nonce/handshake and transport-level problems.
#[derive(Debug)]
pub enum ProtoError {
    /// A frame failed to encode or decode.
    Frame(FrameError),
    /// The peer declared (or we would produce) a frame bigger than the
    /// protocol's 4 MiB ceiling.
    MessageTooBig,
    /// A nonce/sequence invariant was violated.
    BadNoncing(String),
    /// A handshake reply was not a response at all.
    NotResponse,
    /// A handshake reply answered a different request than the one sent.
    BadResponse,
    /// The policy demanded encryption but the peer did not offer it.
    NotSecure,
    /// The underlying transport failed.
    Io(std::io::Error),
    /// A channel address literal was malformed.
    BadChannelValue(String),
    /// The address family is neither IPv4 nor IPv6.
    UnsupportedAddressFamily,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "{e}"),
            Self::MessageTooBig => write!(f, "frame exceeds the maximum wire size"),
            Self::BadNoncing(why) => write!(f, "nonce/sequence invariant violated: {why}"),
            Self::NotResponse => write!(f, "expected a response message"),
            Self::BadResponse => write!(f, "response does not match the outstanding request"),
            Self::NotSecure => write!(f, "encryption is required but not available"),
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::BadChannelValue(v) => write!(f, "invalid channel literal: {v}"),
            Self::UnsupportedAddressFamily => write!(f, "unsupported address family"),
        }
    }
}

impl std::error::Error for ProtoError {}

impl From<FrameError> for ProtoError {
    fn from(e: FrameError) -> Self {
        ProtoError::Frame(e)
    }
}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        ProtoError::Io(e)
    }
}
