//! Frame layer, connection handshake, and message helpers for the
//! command-channel protocol.
//!
//! This crate sits on top of `cmdchan-wire` (the value codec) and
//! `cmdchan-crypto` (the cryptographic primitives) and exposes the pieces a
//! session layer needs: the auth/encrypt/compress frame envelope, a
//! handshaking `Connection`, and the small set of message constructors and
//! predicates every request/response/event is built from.

pub mod channel;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message;

pub use channel::{ChannelResolver, ChannelSpec};
pub use connection::{Connection, ConnectionReader, ConnectionWriter, EncryptionPolicy, Tracer};
pub use error::{FrameError, ProtoError};
pub use message::{error as error_response, event, is_event, is_reply, is_request, kind, reply_to, request, Kind};
