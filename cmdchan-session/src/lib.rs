//! Multiplexing session layer for the command-channel protocol.
//!
//! Built on [`cmdchan_proto::Connection`], a [`Session`] runs a reader and
//! a writer thread over one handshaken connection and exposes `ask`
//! (fire-and-forget), `tell` (blocking call), `sequence` (streaming
//! multi-part replies), and a [`Dispatcher`] hook for unsolicited
//! requests and events.

pub mod closer;
pub mod dispatcher;
pub mod error;
pub mod request;
pub mod retry;
pub mod sequence;
pub mod session;

pub use closer::ThreadedCloser;
pub use dispatcher::{Dispatcher, FieldMatch, HandlerFn, Kind, Selector};
pub use error::SessionError;
pub use request::RequestState;
pub use retry::{with_retry, NoRetries, RetryContext, RetryPolicy, TimeoutBackoff};
pub use sequence::{Reader, Sequence};
pub use session::{Request, Session};
