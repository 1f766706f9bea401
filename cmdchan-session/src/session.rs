//! The multiplexing session: runs a reader and a writer thread over one
//! [`Connection`](cmdchan_proto::Connection), exposing `ask`/`tell`/
//! `sequence` to callers and a dispatcher hook for unsolicited traffic.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use cmdchan_proto::{Connection, EncryptionPolicy, Tracer};
use cmdchan_wire::{Table, Value};

use crate::closer::ThreadedCloser;
use crate::dispatcher::{Dispatcher, Kind as DispatchKind};
use crate::error::SessionError;
use crate::request::RequestState;
use crate::sequence::{Reader, Sequence};

/// Per-request state `Connection`/reader/writer carry in their outstanding
/// table: the future a caller is waiting on.
type State = Arc<RequestState>;

/// What a caller hands to `ask`/`tell`/`sequence`: a bare type name (the
/// common case), a `_data` table, or a fully-formed message (`_ctrl` and
/// `_data` both present, for replying to something by hand).
#[derive(Clone)]
pub enum Request {
    Type(String),
    Data(Table),
    Message(Table),
}

impl From<&str> for Request {
    fn from(ty: &str) -> Self {
        Request::Type(ty.to_string())
    }
}

impl From<String> for Request {
    fn from(ty: String) -> Self {
        Request::Type(ty)
    }
}

impl From<Table> for Request {
    fn from(table: Table) -> Self {
        if table.contains_key("_data") {
            Request::Message(table)
        } else {
            Request::Data(table)
        }
    }
}

enum WriteItem {
    Message(Table, Option<State>),
    Shutdown,
}

/// A live, handshaken command-channel connection, multiplexing requests,
/// responses, events, and sequence streams over one socket.
///
/// Always held behind an `Arc`, since the reader and writer threads each
/// keep a clone alive for the session's lifetime.
pub struct Session {
    /// A weak handle back to the `Arc` this session is always held in, so
    /// `&self` methods (dispatch, sequence iteration) can hand out an
    /// `Arc<Session>` to code that needs to outlive the call, without
    /// requiring an unstable `self: &Arc<Self>` receiver. Set once, in
    /// [`with_timeouts`](Self::with_timeouts), via `Arc::new_cyclic`.
    self_weak: Weak<Session>,
    dispatcher: Option<Arc<Dispatcher>>,
    write_queue: Mutex<VecDeque<WriteItem>>,
    wake_writer: Condvar,
    sequences: Mutex<HashMap<String, Box<dyn Sequence + Send>>>,
    next_seq_id: AtomicU64,
    closer: ThreadedCloser,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_sock: TcpStream,
    outstanding: Arc<Mutex<HashMap<u64, Option<State>>>>,
    peer_addr: Option<SocketAddr>,
}

impl Session {
    /// Wrap an already-handshaken connection in a session, with no idle
    /// or lifetime timeout.
    pub fn new(
        connection: Connection<TcpStream, State>,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> Result<Arc<Session>, SessionError> {
        Self::with_timeouts(connection, dispatcher, None, None)
    }

    /// As [`new`](Self::new), additionally arming the background closer's
    /// idle and lifetime timers.
    pub fn with_timeouts(
        connection: Connection<TcpStream, State>,
        dispatcher: Option<Arc<Dispatcher>>,
        idle_timeout: Option<Duration>,
        lifetime: Option<Duration>,
    ) -> Result<Arc<Session>, SessionError> {
        let shutdown_sock = connection.try_clone_transport()?;
        let outstanding = connection.outstanding_handle();
        let peer_addr = connection.peer_addr().ok();
        let (reader, writer) = connection.into_halves()?;

        let session = Arc::new_cyclic(|weak| Session {
            self_weak: weak.clone(),
            dispatcher,
            write_queue: Mutex::new(VecDeque::new()),
            wake_writer: Condvar::new(),
            sequences: Mutex::new(HashMap::new()),
            next_seq_id: AtomicU64::new(1),
            closer: ThreadedCloser::new(idle_timeout, lifetime),
            reader_handle: Mutex::new(None),
            writer_handle: Mutex::new(None),
            shutdown_sock,
            outstanding,
            peer_addr,
        });

        let reader_session = Arc::clone(&session);
        let reader_handle = std::thread::Builder::new()
            .name("cc-reader".into())
            .spawn(move || reader_loop(reader, reader_session))
            .map_err(SessionError::Io)?;
        *session.reader_handle.lock().unwrap() = Some(reader_handle);

        let writer_session = Arc::clone(&session);
        let writer_handle = std::thread::Builder::new()
            .name("cc-writer".into())
            .spawn(move || writer_loop(writer, writer_session))
            .map_err(SessionError::Io)?;
        *session.writer_handle.lock().unwrap() = Some(writer_handle);

        let close_session = Arc::clone(&session);
        session.closer.start(move || close_session.do_close());

        Ok(session)
    }

    /// Connect to `addr`, run the handshake, and wrap the result in a
    /// session with no idle or lifetime timeout.
    pub fn connect(
        addr: SocketAddr,
        secret: Option<Vec<u8>>,
        policy: EncryptionPolicy,
        connect_timeout: Option<Duration>,
        tracer: Option<Arc<Tracer>>,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> Result<Arc<Session>, SessionError> {
        let connection = Connection::<TcpStream, State>::connect(addr, secret, policy, connect_timeout, tracer)?;
        Session::new(connection, dispatcher)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Recover an `Arc` to this session, to hand to code (dispatcher
    /// handlers, a sequence reader) that needs to keep it alive past the
    /// current call.
    fn arc(&self) -> Arc<Session> {
        self.self_weak
            .upgrade()
            .expect("a Session is always held by an Arc for its entire lifetime")
    }

    fn build_request_message(&self, request: Request) -> Table {
        match request {
            Request::Type(ty) => {
                let mut data = Table::new();
                data.insert("type", ty);
                cmdchan_proto::request(data)
            }
            Request::Data(data) => cmdchan_proto::request(data),
            Request::Message(message) => message,
        }
    }

    /// Enqueue `message` for the writer thread. Fails immediately with
    /// `Closing` once the session has started shutting down.
    fn write(&self, message: Table, state: Option<State>) -> Result<(), SessionError> {
        if self.closer.is_closing() {
            if let Some(state) = &state {
                state.return_exception(SessionError::Closing);
            }
            return Err(SessionError::Closing);
        }
        let mut queue = self.write_queue.lock().unwrap();
        queue.push_back(WriteItem::Message(message, state));
        self.wake_writer.notify_all();
        Ok(())
    }

    pub(crate) fn reply_error(&self, request: &Table, detail: impl Into<String>) -> Result<(), SessionError> {
        let response = cmdchan_proto::error_response(request, detail, None);
        self.write(response, None)
    }

    fn write_sequence_reply(&self, request: &Table, data: Table, done: bool) -> Result<(), SessionError> {
        let mut response = cmdchan_proto::reply_to(request, None);
        response.insert("_data", data);
        if !done {
            if let Some(Value::Table(ctrl)) = response.get_mut("_ctrl") {
                ctrl.insert("_more", "1");
            }
        }
        self.write(response, None)
    }

    /// Send `request` without blocking for a reply; returns the
    /// [`RequestState`] future a caller can poll or hand to another
    /// thread.
    pub fn ask(
        &self,
        request: impl Into<Request>,
        raise_error: bool,
        sequence_ok: bool,
    ) -> Result<Arc<RequestState>, SessionError> {
        let message = self.build_request_message(request.into());
        let state = Arc::new(RequestState::new(raise_error, sequence_ok));
        self.write(message, Some(Arc::clone(&state)))?;
        Ok(state)
    }

    /// Send `request` and block for the reply. Raises `Error` if the
    /// response carries `_data.err`, and `UnexpectedSequence` if it
    /// carries `_seq` (since the caller did not ask for a sequence).
    pub fn tell(&self, request: impl Into<Request>, timeout: Option<Duration>) -> Result<Table, SessionError> {
        let message = self.build_request_message(request.into());
        self.tell_raw(message, true, false, timeout)
    }

    /// As `tell`, but takes an already-built message and controls
    /// `raise_error`/`sequence_ok` directly; used by the sequence reader
    /// for its follow-up requests.
    pub(crate) fn tell_raw(
        &self,
        message: Table,
        raise_error: bool,
        sequence_ok: bool,
        timeout: Option<Duration>,
    ) -> Result<Table, SessionError> {
        let state = Arc::new(RequestState::new(raise_error, sequence_ok));
        self.write(message, Some(Arc::clone(&state)))?;
        state.get_response(timeout)
    }

    /// Start a client-side sequence: an iterator over the `_data` of each
    /// part of a multi-part reply. `batch_size` of `0` disables batched
    /// fetch even if the peer offers it.
    pub fn sequence(&self, request: impl Into<Request>, batch_size: u32, timeout: Option<Duration>) -> Reader {
        let message = self.build_request_message(request.into());
        Reader::new(self.arc(), message, batch_size, timeout)
    }

    /// Register a server-side sequence producer and return the id it was
    /// assigned, for inclusion in the first response's `_ctrl._seq`.
    pub fn add_sequence(&self, seq: Box<dyn Sequence + Send>) -> String {
        let id = self.next_seq_id.fetch_add(1, Ordering::Relaxed).to_string();
        tracing::debug!(seq_id = %id, "sequence registered");
        self.sequences.lock().unwrap().insert(id.clone(), seq);
        id
    }

    pub fn delete_sequence(&self, id: &str) -> Option<Box<dyn Sequence + Send>> {
        let removed = self.sequences.lock().unwrap().remove(id);
        if removed.is_some() {
            tracing::debug!(seq_id = %id, "sequence removed");
        }
        removed
    }

    pub fn has_sequence(&self, id: &str) -> bool {
        self.sequences.lock().unwrap().contains_key(id)
    }

    /// Register a callback to run once, during close, after the
    /// connection and threads have been torn down.
    pub fn at_close(&self, f: impl FnMut() + Send + 'static) {
        self.closer.at_close(f);
    }

    /// Signal close without waiting for it to finish.
    pub fn request_close(&self) {
        self.closer.request_close();
    }

    /// Perform an orderly close, waiting (up to `timeout`) for it to
    /// finish. Idempotent.
    pub fn close(&self, timeout: Option<Duration>) {
        self.closer.close(timeout);
    }

    pub fn is_closing(&self) -> bool {
        self.closer.is_closing()
    }

    pub fn set_idletime(&self, timeout: Option<Duration>) {
        self.closer.set_idletime(timeout);
    }

    pub fn set_lifetime(&self, lifetime: Option<Duration>) {
        self.closer.set_lifetime(lifetime);
    }

    fn handle_sequence_request(&self, request: &Table) {
        let Some(seq_id) = request.get_table("_ctrl").and_then(|c| c.get_str("_seq")) else {
            return;
        };
        let seq_id = seq_id.to_string();
        let ended = request.get_table("_ctrl").map(|c| c.contains_key("_end")).unwrap_or(false);

        if ended {
            if let Some(mut seq) = self.sequences.lock().unwrap().remove(&seq_id) {
                seq.close();
            }
            return;
        }

        let mut sequences = self.sequences.lock().unwrap();
        let Some(seq) = sequences.get_mut(&seq_id) else {
            drop(sequences);
            let _ = self.reply_error(request, "unknown sequence");
            return;
        };
        let (data, done) = seq.next_message(request);
        if done {
            if let Some(mut seq) = sequences.remove(&seq_id) {
                seq.close();
            }
        }
        drop(sequences);
        let _ = self.write_sequence_reply(request, data, done);
    }

    fn handle_inbound(&self, message: Table, state: Option<State>) {
        if let Some(state) = state {
            state.complete(message);
            return;
        }

        match cmdchan_proto::kind(&message) {
            cmdchan_proto::Kind::Request => {
                let is_next = message.get_table("_data").and_then(|d| d.get_str("type")) == Some("next")
                    && message.get_table("_ctrl").map(|c| c.contains_key("_seq")).unwrap_or(false);
                if is_next {
                    self.handle_sequence_request(&message);
                    return;
                }
                let mut handled = false;
                if let Some(dispatcher) = self.dispatcher.clone() {
                    let arc_self = self.arc();
                    match dispatcher.dispatch(&arc_self, &message, DispatchKind::Request) {
                        Ok(claimed) => handled = claimed,
                        Err(e) => {
                            let _ = self.reply_error(&message, e.to_string());
                            handled = true;
                        }
                    }
                }
                if !handled {
                    let ty = message.get_table("_data").and_then(|d| d.get_str("type")).unwrap_or("?");
                    tracing::debug!(ty, "no handler claimed request, replying unknown request");
                    let _ = self.reply_error(&message, "unknown request");
                }
            }
            cmdchan_proto::Kind::Event => {
                if let Some(dispatcher) = self.dispatcher.clone() {
                    let arc_self = self.arc();
                    let _ = dispatcher.dispatch(&arc_self, &message, DispatchKind::Event);
                }
            }
            cmdchan_proto::Kind::Response => {
                // A reply with no waiting RequestState: the caller already
                // timed out, or this is a late duplicate. Not an error.
            }
        }
    }

    /// Shut down the socket, join both threads, and fail every
    /// outstanding and queued request with `Closing`. Runs exactly once,
    /// from the closer thread.
    fn do_close(&self) {
        tracing::info!(peer = ?self.peer_addr, "closing session");
        let _ = self.shutdown_sock.shutdown(std::net::Shutdown::Both);

        if let Some(handle) = self.reader_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        for (_, state) in self.outstanding.lock().unwrap().drain() {
            if let Some(state) = state {
                state.return_exception(SessionError::Closing);
            }
        }

        {
            let mut queue = self.write_queue.lock().unwrap();
            queue.push_back(WriteItem::Shutdown);
            self.wake_writer.notify_all();
        }

        if let Some(handle) = self.writer_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        {
            let mut queue = self.write_queue.lock().unwrap();
            while let Some(item) = queue.pop_front() {
                if let WriteItem::Message(_, Some(state)) = item {
                    state.return_exception(SessionError::Closing);
                }
            }
        }

        for (_, mut seq) in self.sequences.lock().unwrap().drain() {
            seq.close();
        }
    }
}

fn reader_loop(mut reader: cmdchan_proto::ConnectionReader<TcpStream, State>, session: Arc<Session>) {
    loop {
        match reader.read() {
            Ok((message, state)) => {
                session.closer.not_idle();
                session.handle_inbound(message, state);
            }
            Err(e) => {
                tracing::info!(error = %e, "reader thread exiting");
                break;
            }
        }
    }
    // EOF or a fatal protocol/read error: the connection is no longer
    // usable, so request an orderly close rather than leaving the session
    // looking alive with a dead reader.
    session.closer.request_close();
}

fn writer_loop(mut writer: cmdchan_proto::ConnectionWriter<TcpStream, State>, session: Arc<Session>) {
    let mut socket_error = false;
    loop {
        let item = {
            let mut queue = session.write_queue.lock().unwrap();
            while queue.is_empty() {
                queue = session.wake_writer.wait(queue).unwrap();
            }
            queue.pop_front().unwrap()
        };

        match item {
            WriteItem::Shutdown => break,
            WriteItem::Message(mut message, state) => {
                if let Err(e) = writer.write(&mut message, state.clone()) {
                    tracing::info!(error = %e, "writer thread exiting");
                    if let Some(state) = state {
                        state.return_exception(e.into());
                    }
                    socket_error = true;
                    break;
                }
                session.closer.not_idle();
            }
        }
    }
    // A socket error (as opposed to the `Shutdown` sentinel `do_close` sends
    // itself) means the transport is dead; request an orderly close so the
    // rest of the session unwinds instead of sitting idle.
    if socket_error {
        session.closer.request_close();
    }
}
