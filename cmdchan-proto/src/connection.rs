//! Connection: owns the transport, runs the nonce/encryption handshake,
//! and serializes/deserializes messages through the frame layer.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cmdchan_wire::{Table, Value};

use crate::error::ProtoError;
use crate::{frame, message};

/// Largest frame the connection will accept before even attempting to
/// decode it.
pub const MAX_WIRE_SIZE: usize = cmdchan_wire::MAX_WIRE_SIZE;

const U63_MAX: u64 = (1u64 << 63) - 1;

/// Client-side preference for whether a connection uses AES-256-CBC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EncryptionPolicy {
    Unencrypted,
    #[default]
    Desired,
    Required,
}

/// Invoked from `read`/`write` with the operation name (`"read"` or
/// `"write"`) and the message involved, for debugging/observability.
pub type Tracer = dyn Fn(&str, &Table) + Send + Sync;

fn trace(tracer: &Option<Arc<Tracer>>, op: &str, message: &Table) {
    if let Some(t) = tracer {
        t(op, message);
    }
}

fn get_nonce_field(ctrl: &Table, field: &str, zero_ok: bool) -> Result<u64, ProtoError> {
    let raw = ctrl
        .get_str(field)
        .ok_or_else(|| ProtoError::BadNoncing(format!("no {field} in _ctrl")))?;
    let value: u64 = raw
        .parse()
        .map_err(|_| ProtoError::BadNoncing(format!("{field} not an integer")))?;
    if value > U63_MAX {
        return Err(ProtoError::BadNoncing(format!(
            "{field} is not a 63-bit unsigned integer"
        )));
    }
    if value == 0 && !zero_ok {
        return Err(ProtoError::BadNoncing(format!("{field} is zero")));
    }
    Ok(value)
}

fn generate_nonce() -> Result<u64, ProtoError> {
    cmdchan_crypto::random_u63()
        .map_err(|e| ProtoError::BadNoncing(format!("could not generate a nonce: {e}")))
}

fn read_frame<T: Read>(
    transport: &mut T,
    secret: Option<&[u8]>,
    tracer: &Option<Arc<Tracer>>,
) -> Result<Table, ProtoError> {
    let mut len_buf = [0u8; 4];
    transport.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_WIRE_SIZE {
        return Err(ProtoError::MessageTooBig);
    }
    let mut body = vec![0u8; len];
    transport.read_exact(&mut body)?;
    let message = frame::from_wire(&body, secret)?;
    trace(tracer, "read", &message);
    Ok(message)
}

fn write_frame<T: Write>(
    transport: &mut T,
    message: &Table,
    secret: Option<&[u8]>,
    tracer: &Option<Arc<Tracer>>,
) -> Result<(), ProtoError> {
    let framed = frame::to_wire(message, secret)?;
    transport.write_all(&framed)?;
    trace(tracer, "write", message);
    Ok(())
}

/// A command-channel connection: a handshaken transport plus nonce/
/// sequence bookkeeping, generic over `S`, the caller-supplied state
/// stashed per outstanding request.
pub struct Connection<T, S = ()> {
    transport: T,
    secret: Option<Vec<u8>>,
    self_nonce: u64,
    self_next: u64,
    peer_nonce: u64,
    peer_next: u64,
    encrypted: bool,
    compressed: bool,
    closed: bool,
    tracer: Option<Arc<Tracer>>,
    outstanding: Arc<Mutex<HashMap<u64, Option<S>>>>,
}

impl<T: Read + Write, S> Connection<T, S> {
    /// Build a connection over an already-connected transport and perform
    /// the nonce/encryption handshake.
    ///
    /// `want_read` selects the passive side: if true, the handshake reads
    /// the peer's initial request first and mirrors it, instead of
    /// sending one.
    pub fn new(
        transport: T,
        secret: Option<Vec<u8>>,
        policy: EncryptionPolicy,
        want_read: bool,
        tracer: Option<Arc<Tracer>>,
    ) -> Result<Self, ProtoError> {
        let policy = if secret.is_none() && policy == EncryptionPolicy::Desired {
            EncryptionPolicy::Unencrypted
        } else {
            policy
        };

        let self_nonce = generate_nonce()?;
        let mut conn = Connection {
            transport,
            secret,
            self_nonce,
            self_next: 1,
            peer_nonce: 0,
            peer_next: 0,
            encrypted: false,
            compressed: false,
            closed: false,
            tracer,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
        };

        let initial_request = if want_read {
            let request = read_frame(&mut conn.transport, conn.secret.as_deref(), &conn.tracer)?;
            let ctrl = request
                .get_table("_ctrl")
                .ok_or_else(|| ProtoError::BadNoncing("initial request missing _ctrl".into()))?;
            if ctrl.contains_key("_rpl") {
                return Err(ProtoError::BadNoncing(
                    "cannot initialize nonce state from a reply".into(),
                ));
            }
            if ctrl.contains_key("_evt") {
                return Err(ProtoError::BadNoncing(
                    "cannot initialize nonce state from an event".into(),
                ));
            }
            if get_nonce_field(ctrl, "_pnon", true)? != 0 {
                return Err(ProtoError::BadNoncing(
                    "_pnon not zero in initial noncing request".into(),
                ));
            }
            conn.peer_nonce = get_nonce_field(ctrl, "_snon", false)?;
            conn.peer_next = get_nonce_field(ctrl, "_sseq", false)? + 1;
            Some(request)
        } else {
            None
        };

        conn.start_noncing(initial_request, policy)?;
        Ok(conn)
    }

    /// Connect to a TCP address and run the handshake as the active
    /// (client) side.
    pub fn connect(
        addr: std::net::SocketAddr,
        secret: Option<Vec<u8>>,
        policy: EncryptionPolicy,
        timeout: Option<Duration>,
        tracer: Option<Arc<Tracer>>,
    ) -> Result<Connection<TcpStream, S>, ProtoError> {
        let stream = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_nodelay(true).ok();
        tracing::info!(%addr, "connecting");
        Connection::new(stream, secret, policy, false, tracer)
    }

    fn start_noncing(
        &mut self,
        request: Option<Table>,
        policy: EncryptionPolicy,
    ) -> Result<(), ProtoError> {
        let mut encrypted = false;
        let mut compressed = false;

        let mut outbound = match &request {
            None => {
                let mut data = Table::new();
                data.insert("type", "version");
                let mut msg = message::request(data);
                if policy != EncryptionPolicy::Unencrypted {
                    if let Some(Value::Table(ctrl)) = msg.get_mut("_ctrl") {
                        ctrl.insert(
                            "_initenc",
                            Value::List(vec![Value::str("aes256z"), Value::str("aes256")]),
                        );
                    }
                }
                msg
            }
            Some(request) => {
                let mut response = message::reply_to(request, None);
                if policy != EncryptionPolicy::Unencrypted {
                    let offered: Vec<String> = request
                        .get_table("_ctrl")
                        .and_then(|c| c.get("_initenc"))
                        .and_then(Value::as_list)
                        .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
                        .unwrap_or_default();
                    if offered.iter().any(|a| a == "aes256z") {
                        if let Some(Value::Table(ctrl)) = response.get_mut("_ctrl") {
                            ctrl.insert("_encalg", "aes256z");
                        }
                        encrypted = true;
                        compressed = true;
                    } else if offered.iter().any(|a| a == "aes256") {
                        if let Some(Value::Table(ctrl)) = response.get_mut("_ctrl") {
                            ctrl.insert("_encalg", "aes256");
                        }
                        encrypted = true;
                    } else if policy == EncryptionPolicy::Required {
                        return Err(ProtoError::NotSecure);
                    }
                }
                response
            }
        };

        self.write(&mut outbound, None)?;

        if request.is_none() {
            let response = self.read_handshake_response(&outbound)?;
            let encalg = response.get_table("_ctrl").and_then(|c| c.get_str("_encalg"));
            match encalg {
                Some("aes256z") => {
                    encrypted = true;
                    compressed = true;
                }
                Some("aes256") => {
                    encrypted = true;
                }
                Some(_) => {
                    return Err(ProtoError::BadNoncing(
                        "peer specified an invalid _encalg".into(),
                    ));
                }
                None if policy == EncryptionPolicy::Unencrypted => {}
                None if policy == EncryptionPolicy::Required => return Err(ProtoError::NotSecure),
                None => {}
            }
        }

        self.encrypted = encrypted;
        self.compressed = compressed;
        tracing::debug!(
            self_nonce = self.self_nonce,
            peer_nonce = self.peer_nonce,
            encrypted,
            compressed,
            "handshake complete"
        );
        Ok(())
    }

    fn read_handshake_response(&mut self, request: &Table) -> Result<Table, ProtoError> {
        let (response, _state) = self.read()?;
        let ctrl = response
            .get_table("_ctrl")
            .ok_or(ProtoError::NotResponse)?;
        if !ctrl.contains_key("_rpl") {
            return Err(ProtoError::NotResponse);
        }
        let rseq = ctrl.get_str("_rseq");
        let sseq = request.get_table("_ctrl").and_then(|c| c.get_str("_sseq"));
        if rseq != sseq {
            return Err(ProtoError::BadResponse);
        }
        Ok(response)
    }

    fn noncify(&mut self, message: &mut Table, state: Option<S>) {
        if message.get_table("_ctrl").is_none() {
            message.insert("_ctrl", Table::new());
        }
        let is_request = {
            let ctrl = message.get_table("_ctrl").unwrap();
            !(ctrl.contains_key("_rpl") || ctrl.contains_key("_evt"))
        };

        if let Some(Value::Table(ctrl)) = message.get_mut("_ctrl") {
            ctrl.insert("_snon", self.self_nonce.to_string());
            ctrl.insert("_sseq", self.self_next.to_string());
            ctrl.insert("_pnon", self.peer_nonce.to_string());
            if self.encrypted {
                ctrl.insert("_enc", "1");
            } else {
                ctrl.remove("_enc");
            }
            if self.compressed {
                ctrl.insert("_comp", "1");
            } else {
                ctrl.remove("_comp");
            }
        }

        if is_request {
            self.outstanding
                .lock()
                .unwrap()
                .insert(self.self_next, state);
        }
        self.self_next += 1;
    }

    fn check(&mut self, message: &Table) -> Result<Option<S>, ProtoError> {
        let ctrl = message
            .get_table("_ctrl")
            .ok_or_else(|| ProtoError::BadNoncing("message missing _ctrl".into()))?;

        if self.encrypted && !ctrl.contains_key("_enc") {
            return Err(ProtoError::BadNoncing(
                "got an unencrypted message on an encrypted connection".into(),
            ));
        }

        let pnon = get_nonce_field(ctrl, "_pnon", true)?;
        if pnon != self.self_nonce {
            return Err(ProtoError::BadNoncing(format!(
                "_pnon does not match ({pnon} != {})",
                self.self_nonce
            )));
        }

        let snon = get_nonce_field(ctrl, "_snon", true)?;
        if self.peer_nonce == 0 {
            self.peer_nonce = snon;
        } else if snon != self.peer_nonce {
            return Err(ProtoError::BadNoncing(format!(
                "_snon does not match ({snon} != {})",
                self.peer_nonce
            )));
        }

        let sseq = get_nonce_field(ctrl, "_sseq", true)?;
        if self.peer_next == 0 {
            self.peer_next = sseq;
        } else if sseq != self.peer_next {
            return Err(ProtoError::BadNoncing(format!(
                "_sseq does not match ({sseq} != {})",
                self.peer_next
            )));
        }
        self.peer_next += 1;

        if ctrl.contains_key("_rpl") {
            let rseq: u64 = ctrl
                .get_str("_rseq")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtoError::BadNoncing("_rseq not an integer".into()))?;
            let mut outstanding = self.outstanding.lock().unwrap();
            match outstanding.remove(&rseq) {
                Some(state) => Ok(state),
                None => Err(ProtoError::BadNoncing(format!(
                    "_rseq {rseq} is not outstanding"
                ))),
            }
        } else {
            Ok(None)
        }
    }

    /// Read one message, verifying its nonce/sequence fields. Returns the
    /// message and, if it was a response clearing an outstanding entry,
    /// that entry's state.
    pub fn read(&mut self) -> Result<(Table, Option<S>), ProtoError> {
        let message = read_frame(&mut self.transport, self.secret.as_deref(), &self.tracer)?;
        let state = self.check(&message).inspect_err(|e| {
            if matches!(e, ProtoError::BadNoncing(_)) {
                tracing::warn!(error = %e, "inbound message failed protocol invariant check");
            }
        })?;
        Ok((message, state))
    }

    /// Write one message, stamping it with nonce/sequence fields first. If
    /// `message` is a request, `state` is recorded against its `_sseq`
    /// until the matching response clears it.
    pub fn write(&mut self, message: &mut Table, state: Option<S>) -> Result<(), ProtoError> {
        self.noncify(message, state);
        write_frame(&mut self.transport, message, self.secret.as_deref(), &self.tracer)
    }

    /// Remove and return every outstanding entry, e.g. to fail them all
    /// with `Closing` when a session shuts down.
    pub fn take_outstanding(&mut self) -> HashMap<u64, Option<S>> {
        std::mem::take(&mut *self.outstanding.lock().unwrap())
    }

    /// A handle to the outstanding-request table, shared with a split-off
    /// reader/writer pair (see [`IntoDuplexHalves`]).
    pub fn outstanding_handle(&self) -> Arc<Mutex<HashMap<u64, Option<S>>>> {
        Arc::clone(&self.outstanding)
    }

    pub fn self_nonce(&self) -> u64 {
        self.self_nonce
    }

    pub fn peer_nonce(&self) -> u64 {
        self.peer_nonce
    }

    pub fn self_next(&self) -> u64 {
        self.self_next
    }

    pub fn peer_next(&self) -> u64 {
        self.peer_next
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn secret(&self) -> Option<&[u8]> {
        self.secret.as_deref()
    }

    pub fn tracer(&self) -> Option<Arc<Tracer>> {
        self.tracer.clone()
    }
}

impl<S> Connection<TcpStream, S> {
    /// Shut down both directions of the socket without closing the file
    /// descriptor, to unblock a reader thread blocked in `recv`.
    pub fn shutdown(&self) -> std::io::Result<()> {
        self.transport.shutdown(std::net::Shutdown::Both)
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.peer_addr()
    }

    /// Clone the underlying socket, e.g. so a session can keep a handle
    /// dedicated to calling `shutdown` from its closer without fighting the
    /// reader/writer halves for ownership of `transport`.
    pub fn try_clone_transport(&self) -> std::io::Result<TcpStream> {
        self.transport.try_clone()
    }

    /// Split a handshaken TCP connection into independently owned reader
    /// and writer halves for a threaded session: each clones the
    /// underlying file descriptor (see [`TcpStream::try_clone`]) and they
    /// share only the outstanding-request table's mutex, per the
    /// concurrency model's "no whole-connection lock" rule.
    pub fn into_halves(self) -> std::io::Result<(ConnectionReader<TcpStream, S>, ConnectionWriter<TcpStream, S>)> {
        let writer_io = self.transport.try_clone()?;
        let reader_io = self.transport;
        Ok((
            ConnectionReader {
                transport: reader_io,
                secret: self.secret.clone(),
                self_nonce: self.self_nonce,
                peer_nonce: self.peer_nonce,
                peer_next: self.peer_next,
                encrypted: self.encrypted,
                tracer: self.tracer.clone(),
                outstanding: Arc::clone(&self.outstanding),
            },
            ConnectionWriter {
                transport: writer_io,
                secret: self.secret,
                self_nonce: self.self_nonce,
                self_next: self.self_next,
                peer_nonce: self.peer_nonce,
                encrypted: self.encrypted,
                compressed: self.compressed,
                tracer: self.tracer,
                outstanding: Arc::clone(&self.outstanding),
            },
        ))
    }
}

impl<T, S> Drop for Connection<T, S> {
    fn drop(&mut self) {
        self.closed = true;
    }
}

/// The read-only half of a split connection: owns the read direction of
/// the socket, `peer_next` (the only nonce field it mutates), and a
/// handle to the shared outstanding table.
pub struct ConnectionReader<R, S> {
    transport: R,
    secret: Option<Vec<u8>>,
    self_nonce: u64,
    peer_nonce: u64,
    peer_next: u64,
    encrypted: bool,
    tracer: Option<Arc<Tracer>>,
    outstanding: Arc<Mutex<HashMap<u64, Option<S>>>>,
}

impl<R: Read, S> ConnectionReader<R, S> {
    /// Read and verify one message, as [`Connection::read`].
    pub fn read(&mut self) -> Result<(Table, Option<S>), ProtoError> {
        self.read_checked().inspect_err(|e| {
            if matches!(e, ProtoError::BadNoncing(_)) {
                tracing::warn!(error = %e, "inbound message failed protocol invariant check");
            }
        })
    }

    fn read_checked(&mut self) -> Result<(Table, Option<S>), ProtoError> {
        let message = read_frame(&mut self.transport, self.secret.as_deref(), &self.tracer)?;

        let ctrl = message
            .get_table("_ctrl")
            .ok_or_else(|| ProtoError::BadNoncing("message missing _ctrl".into()))?;
        if self.encrypted && !ctrl.contains_key("_enc") {
            return Err(ProtoError::BadNoncing(
                "got an unencrypted message on an encrypted connection".into(),
            ));
        }
        let pnon = get_nonce_field(ctrl, "_pnon", true)?;
        if pnon != self.self_nonce {
            return Err(ProtoError::BadNoncing(format!(
                "_pnon does not match ({pnon} != {})",
                self.self_nonce
            )));
        }
        let snon = get_nonce_field(ctrl, "_snon", true)?;
        if snon != self.peer_nonce {
            return Err(ProtoError::BadNoncing(format!(
                "_snon does not match ({snon} != {})",
                self.peer_nonce
            )));
        }
        let sseq = get_nonce_field(ctrl, "_sseq", true)?;
        if sseq != self.peer_next {
            return Err(ProtoError::BadNoncing(format!(
                "_sseq does not match ({sseq} != {})",
                self.peer_next
            )));
        }
        self.peer_next += 1;

        let state = if ctrl.contains_key("_rpl") {
            let rseq: u64 = ctrl
                .get_str("_rseq")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtoError::BadNoncing("_rseq not an integer".into()))?;
            let mut outstanding = self.outstanding.lock().unwrap();
            match outstanding.remove(&rseq) {
                Some(state) => state,
                None => {
                    return Err(ProtoError::BadNoncing(format!(
                        "_rseq {rseq} is not outstanding"
                    )))
                }
            }
        } else {
            None
        };

        Ok((message, state))
    }

    pub fn peer_next(&self) -> u64 {
        self.peer_next
    }
}

/// The write-only half of a split connection: owns the write direction
/// of the socket and `self_next`, the only nonce field it mutates.
pub struct ConnectionWriter<W, S> {
    transport: W,
    secret: Option<Vec<u8>>,
    self_nonce: u64,
    self_next: u64,
    peer_nonce: u64,
    encrypted: bool,
    compressed: bool,
    tracer: Option<Arc<Tracer>>,
    outstanding: Arc<Mutex<HashMap<u64, Option<S>>>>,
}

impl<W: Write, S> ConnectionWriter<W, S> {
    /// Stamp and write one message, as [`Connection::write`].
    pub fn write(&mut self, message: &mut Table, state: Option<S>) -> Result<(), ProtoError> {
        if message.get_table("_ctrl").is_none() {
            message.insert("_ctrl", Table::new());
        }
        let is_request = {
            let ctrl = message.get_table("_ctrl").unwrap();
            !(ctrl.contains_key("_rpl") || ctrl.contains_key("_evt"))
        };
        if let Some(Value::Table(ctrl)) = message.get_mut("_ctrl") {
            ctrl.insert("_snon", self.self_nonce.to_string());
            ctrl.insert("_sseq", self.self_next.to_string());
            ctrl.insert("_pnon", self.peer_nonce.to_string());
            if self.encrypted {
                ctrl.insert("_enc", "1");
            } else {
                ctrl.remove("_enc");
            }
            if self.compressed {
                ctrl.insert("_comp", "1");
            } else {
                ctrl.remove("_comp");
            }
        }
        if is_request {
            self.outstanding
                .lock()
                .unwrap()
                .insert(self.self_next, state);
        }
        self.self_next += 1;

        write_frame(&mut self.transport, message, self.secret.as_deref(), &self.tracer)
    }

    /// Fail every outstanding request with the given state-consuming
    /// closure (used by a session's orderly close to deliver `Closing`).
    pub fn drain_outstanding(&self) -> HashMap<u64, Option<S>> {
        std::mem::take(&mut *self.outstanding.lock().unwrap())
    }

    pub fn self_next(&self) -> u64 {
        self.self_next
    }
}
