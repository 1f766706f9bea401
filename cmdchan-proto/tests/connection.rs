//! Handshake and nonce-invariant scenarios driven over real loopback TCP
//! sockets (two `Connection`s dialing each other on `127.0.0.1`).

use std::io::Write;
use std::net::{TcpListener, TcpStream};

use cmdchan_proto::{Connection, EncryptionPolicy, ProtoError};
use cmdchan_wire::Table;

fn pair(secret: Option<&[u8]>) -> (Connection<TcpStream, ()>, Connection<TcpStream, ()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let secret_owned = secret.map(|s| s.to_vec());
    let server_secret = secret_owned.clone();
    let server_thread = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        Connection::<TcpStream, ()>::new(stream, server_secret, EncryptionPolicy::Desired, true, None).unwrap()
    });
    let stream = TcpStream::connect(addr).unwrap();
    let client =
        Connection::<TcpStream, ()>::new(stream, secret_owned, EncryptionPolicy::Desired, false, None).unwrap();
    let server = server_thread.join().unwrap();
    (client, server)
}

#[test]
fn unencrypted_handshake_establishes_nonces() {
    let (client, server) = pair(None);
    assert!(!client.is_encrypted());
    assert!(!server.is_encrypted());
    assert_eq!(client.self_next(), 2);
    assert_eq!(server.peer_next(), 2);
    assert_eq!(client.peer_nonce(), server.self_nonce());
    assert_eq!(server.peer_nonce(), client.self_nonce());
}

#[test]
fn shared_secret_negotiates_aes256_with_compression() {
    let (client, server) = pair(Some(b"s3cret"));
    assert!(client.is_encrypted());
    assert!(client.is_compressed());
    assert!(server.is_encrypted());
    assert!(server.is_compressed());
}

#[test]
fn required_policy_without_shared_secret_fails_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_thread = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        // The peer has no secret either, so it never offers `_initenc`.
        Connection::<TcpStream, ()>::new(stream, None, EncryptionPolicy::Unencrypted, true, None)
    });
    let stream = TcpStream::connect(addr).unwrap();
    let result = Connection::<TcpStream, ()>::new(stream, None, EncryptionPolicy::Required, false, None);
    assert!(matches!(result, Err(ProtoError::NotSecure)));
    let _ = server_thread.join();
}

#[test]
fn forged_peer_nonce_is_rejected_as_bad_noncing() {
    let (mut client, server) = pair(None);

    // Hand-craft a frame on the peer's raw socket with a `_pnon` that does
    // not match the client's own nonce, bypassing `Connection::write`
    // (which would never let a caller forge these fields itself).
    let mut raw = server.try_clone_transport().unwrap();
    let mut ctrl = Table::new();
    ctrl.insert("_snon", server.self_nonce().to_string());
    ctrl.insert("_sseq", server.self_next().to_string());
    ctrl.insert("_pnon", (client.self_nonce() ^ 1).to_string());
    let mut data = Table::new();
    data.insert("type", "ping");
    let mut forged = Table::new();
    forged.insert("_ctrl", ctrl);
    forged.insert("_data", data);

    let framed = cmdchan_proto::frame::to_wire(&forged, None).unwrap();
    raw.write_all(&framed).unwrap();

    let err = client.read().unwrap_err();
    assert!(matches!(err, ProtoError::BadNoncing(_)));
}
