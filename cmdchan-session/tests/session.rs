//! End-to-end session scenarios driven over real loopback TCP sockets: one
//! side is a full `Session` (reader/writer threads, dispatcher, sequences),
//! the other is a hand-driven `Connection` playing the role of the peer, so
//! each test scripts exactly the frames the peer sends back.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use cmdchan_proto::{reply_to, Connection, EncryptionPolicy};
use cmdchan_session::{Dispatcher, Kind, Selector, Session, SessionError};
use cmdchan_wire::{Table, Value};

fn connect_pair() -> (Arc<Session>, Connection<TcpStream, ()>) {
    connect_pair_with(None)
}

fn connect_pair_with(dispatcher: Option<Arc<Dispatcher>>) -> (Arc<Session>, Connection<TcpStream, ()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_thread = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        Connection::<TcpStream, ()>::new(stream, None, EncryptionPolicy::Unencrypted, true, None).unwrap()
    });
    let client = Session::connect(addr, None, EncryptionPolicy::Unencrypted, None, None, dispatcher).unwrap();
    let server = server_thread.join().unwrap();
    (client, server)
}

#[test]
fn tell_round_trips_through_a_handshaken_session() {
    let (client, mut server) = connect_pair();
    let server_thread = std::thread::spawn(move || {
        let (req, _) = server.read().unwrap();
        assert_eq!(req.get_table("_data").unwrap().get_str("type"), Some("version"));
        let mut resp = reply_to(&req, None);
        if let Some(Value::Table(data)) = resp.get_mut("_data") {
            data.insert("ok", "1");
        }
        server.write(&mut resp, None).unwrap();
    });

    let response = client.tell("version", Some(Duration::from_secs(2))).unwrap();
    assert_eq!(response.get_table("_data").unwrap().get_str("ok"), Some("1"));

    server_thread.join().unwrap();
    client.close(Some(Duration::from_secs(2)));
}

#[test]
fn tell_raises_error_from_data_err_field() {
    let (client, mut server) = connect_pair();
    let server_thread = std::thread::spawn(move || {
        let (req, _) = server.read().unwrap();
        let mut resp = reply_to(&req, None);
        if let Some(Value::Table(data)) = resp.get_mut("_data") {
            data.insert("err", "no such foo");
        }
        server.write(&mut resp, None).unwrap();
    });

    let err = client.tell("foo", Some(Duration::from_secs(2))).unwrap_err();
    match err {
        SessionError::Error(msg) => assert_eq!(msg, "no such foo"),
        other => panic!("expected Error(\"no such foo\"), got {other:?}"),
    }

    server_thread.join().unwrap();
    client.close(Some(Duration::from_secs(2)));
}

#[test]
fn sequence_iteration_delivers_a_batch_then_terminates() {
    let (client, mut server) = connect_pair();
    let server_thread = std::thread::spawn(move || {
        let (req, _) = server.read().unwrap();
        assert_eq!(req.get_table("_data").unwrap().get_str("type"), Some("list"));

        let mut resp = reply_to(&req, None);
        if let Some(Value::Table(ctrl)) = resp.get_mut("_ctrl") {
            ctrl.insert("_more", "1");
            ctrl.insert("_batch", "1");
            ctrl.insert("_seq", "7");
        }
        let mut d1 = Table::new();
        d1.insert("name", "a.example.");
        let mut d2 = Table::new();
        d2.insert("name", "b.example.");
        let mut d3 = Table::new();
        d3.insert("name", "c.example.");
        let mut data = Table::new();
        data.insert("list", Value::List(vec![Value::Table(d1), Value::Table(d2), Value::Table(d3)]));
        resp.insert("_data", data);
        server.write(&mut resp, None).unwrap();

        let (next_req, _) = server.read().unwrap();
        assert_eq!(next_req.get_table("_data").unwrap().get_str("type"), Some("next"));
        assert_eq!(next_req.get_table("_ctrl").unwrap().get_str("_seq"), Some("7"));
        assert_eq!(next_req.get_table("_ctrl").unwrap().get_str("_num"), Some("3"));

        let mut terminal = reply_to(&next_req, None);
        server.write(&mut terminal, None).unwrap();
    });

    let items: Vec<Table> = client
        .sequence("list", 3, Some(Duration::from_secs(2)))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(items.len(), 3);
    assert_eq!(items[0].get_str("name"), Some("a.example."));
    assert_eq!(items[1].get_str("name"), Some("b.example."));
    assert_eq!(items[2].get_str("name"), Some("c.example."));

    server_thread.join().unwrap();
    client.close(Some(Duration::from_secs(2)));
}

#[test]
fn sequence_without_batch_control_omits_num_on_followup() {
    let (client, mut server) = connect_pair();
    let server_thread = std::thread::spawn(move || {
        let (req, _) = server.read().unwrap();
        assert_eq!(req.get_table("_data").unwrap().get_str("type"), Some("list"));

        // No `_batch` on this response, even though the client asked for a
        // batch size > 0: the follow-up must not carry `_ctrl._num`.
        let mut resp = reply_to(&req, None);
        if let Some(Value::Table(ctrl)) = resp.get_mut("_ctrl") {
            ctrl.insert("_more", "1");
            ctrl.insert("_seq", "8");
        }
        let mut data = Table::new();
        data.insert("name", "a.example.");
        resp.insert("_data", data);
        server.write(&mut resp, None).unwrap();

        let (next_req, _) = server.read().unwrap();
        assert_eq!(next_req.get_table("_data").unwrap().get_str("type"), Some("next"));
        assert_eq!(next_req.get_table("_ctrl").unwrap().get_str("_seq"), Some("8"));
        assert_eq!(next_req.get_table("_ctrl").unwrap().get_str("_num"), None);

        let mut terminal = reply_to(&next_req, None);
        server.write(&mut terminal, None).unwrap();
    });

    let items: Vec<Table> = client
        .sequence("list", 3, Some(Duration::from_secs(2)))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].get_str("name"), Some("a.example."));

    server_thread.join().unwrap();
    client.close(Some(Duration::from_secs(2)));
}

#[test]
fn sequence_close_sends_end_cancellation() {
    let (client, mut server) = connect_pair();
    let server_thread = std::thread::spawn(move || {
        let (req, _) = server.read().unwrap();
        let mut resp = reply_to(&req, None);
        if let Some(Value::Table(ctrl)) = resp.get_mut("_ctrl") {
            ctrl.insert("_more", "1");
            ctrl.insert("_seq", "9");
        }
        let mut data = Table::new();
        data.insert("name", "a.example.");
        resp.insert("_data", data);
        server.write(&mut resp, None).unwrap();

        let (cancel_req, _) = server.read().unwrap();
        assert_eq!(cancel_req.get_table("_ctrl").unwrap().get_str("_end"), Some("1"));
        let mut terminal = reply_to(&cancel_req, None);
        server.write(&mut terminal, None).unwrap();
    });

    let mut reader = client.sequence("list", 0, Some(Duration::from_secs(2)));
    let first = reader.next().unwrap().unwrap();
    assert_eq!(first.get_str("name"), Some("a.example."));
    reader.close();

    server_thread.join().unwrap();
    client.close(Some(Duration::from_secs(2)));
}

#[test]
fn close_cancels_every_in_flight_request() {
    let (client, server) = connect_pair();
    // The peer just parks: the point of this scenario is that `close()`
    // unblocks the callers without any response ever arriving.
    let hold = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        drop(server);
    });

    let a = client.ask("a", true, false).unwrap();
    let b = client.ask("b", true, false).unwrap();
    let c = client.ask("c", true, false).unwrap();

    client.close(Some(Duration::from_secs(2)));

    for state in [a, b, c] {
        match state.get_response(Some(Duration::from_millis(50))) {
            Err(SessionError::Closing) => {}
            other => panic!("expected Closing, got {other:?}"),
        }
    }

    let _ = hold.join();
}

#[test]
fn dispatcher_synthesizes_unknown_command_for_unmatched_object_method() {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.on(Kind::Request, Selector::Type("zone.list".into()), |_session, _msg, _kind| Ok(false));

    let (client, mut server) = connect_pair_with(Some(dispatcher));
    let server_thread = std::thread::spawn(move || {
        let mut ctrl = Table::new();
        let mut data = Table::new();
        data.insert("type", "zone.transfer");
        let mut request = Table::new();
        request.insert("_ctrl", std::mem::take(&mut ctrl));
        request.insert("_data", data);
        server.write(&mut request, None).unwrap();

        let (response, _) = server.read().unwrap();
        response
    });

    // Give the server time to send its request and read the reply.
    std::thread::sleep(Duration::from_millis(100));
    let response = server_thread.join().unwrap();
    assert_eq!(
        response.get_table("_data").unwrap().get_str("err"),
        Some("unknown command 'transfer' on object 'zone'")
    );

    client.close(Some(Duration::from_secs(2)));
}
