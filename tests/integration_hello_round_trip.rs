//! Session establishment over a socketpair: SASL handshake, Hello
//! round-trip, unique-name assignment, and the built-in peer interface.

mod common;

use std::time::Duration;

use buslane::message::{names, Message, MessageType};
use buslane::{Error, State};
use common::{pump_until, FakeBroker};

#[test]
fn hello_assigns_unique_name() {
    let (mut broker, mut conn) = FakeBroker::client_connection();

    let broker_thread = std::thread::spawn(move || {
        broker.establish(":1.42");
        broker
    });

    conn.start().unwrap();
    pump_until(&mut conn, Duration::from_secs(5), |c| {
        c.state() == State::Running
    });

    assert_eq!(conn.state(), State::Running);
    assert_eq!(conn.unique_name(), Some(":1.42"));
    assert_eq!(
        conn.server_id().unwrap().simple().to_string(),
        common::SERVER_GUID
    );
    assert!(conn.can_send_fds().unwrap());

    broker_thread.join().unwrap();
}

#[test]
fn message_preceding_hello_reply_closes_the_connection() {
    let (mut broker, mut conn) = FakeBroker::client_connection();

    let broker_thread = std::thread::spawn(move || {
        broker.accept_auth();
        let _hello = broker.read_frame();
        // Push an unrelated signal before answering Hello.
        let rogue = Message::signal("/", "org.example.Rogue", "Boo").unwrap();
        broker.send_frame(rogue);
        broker
    });

    conn.start().unwrap();

    let start = std::time::Instant::now();
    let err = loop {
        match conn.process() {
            Ok(_) => {
                if start.elapsed() > Duration::from_secs(5) {
                    panic!("connection never noticed the rogue message");
                }
                let _ = conn.wait(Some(Duration::from_millis(20)));
            }
            Err(e) => break e,
        }
    };

    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    assert_eq!(conn.state(), State::Closed);
    broker_thread.join().unwrap();
}

#[test]
fn builtin_peer_ping_gets_an_empty_return() {
    let (mut broker, mut conn) = FakeBroker::client_connection();

    let broker_thread = std::thread::spawn(move || {
        broker.establish(":1.7");
        let ping = Message::method_call("", "/", names::PEER_INTERFACE, "Ping").unwrap();
        broker.send_frame(ping);
        broker.read_frame()
    });

    conn.start().unwrap();
    pump_until(&mut conn, Duration::from_secs(5), |_| {
        broker_thread.is_finished()
    });

    let reply = broker_thread.join().unwrap();
    assert_eq!(reply.message_type(), MessageType::MethodReturn);
    // The Hello call took the broker's serial 1, so the Ping carried 2.
    assert_eq!(reply.reply_serial(), Some(2));
    assert_eq!(reply.signature(), "");
}

#[test]
fn builtin_unknown_member_is_rejected() {
    let (mut broker, mut conn) = FakeBroker::client_connection();

    let broker_thread = std::thread::spawn(move || {
        broker.establish(":1.8");
        let call = Message::method_call("", "/", names::PEER_INTERFACE, "Teleport").unwrap();
        broker.send_frame(call);
        broker.read_frame()
    });

    conn.start().unwrap();
    pump_until(&mut conn, Duration::from_secs(5), |_| {
        broker_thread.is_finished()
    });

    let reply = broker_thread.join().unwrap();
    assert_eq!(reply.message_type(), MessageType::MethodError);
    assert_eq!(reply.error_name(), Some(names::ERROR_UNKNOWN_METHOD));
}

#[test]
fn unclaimed_method_call_gets_unknown_object() {
    let (mut broker, mut conn) = FakeBroker::client_connection();

    let broker_thread = std::thread::spawn(move || {
        broker.establish(":1.9");
        let call =
            Message::method_call("", "/no/such/object", "org.example.Iface", "Frob").unwrap();
        broker.send_frame(call);
        broker.read_frame()
    });

    conn.start().unwrap();
    pump_until(&mut conn, Duration::from_secs(5), |_| {
        broker_thread.is_finished()
    });

    let reply = broker_thread.join().unwrap();
    assert_eq!(reply.message_type(), MessageType::MethodError);
    assert_eq!(reply.error_name(), Some(names::ERROR_UNKNOWN_OBJECT));
}
