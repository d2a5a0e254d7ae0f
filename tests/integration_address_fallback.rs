//! Address-list fallback: a dead TCP leg falls through to a working unix
//! leg, and exhaustion reports the last dial error.

mod common;

use std::os::unix::net::UnixListener;
use std::time::Duration;

use anyhow::Result;
use buslane::{Connection, Error, State};
use common::{init_logging, pump_until, FakeBroker};

#[test]
fn dead_tcp_leg_falls_through_to_unix() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let socket_path = dir.path().join("bus");
    let listener = UnixListener::bind(&socket_path)?;

    let broker_thread = std::thread::spawn(move || {
        let (stream, _addr) = listener.accept().expect("accept");
        let mut broker = FakeBroker::from_stream(stream);
        broker.establish(":1.60");
        broker
    });

    let address = format!(
        "tcp:host=unreachable.invalid,port=1;unix:path={}",
        socket_path.display()
    );
    let mut conn = Connection::new();
    conn.set_address(&address)?;
    conn.set_bus_client(true)?;
    conn.start()?;

    pump_until(&mut conn, Duration::from_secs(5), |c| {
        c.state() == State::Running
    });

    assert_eq!(conn.unique_name(), Some(":1.60"));
    // The TCP leg's error is only reported when every leg fails.
    assert!(conn.last_connect_error().is_none());
    broker_thread.join().unwrap();
    Ok(())
}

#[test]
fn exhausted_list_reports_the_last_error() {
    let address = "tcp:host=unreachable.invalid,port=1;unix:path=/nonexistent/surely/bus";
    let mut conn = Connection::new();
    conn.set_address(address).unwrap();
    conn.set_bus_client(true).unwrap();

    match conn.start() {
        Err(Error::Transport(_)) => {}
        other => panic!("expected transport error, got {:?}", other),
    }
    assert_eq!(conn.state(), State::Closed);
}

#[test]
fn unknown_transports_are_skipped_entirely() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("bus");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let broker_thread = std::thread::spawn(move || {
        let (stream, _addr) = listener.accept().expect("accept");
        let mut broker = FakeBroker::from_stream(stream);
        broker.establish(":1.61");
        broker
    });

    let address = format!(
        "autolaunch:scope=user;;unix:path={}",
        socket_path.display()
    );
    let mut conn = Connection::new();
    conn.set_address(&address).unwrap();
    conn.set_bus_client(true).unwrap();
    conn.start().unwrap();

    pump_until(&mut conn, Duration::from_secs(5), |c| {
        c.state() == State::Running
    });
    assert_eq!(conn.unique_name(), Some(":1.61"));
    broker_thread.join().unwrap();
}
