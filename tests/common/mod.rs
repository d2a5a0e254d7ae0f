//! Shared test fixture: a blocking fake broker on one end of a socketpair.
//!
//! The broker side uses plain blocking reads so test threads stay simple;
//! the connection under test gets the non-blocking end through
//! `Connection::set_fd`.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Once;

use buslane::message::Message;
use buslane::Connection;

pub const SERVER_GUID: &str = "0123456789abcdef0123456789abcdef";

static LOGGING: Once = Once::new();

/// Install a subscriber once so `RUST_LOG=buslane=debug` shows engine
/// activity during test runs.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct FakeBroker {
    stream: UnixStream,
    next_serial: u32,
}

impl FakeBroker {
    /// Returns the broker plus the client-side fd to hand to `set_fd`.
    pub fn pair() -> (FakeBroker, OwnedFd) {
        let (broker, client) = UnixStream::pair().expect("socketpair");
        (Self::from_stream(broker), OwnedFd::from(client))
    }

    /// Wrap an accepted listener stream, for tests that dial a real
    /// socket path.
    pub fn from_stream(stream: UnixStream) -> FakeBroker {
        FakeBroker {
            stream,
            next_serial: 0,
        }
    }

    /// A connection already configured as a bus client on our socketpair.
    pub fn client_connection() -> (FakeBroker, Connection) {
        init_logging();
        let (broker, client_fd) = Self::pair();
        let mut conn = Connection::new();
        conn.set_fd(client_fd, None).expect("set_fd");
        conn.set_bus_client(true).expect("set_bus_client");
        (broker, conn)
    }

    fn read_line(&mut self) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).expect("read auth byte");
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                line.truncate(line.len() - 2);
                return String::from_utf8(line).expect("ascii auth line");
            }
        }
    }

    /// Serve the server side of the SASL handshake.
    pub fn accept_auth(&mut self) {
        let mut nul = [0u8; 1];
        self.stream.read_exact(&mut nul).expect("leading NUL");
        assert_eq!(nul[0], 0, "client must lead with a NUL byte");

        let auth = self.read_line();
        assert!(
            auth.starts_with("AUTH EXTERNAL") || auth.starts_with("AUTH ANONYMOUS"),
            "unexpected auth line: {auth}"
        );
        self.stream
            .write_all(format!("OK {SERVER_GUID}\r\n").as_bytes())
            .expect("write OK");

        loop {
            match self.read_line().as_str() {
                "NEGOTIATE_UNIX_FD" => {
                    self.stream
                        .write_all(b"AGREE_UNIX_FD\r\n")
                        .expect("write AGREE");
                }
                "BEGIN" => return,
                other => panic!("unexpected handshake line: {other}"),
            }
        }
    }

    /// Read one complete message frame.
    pub fn read_frame(&mut self) -> Message {
        let mut buf = Vec::new();
        loop {
            if let Some(total) = Message::required_size(&buf).expect("frame header") {
                if buf.len() >= total {
                    return Message::from_wire(buf, Vec::new()).expect("parse frame");
                }
            }
            let mut chunk = [0u8; 512];
            let n = self.stream.read(&mut chunk).expect("read frame bytes");
            assert!(n > 0, "client hung up mid-frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Seal with a broker-side serial and write the frame out.
    pub fn send_frame(&mut self, mut msg: Message) {
        self.next_serial += 1;
        msg.seal(self.next_serial).expect("seal");
        self.stream
            .write_all(msg.wire().expect("wire"))
            .expect("write frame");
    }

    /// Answer the Hello call with `unique_name`.
    pub fn expect_hello(&mut self, unique_name: &str) {
        let hello = self.read_frame();
        assert_eq!(hello.member(), Some("Hello"), "first call must be Hello");
        let mut reply = Message::method_return(&hello).expect("hello reply");
        reply.append_string(unique_name).expect("unique name");
        self.send_frame(reply);
    }

    /// Run the full session setup: auth plus Hello.
    pub fn establish(&mut self, unique_name: &str) {
        self.accept_auth();
        self.expect_hello(unique_name);
    }
}

/// Pump `process`/`wait` until `done` says stop or `max` elapses.
pub fn pump_until(
    conn: &mut Connection,
    max: std::time::Duration,
    mut done: impl FnMut(&mut Connection) -> bool,
) {
    let start = std::time::Instant::now();
    loop {
        if done(conn) {
            return;
        }
        assert!(start.elapsed() < max, "connection made no progress in {max:?}");
        match conn.process() {
            Ok(true) => continue,
            Ok(false) => {
                conn.wait(Some(std::time::Duration::from_millis(50))).expect("wait");
            }
            Err(e) => panic!("process failed: {e}"),
        }
    }
}
