//! # Authentication Handshake
//!
//! The client side of the text-line handshake stream transports run before
//! message framing starts: a single NUL byte, `AUTH EXTERNAL` with the uid
//! in hex (or `AUTH ANONYMOUS`), the broker's `OK <guid>`, an optional
//! `NEGOTIATE_UNIX_FD` round, then `BEGIN`.
//!
//! The machine is fully non-blocking: [`AuthClient::step`] makes as much
//! progress as the socket allows and reports `Pending` when it would block.
//! A broker that rejects fd passing does not fail the handshake, it just
//! leaves the connection without fd support. A deadline fixed at start time
//! lets callers abandon a stuck handshake.

use std::os::fd::RawFd;
use std::time::Instant;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::reply::DEFAULT_CALL_TIMEOUT;
use crate::socket_io::StreamIo;

/// What a [`AuthClient::step`] call achieved.
#[derive(Debug)]
pub enum AuthProgress {
    /// Handshake still in flight; re-enter on fd readiness.
    Pending,
    /// Handshake finished; framing may start.
    Done {
        server_id: Option<Uuid>,
        can_fds: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    SendingAuth,
    AwaitingOk,
    SendingNegotiate,
    AwaitingAgree,
    SendingBegin,
    Done,
}

/// Client authentication state machine.
pub struct AuthClient {
    state: AuthState,
    outbuf: Vec<u8>,
    cursor: usize,
    negotiate_fds: bool,
    server_id: Option<Uuid>,
    can_fds: bool,
    deadline: Instant,
}

impl AuthClient {
    /// Start a handshake. The first output (NUL + AUTH line) is queued
    /// immediately; nothing touches the socket until [`step`].
    ///
    /// [`step`]: AuthClient::step
    pub fn new(anonymous: bool, negotiate_fds: bool) -> Self {
        let mut outbuf = vec![0u8];
        if anonymous {
            outbuf.extend_from_slice(b"AUTH ANONYMOUS\r\n");
        } else {
            let uid = nix::unistd::Uid::effective().as_raw().to_string();
            outbuf.extend_from_slice(b"AUTH EXTERNAL ");
            for b in uid.as_bytes() {
                outbuf.extend_from_slice(format!("{:02x}", b).as_bytes());
            }
            outbuf.extend_from_slice(b"\r\n");
        }

        Self {
            state: AuthState::SendingAuth,
            outbuf,
            cursor: 0,
            negotiate_fds,
            server_id: None,
            can_fds: false,
            deadline: Instant::now() + DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Absolute point after which the handshake should be abandoned.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether buffered handshake output is waiting for the socket.
    pub fn needs_write(&self) -> bool {
        self.cursor < self.outbuf.len()
    }

    /// Drive the handshake as far as the socket allows.
    pub fn step(&mut self, io: &mut StreamIo, fd: RawFd) -> Result<AuthProgress> {
        loop {
            // Flush whatever the last transition queued.
            while self.cursor < self.outbuf.len() {
                let n = io.write_some(fd, &self.outbuf[self.cursor..])?;
                if n == 0 {
                    return Ok(AuthProgress::Pending);
                }
                self.cursor += n;
            }

            match self.state {
                AuthState::SendingAuth => {
                    self.state = AuthState::AwaitingOk;
                }
                AuthState::SendingNegotiate => {
                    self.state = AuthState::AwaitingAgree;
                }
                AuthState::SendingBegin | AuthState::Done => {
                    self.state = AuthState::Done;
                    tracing::debug!(
                        server_id = ?self.server_id,
                        can_fds = self.can_fds,
                        "authentication complete"
                    );
                    return Ok(AuthProgress::Done {
                        server_id: self.server_id,
                        can_fds: self.can_fds,
                    });
                }
                AuthState::AwaitingOk => {
                    let Some(line) = io.read_line(fd)? else {
                        return Ok(AuthProgress::Pending);
                    };
                    self.handle_ok_line(&line)?;
                }
                AuthState::AwaitingAgree => {
                    let Some(line) = io.read_line(fd)? else {
                        return Ok(AuthProgress::Pending);
                    };
                    // Anything but AGREE means the broker will not take
                    // fds; the connection continues without them.
                    self.can_fds = line == "AGREE_UNIX_FD";
                    if !self.can_fds {
                        tracing::debug!("broker declined fd passing: {:?}", line);
                    }
                    self.queue(b"BEGIN\r\n");
                    self.state = AuthState::SendingBegin;
                }
            }
        }
    }

    fn handle_ok_line(&mut self, line: &str) -> Result<()> {
        let Some(rest) = line.strip_prefix("OK") else {
            if line.starts_with("REJECTED") {
                return Err(Error::Auth(format!("broker rejected mechanism: {}", line)));
            }
            return Err(Error::Auth(format!("unexpected handshake line: {}", line)));
        };

        let guid = rest.trim();
        if !guid.is_empty() {
            self.server_id = Some(
                Uuid::try_parse(guid)
                    .map_err(|_| Error::Auth(format!("malformed server guid: {}", guid)))?,
            );
        }

        if self.negotiate_fds {
            self.queue(b"NEGOTIATE_UNIX_FD\r\n");
            self.state = AuthState::SendingNegotiate;
        } else {
            self.queue(b"BEGIN\r\n");
            self.state = AuthState::SendingBegin;
        }
        Ok(())
    }

    fn queue(&mut self, bytes: &[u8]) {
        self.outbuf.clear();
        self.cursor = 0;
        self.outbuf.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;

    fn pair() -> (UnixStream, OwnedFd) {
        let (server, client) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let server = UnixStream::from(server);
        // Client side is driven non-blocking, the fake broker blocks.
        crate::socket_io::prepare_fd(client.as_raw_fd()).unwrap();
        (server, client)
    }

    fn read_client_bytes(server: &mut UnixStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        server.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn external_auth_with_fd_negotiation() {
        let (mut server, client) = pair();
        let mut io = StreamIo::new(true);
        let mut auth = AuthClient::new(false, true);

        // Client leads with NUL + AUTH line.
        assert!(matches!(
            auth.step(&mut io, client.as_raw_fd()).unwrap(),
            AuthProgress::Pending
        ));
        let lead = read_client_bytes(&mut server, 1);
        assert_eq!(lead, [0]);
        let mut line = String::new();
        let mut one = [0u8; 1];
        loop {
            server.read_exact(&mut one).unwrap();
            line.push(one[0] as char);
            if line.ends_with("\r\n") {
                break;
            }
        }
        assert!(line.starts_with("AUTH EXTERNAL "));

        server
            .write_all(b"OK 0123456789abcdef0123456789abcdef\r\n")
            .unwrap();
        assert!(matches!(
            auth.step(&mut io, client.as_raw_fd()).unwrap(),
            AuthProgress::Pending
        ));

        line.clear();
        loop {
            server.read_exact(&mut one).unwrap();
            line.push(one[0] as char);
            if line.ends_with("\r\n") {
                break;
            }
        }
        assert_eq!(line, "NEGOTIATE_UNIX_FD\r\n");

        server.write_all(b"AGREE_UNIX_FD\r\n").unwrap();
        match auth.step(&mut io, client.as_raw_fd()).unwrap() {
            AuthProgress::Done { server_id, can_fds } => {
                assert!(can_fds);
                assert_eq!(
                    server_id.unwrap(),
                    Uuid::try_parse("0123456789abcdef0123456789abcdef").unwrap()
                );
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn broker_refusing_fds_keeps_connection() {
        let (mut server, client) = pair();
        let mut io = StreamIo::new(true);
        let mut auth = AuthClient::new(false, true);

        auth.step(&mut io, client.as_raw_fd()).unwrap();
        server
            .write_all(b"OK 0123456789abcdef0123456789abcdef\r\nERROR\r\n")
            .unwrap();

        match auth.step(&mut io, client.as_raw_fd()).unwrap() {
            AuthProgress::Done { can_fds, .. } => assert!(!can_fds),
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn rejection_is_an_auth_error() {
        let (mut server, client) = pair();
        let mut io = StreamIo::new(true);
        let mut auth = AuthClient::new(false, false);

        auth.step(&mut io, client.as_raw_fd()).unwrap();
        server.write_all(b"REJECTED EXTERNAL\r\n").unwrap();

        match auth.step(&mut io, client.as_raw_fd()) {
            Err(Error::Auth(_)) => {}
            other => panic!("expected auth error, got {:?}", other),
        }
    }

    #[test]
    fn anonymous_skips_uid() {
        let (mut server, client) = pair();
        let mut io = StreamIo::new(true);
        let mut auth = AuthClient::new(true, false);

        auth.step(&mut io, client.as_raw_fd()).unwrap();
        let mut buf = vec![0u8; 17];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"\0AUTH ANONYMOUS\r\n");
    }
}
