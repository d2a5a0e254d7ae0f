//! TCP dialer. Resolves with the system resolver using stream hints,
//! filters by the requested family, and starts a non-blocking connect on
//! the first usable address. `TCP_NODELAY` is set so small bus messages do
//! not sit in Nagle buffers.

use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::OwnedFd;

use socket2::{Domain, Socket, Type};
use tracing::debug;

use super::{DialOutcome, Endpoint, EndpointKind, PendingConnect};
use crate::address::TcpFamily;
use crate::error::{Error, Result};

pub fn dial(host: &str, port: u16, family: Option<TcpFamily>) -> Result<DialOutcome> {
    if host.is_empty() {
        return Err(Error::invalid("tcp host is empty"));
    }

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(Error::Transport)?
        .filter(|a| match family {
            None => true,
            Some(TcpFamily::V4) => a.is_ipv4(),
            Some(TcpFamily::V6) => a.is_ipv6(),
        })
        .collect();

    if addrs.is_empty() {
        return Err(Error::Transport(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {}:{}", host, port),
        )));
    }

    let mut last_error: Option<Error> = None;
    for addr in addrs {
        match start_connect(addr) {
            Ok(outcome) => return Ok(outcome),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or(Error::NotConnected))
}

fn start_connect(addr: SocketAddr) -> Result<DialOutcome> {
    let domain = Domain::for_address(addr);
    let socket =
        Socket::new(domain, Type::STREAM.nonblocking().cloexec(), None).map_err(Error::Transport)?;
    socket.set_nodelay(true).map_err(Error::Transport)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {
            debug!("tcp connected to {}", addr);
            Ok(DialOutcome::Ready(Endpoint {
                input: OwnedFd::from(socket),
                output: None,
                kind: EndpointKind::StreamSocket,
                child: None,
            }))
        }
        Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EINPROGRESS as i32) => {
            debug!("tcp connect to {} in progress", addr);
            Ok(DialOutcome::InProgress(PendingConnect::new(OwnedFd::from(
                socket,
            ))))
        }
        Err(e) => Err(Error::Transport(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::CheckOutcome;
    use std::net::TcpListener;

    #[test]
    fn connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let endpoint = match dial("127.0.0.1", port, Some(TcpFamily::V4)).unwrap() {
            DialOutcome::Ready(e) => e,
            DialOutcome::InProgress(mut pending) => loop {
                match pending.check().unwrap() {
                    CheckOutcome::Ready(e) => break e,
                    CheckOutcome::StillConnecting(p) => {
                        pending = p;
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                }
            },
        };
        assert_eq!(endpoint.kind, EndpointKind::StreamSocket);
    }

    #[test]
    fn resolution_failure_is_a_transport_error() {
        match dial("host.invalid.", 1, None) {
            Err(Error::Transport(_)) => {}
            Ok(_) => panic!("resolution of .invalid should not succeed"),
            Err(other) => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn family_filter_can_empty_the_result() {
        // 127.0.0.1 never resolves to an IPv6 address.
        match dial("127.0.0.1", 1, Some(TcpFamily::V6)) {
            Err(Error::Transport(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::AddrNotAvailable)
            }
            other => panic!("expected transport error, got {:?}", other.map(|_| ())),
        }
    }
}
