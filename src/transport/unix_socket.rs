//! Unix domain socket dialer, covering both filesystem paths and the
//! Linux abstract namespace (a leading NUL byte on the wire; callers pass
//! the name without it).

use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use tracing::debug;

use super::{DialOutcome, Endpoint, EndpointKind, PendingConnect};
use crate::error::{Error, Result};

pub fn dial(path: &[u8], abstract_ns: bool) -> Result<DialOutcome> {
    if path.is_empty() {
        return Err(Error::invalid("unix socket path is empty"));
    }

    let addr = if abstract_ns {
        UnixAddr::new_abstract(path)?
    } else {
        UnixAddr::new(std::ffi::OsStr::from_bytes(path))?
    };

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;

    match connect(fd.as_raw_fd(), &addr) {
        Ok(()) => {
            debug!("unix socket connected: {:?}", String::from_utf8_lossy(path));
            Ok(DialOutcome::Ready(Endpoint {
                input: fd,
                output: None,
                kind: EndpointKind::StreamSocket,
                child: None,
            }))
        }
        Err(Errno::EINPROGRESS) | Err(Errno::EAGAIN) => {
            Ok(DialOutcome::InProgress(PendingConnect::new(fd)))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn connects_to_listening_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus");
        let _listener = UnixListener::bind(&path).unwrap();

        let outcome = dial(path.as_os_str().as_bytes(), false).unwrap();
        let endpoint = match outcome {
            DialOutcome::Ready(e) => e,
            DialOutcome::InProgress(mut pending) => loop {
                match pending.check().unwrap() {
                    super::super::CheckOutcome::Ready(e) => break e,
                    super::super::CheckOutcome::StillConnecting(p) => {
                        pending = p;
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                }
            },
        };
        assert_eq!(endpoint.kind, EndpointKind::StreamSocket);
        assert!(endpoint.output.is_none());
    }

    #[test]
    fn missing_socket_fails() {
        match dial(b"/nonexistent/definitely/absent.sock", false) {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_path_is_invalid() {
        assert!(matches!(dial(b"", false), Err(Error::InvalidArgument(_))));
    }
}
