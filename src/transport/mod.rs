//! # Transport Dialers
//!
//! One module per transport, each turning a parsed address candidate into a
//! pair of non-blocking, close-on-exec file descriptors:
//!
//! - **Unix Domain Sockets**: filesystem or abstract-namespace paths
//! - **TCP Sockets**: resolved with stream hints, `TCP_NODELAY` set
//! - **Exec Processes**: a spawned child whose stdin/stdout are the bus
//! - **Kernel Bus**: a kernel bus node with out-of-band identity
//! - **Containers**: the system bus socket of a named machine
//!
//! Stream dialers may report an in-flight connect; the connection re-enters
//! [`PendingConnect::check`] when the reactor says the socket is writable.
//! On readiness, stream transports hand off to authentication while the
//! kernel transport skips the handshake entirely.

pub mod container;
pub mod exec_process;
pub mod kernel_bus;
pub mod tcp_socket;
pub mod unix_socket;

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::process::Child;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};

use crate::address::Candidate;
use crate::error::{Error, Result};

/// How the engine must treat an established endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Socket stream: SASL handshake, fd passing possible.
    StreamSocket,
    /// Pipe pair: SASL handshake, no fd passing.
    StreamPipe,
    /// Kernel bus node: no handshake, identity is out of band.
    Kernel,
}

/// An established transport: input/output descriptors plus bookkeeping.
///
/// `output` is `None` when reads and writes share one descriptor.
pub struct Endpoint {
    pub input: OwnedFd,
    pub output: Option<OwnedFd>,
    pub kind: EndpointKind,
    /// The spawned bridge process for exec transports.
    pub child: Option<Child>,
}

impl Endpoint {
    pub fn input_fd(&self) -> RawFd {
        self.input.as_raw_fd()
    }

    pub fn output_fd(&self) -> RawFd {
        self.output
            .as_ref()
            .map(|f| f.as_raw_fd())
            .unwrap_or_else(|| self.input.as_raw_fd())
    }

    /// Whether fd passing can work at all on this transport.
    pub fn supports_fd_passing(&self) -> bool {
        matches!(self.kind, EndpointKind::StreamSocket | EndpointKind::Kernel)
    }
}

/// A stream socket whose non-blocking connect has not finished yet.
pub struct PendingConnect {
    fd: OwnedFd,
}

impl PendingConnect {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Poll the socket without blocking and, once writable, read the
    /// connect result out of `SO_ERROR`.
    ///
    /// `Ok(None)` means still connecting; `Ok(Some(endpoint))` means
    /// established.
    pub fn check(self) -> std::result::Result<CheckOutcome, Error> {
        let borrowed = self.fd.as_fd();
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLOUT)];
        let n = nix::poll::poll(&mut fds, PollTimeout::ZERO).map_err(Error::from)?;
        if n == 0 {
            return Ok(CheckOutcome::StillConnecting(self));
        }

        let err = nix::sys::socket::getsockopt(&self.fd, nix::sys::socket::sockopt::SocketError)
            .map_err(Error::from)?;
        if err != 0 {
            return Err(Errno::from_raw(err).into());
        }

        Ok(CheckOutcome::Ready(Endpoint {
            input: self.fd,
            output: None,
            kind: EndpointKind::StreamSocket,
            child: None,
        }))
    }
}

impl AsFd for PendingConnect {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Result of re-checking an in-flight connect.
pub enum CheckOutcome {
    StillConnecting(PendingConnect),
    Ready(Endpoint),
}

/// Result of an initial dial attempt.
pub enum DialOutcome {
    /// Connect returned in-progress; come back when writable.
    InProgress(PendingConnect),
    /// Transport is up.
    Ready(Endpoint),
}

/// Dial one candidate.
pub fn dial(candidate: &Candidate) -> Result<DialOutcome> {
    match candidate {
        Candidate::Unix { path, abstract_ns } => unix_socket::dial(path, *abstract_ns),
        Candidate::Tcp { host, port, family } => tcp_socket::dial(host, *port, *family),
        Candidate::Exec { path, argv } => exec_process::dial(path, argv).map(DialOutcome::Ready),
        Candidate::Kernel { path } => kernel_bus::dial(path).map(DialOutcome::Ready),
        Candidate::Container { machine } => container::dial(machine),
    }
}
