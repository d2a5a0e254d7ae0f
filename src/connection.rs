//! # Connection
//!
//! The top-level entity tying transports, authentication, queues, reply
//! correlation and dispatch together. A connection is single-threaded and
//! cooperative: every state transition happens inside `process()`, `call()`,
//! `flush()` or a setter, and `process()` refuses re-entry. I/O never
//! blocks; callers suspend in [`Connection::wait`] or behind an external
//! reactor fed by [`Connection::desired_events`] / [`Connection::next_deadline`].
//!
//! ## Lifecycle
//!
//! ```text
//! Unset ──start()──▶ Opening ──▶ Authenticating ──▶ Hello ──▶ Running
//!                       │               │    (kernel) └──────────▲ │
//!                       └───────────────┴───────────────────────▶ Closed
//! ```
//!
//! Configuration setters require `Unset`. Unrecoverable transport, auth and
//! protocol errors close the connection; validation errors, queue caps,
//! timeouts and remote errors leave it healthy.

use std::ffi::OsString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::address::{escape, AddressCursor, ParsedAddress};
use crate::auth::{AuthClient, AuthProgress};
use crate::error::{Error, Result};
use crate::filter::{FilterId, FilterList, Handled, MessageHandler};
use crate::match_rule::{MatchId, MatchTree};
use crate::memfd_cache::{MemfdCache, LeasedBuffer, MEMFD_THRESHOLD};
use crate::message::{names, Message, MessageType};
use crate::object::{Enumerator, ObjectId, ObjectTree, Vtable};
use crate::queue::{RecvQueue, SendQueue, RQUEUE_MAX};
use crate::reply::{ReplyCallback, ReplyTracker, Timeout};
use crate::socket_io::{prepare_fd, StreamIo};
use crate::transport::{
    dial, CheckOutcome, DialOutcome, Endpoint, EndpointKind, PendingConnect,
};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, not configured or started.
    Unset,
    /// Dialing a transport candidate.
    Opening,
    /// Running the SASL handshake.
    Authenticating,
    /// Bus handshake sent, waiting for its reply.
    Hello,
    /// Ready for traffic.
    Running,
    /// Terminal.
    Closed,
}

impl State {
    fn is_open(self) -> bool {
        matches!(
            self,
            State::Opening | State::Authenticating | State::Hello | State::Running
        )
    }
}

/// Poll interest the engine wants from an external reactor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesiredEvents {
    pub readable: bool,
    pub writable: bool,
}

/// Metadata items a connection may ask the broker to attach to incoming
/// messages. Kernel transports honor these; stream brokers ignore them.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachFlags {
    pub comm: bool,
    pub exe: bool,
    pub cmdline: bool,
    pub cgroup: bool,
    pub caps: bool,
    pub selinux: bool,
    pub audit: bool,
}

/// A client-side bus connection.
pub struct Connection {
    state: State,

    // Transport.
    endpoint: Option<Endpoint>,
    pending_connect: Option<PendingConnect>,
    io: StreamIo,

    // Configuration, frozen at start().
    address: Option<AddressCursor>,
    preset_fds: Option<(OwnedFd, Option<OwnedFd>)>,
    exec_config: Option<(PathBuf, Vec<OsString>)>,
    bus_client: bool,
    anonymous: bool,
    is_server: bool,
    accept_fd: bool,
    attach_flags: AttachFlags,
    builtin_peer: bool,
    protocol_version: u8,

    // Negotiated and learned at runtime.
    server_id: Option<Uuid>,
    pinned_server_id: Option<Uuid>,
    can_fds: bool,
    unique_name: Option<String>,
    last_connect_error: Option<Error>,
    machine_id: Option<String>,

    // Dispatch machinery.
    auth: Option<AuthClient>,
    wqueue: SendQueue,
    rqueue: RecvQueue,
    replies: ReplyTracker,
    filters: FilterList,
    matches: MatchTree,
    match_cookie: u64,
    objects: ObjectTree,
    next_serial: u32,
    hello_serial: Option<u32>,
    iteration: u64,
    processing: bool,

    // Kernel-transport staging buffer for the current wqueue head.
    kernel_stage: Option<LeasedBuffer>,
    memfd_cache: MemfdCache,

    /// Bridge process detached from a closed endpoint, reaped at drop.
    exec_child: Option<std::process::Child>,

    creator_pid: u32,
    attached: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// A fresh, unconfigured connection.
    pub fn new() -> Self {
        Self {
            state: State::Unset,
            endpoint: None,
            pending_connect: None,
            io: StreamIo::new(true),
            address: None,
            preset_fds: None,
            exec_config: None,
            bus_client: false,
            anonymous: false,
            is_server: false,
            accept_fd: true,
            attach_flags: AttachFlags::default(),
            builtin_peer: true,
            protocol_version: crate::message::PROTOCOL_VERSION,
            server_id: None,
            pinned_server_id: None,
            can_fds: false,
            unique_name: None,
            last_connect_error: None,
            machine_id: None,
            auth: None,
            wqueue: SendQueue::new(),
            rqueue: RecvQueue::new(),
            replies: ReplyTracker::new(),
            filters: FilterList::new(),
            matches: MatchTree::new(),
            match_cookie: 0,
            objects: ObjectTree::new(),
            next_serial: 0,
            hello_serial: None,
            iteration: 0,
            processing: false,
            kernel_stage: None,
            memfd_cache: MemfdCache::new(),
            exec_child: None,
            creator_pid: std::process::id(),
            attached: false,
        }
    }

    /// Connect to the system bus: `DBUS_SYSTEM_BUS_ADDRESS` if set, the
    /// conventional socket otherwise.
    pub fn open_system() -> Result<Self> {
        let address = std::env::var("DBUS_SYSTEM_BUS_ADDRESS")
            .unwrap_or_else(|_| "unix:path=/run/dbus/system_bus_socket".to_owned());
        let mut conn = Self::new();
        conn.set_address(&address)?;
        conn.set_bus_client(true)?;
        conn.start()?;
        Ok(conn)
    }

    /// Connect to the user's session bus: `DBUS_SESSION_BUS_ADDRESS` if
    /// set, else `$XDG_RUNTIME_DIR/bus`.
    pub fn open_user() -> Result<Self> {
        let address = match std::env::var("DBUS_SESSION_BUS_ADDRESS") {
            Ok(a) => a,
            Err(_) => {
                let dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| {
                    Error::invalid("neither DBUS_SESSION_BUS_ADDRESS nor XDG_RUNTIME_DIR is set")
                })?;
                format!("unix:path={}/bus", escape(&dir))
            }
        };
        let mut conn = Self::new();
        conn.set_address(&address)?;
        conn.set_bus_client(true)?;
        conn.start()?;
        Ok(conn)
    }

    /// Connect to the system bus of a remote host over an ssh stdio
    /// bridge.
    pub fn open_system_remote(host: &str) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::invalid("remote host is empty"));
        }
        let address = format!(
            "unixexec:path=ssh,argv1=-xT,argv2={},argv3=systemd-stdio-bridge",
            escape(host)
        );
        let mut conn = Self::new();
        conn.set_address(&address)?;
        conn.set_bus_client(true)?;
        conn.start()?;
        Ok(conn)
    }

    /// Connect to the system bus inside a registered machine.
    pub fn open_system_container(machine: &str) -> Result<Self> {
        if machine.is_empty() {
            return Err(Error::invalid("machine name is empty"));
        }
        let address = format!("x-container:machine={}", escape(machine));
        let mut conn = Self::new();
        conn.set_address(&address)?;
        conn.set_bus_client(true)?;
        conn.start()?;
        Ok(conn)
    }

    // ── Configuration (Unset only) ─────────────────────────────────────

    fn check_pid(&self) -> Result<()> {
        if std::process::id() != self.creator_pid {
            return Err(Error::ChildGuard);
        }
        Ok(())
    }

    fn check_unset(&self) -> Result<()> {
        self.check_pid()?;
        if self.state != State::Unset {
            return Err(Error::PermissionDenied(self.state));
        }
        Ok(())
    }

    pub fn set_address(&mut self, address: &str) -> Result<()> {
        self.check_unset()?;
        if address.is_empty() {
            return Err(Error::invalid("address is empty"));
        }
        self.address = Some(AddressCursor::new(address));
        Ok(())
    }

    /// Use already-connected descriptors instead of dialing. `output` of
    /// `None` means reads and writes share `input`.
    pub fn set_fd(&mut self, input: OwnedFd, output: Option<OwnedFd>) -> Result<()> {
        self.check_unset()?;
        self.preset_fds = Some((input, output));
        Ok(())
    }

    pub fn set_exec(&mut self, path: PathBuf, argv: Vec<OsString>) -> Result<()> {
        self.check_unset()?;
        if argv.is_empty() {
            return Err(Error::invalid("exec argv is empty"));
        }
        self.exec_config = Some((path, argv));
        Ok(())
    }

    /// Whether this connection talks to a message bus (and must say Hello)
    /// rather than to a direct peer.
    pub fn set_bus_client(&mut self, on: bool) -> Result<()> {
        self.check_unset()?;
        self.bus_client = on;
        Ok(())
    }

    pub fn set_anonymous(&mut self, on: bool) -> Result<()> {
        self.check_unset()?;
        self.anonymous = on;
        Ok(())
    }

    /// Mark this end as the server side of a direct connection and pin the
    /// identity it presents.
    pub fn set_server(&mut self, on: bool, id: Uuid) -> Result<()> {
        self.check_unset()?;
        if on && id.is_nil() {
            return Err(Error::invalid("server needs a non-nil identity"));
        }
        self.is_server = on;
        self.server_id = Some(id);
        Ok(())
    }

    /// Whether to negotiate fd passing during authentication.
    pub fn negotiate_fds(&mut self, on: bool) -> Result<()> {
        self.check_unset()?;
        self.accept_fd = on;
        Ok(())
    }

    /// Ask the transport to attach sender metadata to incoming messages.
    pub fn negotiate_attach(&mut self, flags: AttachFlags) -> Result<()> {
        self.check_unset()?;
        self.attach_flags = flags;
        Ok(())
    }

    /// Enable or disable the built-in peer interface responder.
    pub fn set_builtin_peer(&mut self, on: bool) -> Result<()> {
        self.check_unset()?;
        self.builtin_peer = on;
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────────

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_open(&self) -> Result<bool> {
        self.check_pid()?;
        Ok(self.state.is_open())
    }

    /// The broker-assigned unique name, available once Running.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    /// The peer's 128-bit identity. Blocks until the connection is
    /// Running.
    pub fn server_id(&mut self) -> Result<Uuid> {
        self.check_pid()?;
        self.ensure_running()?;
        self.server_id
            .ok_or_else(|| Error::protocol("peer presented no identity"))
    }

    /// Whether messages with attached fds can be sent. Blocks until the
    /// connection is Running.
    pub fn can_send_fds(&mut self) -> Result<bool> {
        self.check_pid()?;
        if self.state == State::Unset {
            return Err(Error::NotConnected);
        }
        if !self.accept_fd {
            return Ok(false);
        }
        self.ensure_running()?;
        Ok(self.can_fds)
    }

    /// The error recorded by the most recent failed dial attempt.
    pub fn last_connect_error(&self) -> Option<&Error> {
        self.last_connect_error.as_ref()
    }

    /// Transport descriptor, for reactors that can only watch one fd.
    pub fn fd(&self) -> Result<RawFd> {
        self.check_pid()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        let (input, output) = self.fds()?;
        if input != output {
            return Err(Error::PermissionDenied(self.state));
        }
        Ok(input)
    }

    /// Input and output descriptors (possibly equal).
    pub fn fds(&self) -> Result<(RawFd, RawFd)> {
        self.check_pid()?;
        if let Some(ep) = &self.endpoint {
            return Ok((ep.input_fd(), ep.output_fd()));
        }
        if let Some(p) = &self.pending_connect {
            return Ok((p.fd(), p.fd()));
        }
        Err(Error::NotConnected)
    }

    /// Poll interest for an external reactor, per state.
    pub fn desired_events(&self) -> Result<DesiredEvents> {
        self.check_pid()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        let mut events = DesiredEvents::default();
        match self.state {
            State::Opening => events.writable = true,
            State::Authenticating => {
                events.readable = true;
                events.writable = self.auth.as_ref().map(AuthClient::needs_write).unwrap_or(false);
            }
            State::Hello | State::Running => {
                events.readable = self.rqueue.is_empty();
                events.writable = !self.wqueue.is_empty();
            }
            State::Unset | State::Closed => {}
        }
        Ok(events)
    }

    /// The next point in time `process()` wants to run even without I/O,
    /// or `None` for "never".
    pub fn next_deadline(&self) -> Result<Option<Instant>> {
        self.check_pid()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        if self.state == State::Authenticating {
            return Ok(self.auth.as_ref().map(AuthClient::deadline));
        }
        if self.state != State::Hello && self.state != State::Running {
            return Ok(None);
        }
        if !self.rqueue.is_empty() {
            // Work is already queued; run immediately.
            return Ok(Some(Instant::now()));
        }
        Ok(self.replies.next_deadline())
    }

    pub(crate) fn set_attached(&mut self, on: bool) -> Result<()> {
        if on && self.attached {
            return Err(Error::invalid("connection is already attached to a reactor"));
        }
        self.attached = on;
        Ok(())
    }

    /// The wire protocol version this connection speaks.
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// The metadata-attach flags configured for this connection.
    pub fn attach_flags(&self) -> AttachFlags {
        self.attach_flags
    }

    // ── Start / close ──────────────────────────────────────────────────

    /// Validate configuration and begin connecting.
    pub fn start(&mut self) -> Result<()> {
        self.check_unset()?;
        if self.is_server && self.bus_client {
            return Err(Error::invalid("a connection cannot be both server and bus client"));
        }

        self.state = State::Opening;

        let started = if let Some((input, output)) = self.preset_fds.take() {
            self.start_fd(input, output)
        } else if self.address.is_some() || self.exec_config.is_some() {
            if let Some((path, argv)) = self.exec_config.take() {
                let encoded = format!(
                    "unixexec:path={}{}",
                    escape(&path.to_string_lossy()),
                    argv.iter()
                        .enumerate()
                        .map(|(i, a)| format!(",argv{}={}", i, escape(&a.to_string_lossy())))
                        .collect::<String>()
                );
                self.address = Some(AddressCursor::new(&encoded));
            }
            self.start_address()
        } else {
            Err(Error::invalid("no address, fds or exec path configured"))
        };

        if let Err(e) = started {
            self.state = State::Closed;
            return Err(e);
        }

        if self.bus_client && !self.is_kernel() {
            self.send_hello()?;
        }

        Ok(())
    }

    fn start_fd(&mut self, input: OwnedFd, output: Option<OwnedFd>) -> Result<()> {
        use nix::sys::stat::SFlag;

        prepare_fd(input.as_raw_fd())?;
        if let Some(out) = &output {
            prepare_fd(out.as_raw_fd())?;
        }

        let st = nix::sys::stat::fstat(input.as_raw_fd())?;
        let fmt = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
        let kind = if fmt == SFlag::S_IFCHR {
            EndpointKind::Kernel
        } else if fmt == SFlag::S_IFSOCK {
            EndpointKind::StreamSocket
        } else {
            EndpointKind::StreamPipe
        };

        self.install_endpoint(Endpoint {
            input,
            output,
            kind,
            child: None,
        })
    }

    /// Dial candidates until one connects or the list runs out.
    fn start_address(&mut self) -> Result<()> {
        loop {
            let parsed = match self.next_candidate()? {
                Some(p) => p,
                None => {
                    let err = self.last_connect_error.take().unwrap_or_else(|| {
                        Error::Transport(std::io::Error::from(
                            std::io::ErrorKind::ConnectionRefused,
                        ))
                    });
                    return Err(err);
                }
            };

            match dial(&parsed.candidate) {
                Ok(DialOutcome::Ready(endpoint)) => return self.install_endpoint(endpoint),
                Ok(DialOutcome::InProgress(pending)) => {
                    self.pending_connect = Some(pending);
                    return Ok(());
                }
                Err(e) => {
                    debug!("dial failed, falling through: {}", e);
                    self.last_connect_error = Some(e);
                }
            }
        }
    }

    fn next_candidate(&mut self) -> Result<Option<ParsedAddress>> {
        let Some(cursor) = self.address.as_mut() else {
            return Ok(None);
        };
        let parsed = cursor.next_candidate()?;
        if let Some(p) = &parsed {
            if let Some(guid) = p.guid {
                self.pinned_server_id = Some(guid);
            }
            debug!("trying address candidate {:?}", p.candidate);
        }
        Ok(parsed)
    }

    fn install_endpoint(&mut self, endpoint: Endpoint) -> Result<()> {
        // Earlier candidates may have failed; their error only matters if
        // the whole list is exhausted.
        self.last_connect_error = None;
        self.io = StreamIo::new(endpoint.kind == EndpointKind::StreamSocket);

        match endpoint.kind {
            EndpointKind::Kernel => {
                // Kernel buses have out-of-band identity and no handshake.
                self.can_fds = true;
                self.endpoint = Some(endpoint);
                self.state = State::Running;
            }
            EndpointKind::StreamSocket | EndpointKind::StreamPipe => {
                let negotiate = self.accept_fd && endpoint.supports_fd_passing();
                self.auth = Some(AuthClient::new(self.anonymous, negotiate));
                self.endpoint = Some(endpoint);
                self.state = State::Authenticating;
            }
        }
        Ok(())
    }

    fn is_kernel(&self) -> bool {
        matches!(
            self.endpoint.as_ref().map(|e| e.kind),
            Some(EndpointKind::Kernel)
        )
    }

    /// Close the connection. Idempotent; detaches from any reactor and
    /// closes the transport (kernel descriptors stay open until drop, in
    /// case pooled buffers still reference the bus).
    pub fn close(&mut self) {
        if self.state == State::Closed || self.check_pid().is_err() {
            return;
        }

        debug!("closing connection");
        self.state = State::Closed;
        self.attached = false;
        self.pending_connect = None;
        self.auth = None;
        self.kernel_stage = None;

        if !self.is_kernel() {
            if let Some(mut ep) = self.endpoint.take() {
                if let Some(mut child) = ep.child.take() {
                    // The bridge process exits on EOF; reap it at drop if
                    // it has not by then.
                    let _ = child.try_wait();
                    self.exec_child = Some(child);
                }
            }
        }
    }

    // ── Sending ────────────────────────────────────────────────────────

    fn check_sendable(&self, msg: &Message) -> Result<()> {
        self.check_pid()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        if !msg.fds().is_empty() {
            if !self.accept_fd {
                return Err(Error::invalid("fd passing was not negotiated"));
            }
            if self.state == State::Running && !self.can_fds {
                return Err(Error::invalid("peer does not accept fds"));
            }
        }
        Ok(())
    }

    fn seal(&mut self, msg: &mut Message) -> Result<()> {
        if msg.is_sealed() {
            return Ok(());
        }
        self.next_serial += 1;
        msg.seal(self.next_serial)
    }

    /// Send a message, returning its serial.
    pub fn send(&mut self, mut msg: Message) -> Result<u32> {
        self.check_sendable(&msg)?;
        self.seal(&mut msg)?;
        let serial = msg.serial().unwrap_or(0);
        self.enqueue_or_write(Rc::new(msg))?;
        Ok(serial)
    }

    /// Send a message whose sender does not care about a reply; method
    /// calls get `NO_REPLY_EXPECTED` set.
    pub fn send_oneway(&mut self, mut msg: Message) -> Result<()> {
        self.check_sendable(&msg)?;
        if !msg.is_sealed() && msg.message_type() == MessageType::MethodCall {
            msg.set_no_reply_expected()?;
        }
        self.seal(&mut msg)?;
        self.enqueue_or_write(Rc::new(msg))?;
        Ok(())
    }

    fn enqueue_or_write(&mut self, msg: Rc<Message>) -> Result<()> {
        let can_write_now = matches!(self.state, State::Running | State::Hello)
            && self.wqueue.is_empty();

        if !can_write_now {
            return self.wqueue.push(msg);
        }

        let out_fd = self.fds()?.1;
        let mut written = 0;
        while written < msg.size() {
            let n = match self.write_head_bytes(out_fd, &msg, written) {
                Ok(n) => n,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };
            if n == 0 {
                // Short write; the reserved head slot remembers progress.
                self.wqueue.push_front_partial(msg, written);
                return Ok(());
            }
            written += n;
        }
        self.kernel_stage = None;
        Ok(())
    }

    /// Write bytes of one outgoing message, staging large kernel-transport
    /// frames through the memfd pool.
    fn write_head_bytes(&mut self, out_fd: RawFd, msg: &Message, windex: usize) -> Result<usize> {
        if self.is_kernel() && msg.size() >= MEMFD_THRESHOLD {
            use std::os::unix::fs::FileExt;

            if self.kernel_stage.is_none() {
                let lease = self.memfd_cache.acquire(msg.size())?;
                lease
                    .file()
                    .write_all_at(msg.wire()?, 0)
                    .map_err(Error::Transport)?;
                self.kernel_stage = Some(lease);
            }
            let lease = self.kernel_stage.as_ref().expect("stage just filled");
            let mut chunk = vec![0u8; (msg.size() - windex).min(64 * 1024)];
            lease
                .file()
                .read_exact_at(&mut chunk, windex as u64)
                .map_err(Error::Transport)?;
            let n = self.io.write_some(out_fd, &chunk)?;
            return Ok(n);
        }

        self.io.write_message(out_fd, msg, windex)
    }

    /// Register a reply callback and send a method call. Returns the
    /// serial, usable with [`Connection::cancel_reply`].
    pub fn call_async(
        &mut self,
        mut msg: Message,
        timeout: Timeout,
        callback: ReplyCallback,
    ) -> Result<u32> {
        self.check_sendable(&msg)?;
        if msg.message_type() != MessageType::MethodCall {
            return Err(Error::invalid("only method calls take reply callbacks"));
        }
        if msg.no_reply_expected() {
            return Err(Error::invalid("message is flagged no-reply-expected"));
        }

        self.seal(&mut msg)?;
        let serial = msg.serial().unwrap_or(0);
        let deadline = timeout.deadline_from(Instant::now());
        self.replies.register(serial, deadline, callback)?;

        if let Err(e) = self.enqueue_or_write(Rc::new(msg)) {
            self.replies.cancel(serial);
            return Err(e);
        }
        Ok(serial)
    }

    /// Forget a pending reply. Idempotent; after this returns the callback
    /// will not fire.
    pub fn cancel_reply(&mut self, serial: u32) -> Result<bool> {
        self.check_pid()?;
        if serial == 0 {
            return Err(Error::invalid("serial must be positive"));
        }
        Ok(self.replies.cancel(serial))
    }

    /// Call a method and block until its reply, an error reply, or the
    /// deadline. Unrelated inbound messages queue locally (bounded by the
    /// receive-queue cap) and are dispatched by later `process()` calls.
    pub fn call(&mut self, mut msg: Message, timeout: Timeout) -> Result<Message> {
        self.check_sendable(&msg)?;
        if msg.message_type() != MessageType::MethodCall {
            return Err(Error::invalid("call() takes a method call"));
        }
        if msg.no_reply_expected() {
            return Err(Error::invalid("message is flagged no-reply-expected"));
        }

        self.ensure_running()?;
        self.seal(&mut msg)?;
        let serial = self.send(msg)?;
        let deadline = timeout.deadline_from(Instant::now());

        loop {
            let input_fd = self.fds()?.0;
            while let Some(incoming) = match self.io.read_message(input_fd) {
                Ok(m) => m,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            } {
                if incoming.reply_serial() == Some(serial) {
                    return match incoming.message_type() {
                        MessageType::MethodReturn => Ok(incoming),
                        MessageType::MethodError => Err(remote_error(&incoming)),
                        _ => {
                            self.close();
                            Err(Error::protocol("reply has a non-reply type"))
                        }
                    };
                }
                if self.rqueue.len() >= RQUEUE_MAX {
                    return Err(Error::OutOfBuffer);
                }
                self.rqueue.push(incoming)?;
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Timeout);
                    }
                    Some(d - now)
                }
                None => None,
            };

            self.poll_transport(true, remaining)?;
            self.flush_wqueue()?;
        }
    }

    /// Drive the connection until it reaches Running.
    pub fn ensure_running(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::Unset | State::Closed => return Err(Error::NotConnected),
                State::Running => return Ok(()),
                _ => {}
            }
            if self.process()? {
                continue;
            }
            self.wait(None)?;
        }
    }

    // ── Processing ─────────────────────────────────────────────────────

    /// Advance the connection by at most one unit of work.
    ///
    /// Returns `Ok(true)` if something was done and another call may find
    /// more, `Ok(false)` if the caller should [`wait`] for readiness.
    ///
    /// [`wait`]: Connection::wait
    pub fn process(&mut self) -> Result<bool> {
        self.check_pid()?;
        if self.processing {
            return Err(Error::Busy);
        }

        match self.state {
            State::Unset | State::Closed => Err(Error::NotConnected),
            State::Opening => self.process_opening(),
            State::Authenticating => self.process_authenticating(),
            State::Hello | State::Running => {
                self.processing = true;
                let r = self.process_running();
                self.processing = false;
                match r {
                    Err(e) if e.is_fatal() => {
                        self.close();
                        Err(e)
                    }
                    other => other,
                }
            }
        }
    }

    fn process_opening(&mut self) -> Result<bool> {
        let Some(pending) = self.pending_connect.take() else {
            return Err(Error::protocol("opening without a pending connect"));
        };

        match pending.check() {
            Ok(CheckOutcome::StillConnecting(p)) => {
                self.pending_connect = Some(p);
                Ok(false)
            }
            Ok(CheckOutcome::Ready(endpoint)) => {
                self.install_endpoint(endpoint)?;
                Ok(true)
            }
            Err(e) => {
                // This candidate is dead; fall through to the next one.
                debug!("async connect failed, falling through: {}", e);
                self.last_connect_error = Some(e);
                match self.start_address() {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        self.close();
                        Err(e)
                    }
                }
            }
        }
    }

    fn process_authenticating(&mut self) -> Result<bool> {
        let Some(mut auth) = self.auth.take() else {
            return Err(Error::protocol("authenticating without a handshake"));
        };

        if Instant::now() >= auth.deadline() {
            self.close();
            return Err(Error::Auth("handshake timed out".into()));
        }

        let input_fd = self.fds()?.0;
        match auth.step(&mut self.io, input_fd) {
            Ok(AuthProgress::Pending) => {
                self.auth = Some(auth);
                Ok(false)
            }
            Ok(AuthProgress::Done { server_id, can_fds }) => {
                if let (Some(pinned), Some(actual)) = (self.pinned_server_id, server_id) {
                    if pinned != actual {
                        self.close();
                        return Err(Error::Auth(format!(
                            "peer identity {} does not match pinned {}",
                            actual.simple(),
                            pinned.simple()
                        )));
                    }
                }
                if server_id.is_some() {
                    self.server_id = server_id;
                }
                self.can_fds = can_fds;
                self.state = if self.bus_client {
                    State::Hello
                } else {
                    State::Running
                };
                debug!(state = ?self.state, "handshake finished");
                Ok(true)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn process_running(&mut self) -> Result<bool> {
        // 1. Expire one overdue reply.
        if let Some((serial, callback)) = self.replies.expire(Instant::now()) {
            debug!("reply for serial {} timed out", serial);
            let synthetic =
                Message::synthetic_error(serial, names::ERROR_NO_REPLY, "Method call timed out")?;
            callback(self, &synthetic)?;
            return Ok(true);
        }

        // 2. Flush as much outbound as the socket takes.
        if self.flush_wqueue()? {
            return Ok(true);
        }

        // 3. One inbound message: local queue first, then the transport.
        let msg = match self.rqueue.pop() {
            Some(m) => m,
            None => {
                let input_fd = self.fds()?.0;
                match self.io.read_message(input_fd)? {
                    Some(m) => m,
                    None => return Ok(false),
                }
            }
        };

        // 4. The fixed handler chain.
        self.process_message(&msg)?;
        Ok(true)
    }

    fn flush_wqueue(&mut self) -> Result<bool> {
        let mut wrote = false;
        while let Some(head) = self.wqueue.head().cloned() {
            let out_fd = self.fds()?.1;
            let windex = self.wqueue.windex();
            let n = match self.write_head_bytes(out_fd, &head, windex) {
                Ok(n) => n,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            };
            if n == 0 {
                return Ok(wrote);
            }
            wrote = true;
            if self.wqueue.advance(n) {
                self.kernel_stage = None;
            }
        }
        Ok(wrote)
    }

    fn process_message(&mut self, msg: &Message) -> Result<()> {
        self.iteration += 1;
        debug!(
            sender = msg.sender().unwrap_or("-"),
            path = msg.path().unwrap_or("-"),
            interface = msg.interface().unwrap_or("-"),
            member = msg.member().unwrap_or("-"),
            "dispatching message"
        );

        // Hello gate: nothing may precede the bus handshake reply.
        if self.state == State::Hello {
            if !msg.is_reply() || msg.reply_serial() != self.hello_serial {
                return Err(Error::protocol(
                    "first message on the bus was not the Hello reply",
                ));
            }
        }

        // Reply correlation outranks everything else; a matched reply is
        // never shown to filters, matches or objects.
        if msg.is_reply() {
            if let Some(serial) = msg.reply_serial() {
                if let Some(callback) = self.replies.take(serial) {
                    return callback(self, msg);
                }
            }
        }

        if self.run_filters(msg)? == Handled::Yes {
            return Ok(());
        }
        if self.run_matches(msg)? == Handled::Yes {
            return Ok(());
        }
        if self.run_builtin(msg)? == Handled::Yes {
            return Ok(());
        }
        if self.run_objects(msg)? == Handled::Yes {
            return Ok(());
        }

        // Nobody claimed a method call: tell the caller the object does
        // not exist here.
        if msg.message_type() == MessageType::MethodCall && !msg.no_reply_expected() {
            let reply = Message::method_error(
                msg,
                names::ERROR_UNKNOWN_OBJECT,
                &format!("Unknown object '{}'.", msg.path().unwrap_or("")),
            )?;
            self.send_oneway(reply)?;
        }
        Ok(())
    }

    fn run_filters(&mut self, msg: &Message) -> Result<Handled> {
        loop {
            let _ = self.filters.take_modified();
            let mut restart = false;
            let mut idx = 0;
            loop {
                let Some((id, handler, last_iteration)) = self.filters.entry_at(idx) else {
                    break;
                };
                idx += 1;
                if last_iteration == self.iteration {
                    continue;
                }
                self.filters.stamp(id, self.iteration);

                let outcome = (&mut *handler.borrow_mut())(self, msg)?;
                if outcome == Handled::Yes {
                    return Ok(Handled::Yes);
                }
                if self.filters.take_modified() {
                    restart = true;
                    break;
                }
            }
            if !restart {
                return Ok(Handled::No);
            }
        }
    }

    fn run_matches(&mut self, msg: &Message) -> Result<Handled> {
        loop {
            let _ = self.matches.take_modified();
            let entries = self.matches.matching(msg);
            let mut restart = false;
            for (id, handler, last_iteration) in entries {
                if last_iteration == self.iteration {
                    continue;
                }
                self.matches.stamp(id, self.iteration);

                let outcome = (&mut *handler.borrow_mut())(self, msg)?;
                if outcome == Handled::Yes {
                    return Ok(Handled::Yes);
                }
                if self.matches.take_modified() {
                    restart = true;
                    break;
                }
            }
            if !restart {
                return Ok(Handled::No);
            }
        }
    }

    fn run_builtin(&mut self, msg: &Message) -> Result<Handled> {
        if !self.builtin_peer
            || msg.message_type() != MessageType::MethodCall
            || msg.interface() != Some(names::PEER_INTERFACE)
        {
            return Ok(Handled::No);
        }
        if msg.no_reply_expected() {
            return Ok(Handled::Yes);
        }

        let reply = match msg.member() {
            Some("Ping") => Message::method_return(msg)?,
            Some("GetMachineId") => match self.machine_id() {
                Ok(id) => {
                    let mut reply = Message::method_return(msg)?;
                    reply.append_string(&id)?;
                    reply
                }
                Err(e) => {
                    warn!("machine id unavailable: {}", e);
                    Message::method_error(msg, names::ERROR_FAILED, "Machine id unavailable")?
                }
            },
            _ => Message::method_error(
                msg,
                names::ERROR_UNKNOWN_METHOD,
                &format!(
                    "Unknown method '{}' on interface '{}'.",
                    msg.member().unwrap_or(""),
                    names::PEER_INTERFACE
                ),
            )?,
        };

        self.send_oneway(reply)?;
        Ok(Handled::Yes)
    }

    fn run_objects(&mut self, msg: &Message) -> Result<Handled> {
        if msg.message_type() != MessageType::MethodCall {
            return Ok(Handled::No);
        }
        let Some(path) = msg.path() else {
            return Ok(Handled::No);
        };
        let Some(node) = self.objects.lookup(path) else {
            return Ok(Handled::No);
        };

        for (_, handler) in node.callbacks {
            if (&mut *handler.borrow_mut())(self, msg)? == Handled::Yes {
                return Ok(Handled::Yes);
            }
        }

        // Property reads resolve against the vtables at this path.
        if msg.interface() == Some("org.freedesktop.DBus.Properties")
            && msg.member() == Some("Get")
        {
            return self.get_property(msg, &node.vtables);
        }

        let mut interface_known = false;
        for vtable in &node.vtables {
            match msg.interface() {
                Some(i) if i == vtable.interface => interface_known = true,
                Some(_) => continue,
                // Calls without an interface probe every vtable.
                None => {}
            }
            for (member, handler) in &vtable.methods {
                if msg.member() == Some(member.as_str()) {
                    let handler = handler.clone();
                    if (&mut *handler.borrow_mut())(self, msg)? == Handled::Yes {
                        return Ok(Handled::Yes);
                    }
                }
            }
        }

        if interface_known && !msg.no_reply_expected() {
            let reply = Message::method_error(
                msg,
                names::ERROR_UNKNOWN_METHOD,
                &format!(
                    "Unknown method '{}' on interface '{}'.",
                    msg.member().unwrap_or(""),
                    msg.interface().unwrap_or("")
                ),
            )?;
            self.send_oneway(reply)?;
            return Ok(Handled::Yes);
        }

        Ok(Handled::No)
    }

    fn get_property(&mut self, msg: &Message, vtables: &[Rc<Vtable>]) -> Result<Handled> {
        let args = msg.body_strings()?;
        if args.len() < 2 {
            let reply = Message::method_error(
                msg,
                names::ERROR_INVALID_ARGS,
                "Get expects an interface and a property name",
            )?;
            self.send_oneway(reply)?;
            return Ok(Handled::Yes);
        }

        for vtable in vtables {
            if vtable.interface != args[0] {
                continue;
            }
            for (name, getter) in &vtable.properties {
                if *name == args[1] {
                    let getter = getter.clone();
                    let value = (&mut *getter.borrow_mut())(self)?;
                    let mut reply = Message::method_return(msg)?;
                    reply.append_string(&value)?;
                    self.send_oneway(reply)?;
                    return Ok(Handled::Yes);
                }
            }
        }

        let reply = Message::method_error(
            msg,
            names::ERROR_UNKNOWN_METHOD,
            &format!("Unknown property '{}' on '{}'.", args[1], args[0]),
        )?;
        self.send_oneway(reply)?;
        Ok(Handled::Yes)
    }

    fn machine_id(&mut self) -> Result<String> {
        if let Some(id) = &self.machine_id {
            return Ok(id.clone());
        }
        let raw = std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .map_err(Error::Transport)?;
        let id = raw.trim().to_owned();
        if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::protocol("machine id file is malformed"));
        }
        self.machine_id = Some(id.clone());
        Ok(id)
    }

    // ── Waiting ────────────────────────────────────────────────────────

    /// Block until the connection is ready for another `process()` call or
    /// `timeout` elapses (`None` = no limit).
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.check_pid()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        if !self.rqueue.is_empty() {
            return Ok(true);
        }
        self.poll_transport(false, timeout)
    }

    fn poll_transport(&mut self, need_more: bool, timeout: Option<Duration>) -> Result<bool> {
        let events = self.desired_events()?;
        let (input_fd, output_fd) = self.fds()?;

        let mut limit = timeout;
        if need_more {
            // The caller wants more inbound data regardless of queues.
        } else if let Some(deadline) = self.next_deadline()? {
            let now = Instant::now();
            let until = deadline.saturating_duration_since(now);
            limit = Some(match limit {
                Some(l) => l.min(until),
                None => until,
            });
        }

        let poll_timeout = match limit {
            None => PollTimeout::NONE,
            Some(d) => PollTimeout::try_from(d.as_millis().min(i32::MAX as u128) as i32)
                .unwrap_or(PollTimeout::NONE),
        };

        let mut in_flags = PollFlags::empty();
        if events.readable || need_more {
            in_flags |= PollFlags::POLLIN;
        }
        let mut out_flags = PollFlags::empty();
        if events.writable {
            out_flags |= PollFlags::POLLOUT;
        }

        let input = unsafe { std::os::fd::BorrowedFd::borrow_raw(input_fd) };
        let n = if input_fd == output_fd {
            let mut fds = [PollFd::new(input, in_flags | out_flags)];
            nix::poll::poll(&mut fds, poll_timeout)?
        } else {
            let output = unsafe { std::os::fd::BorrowedFd::borrow_raw(output_fd) };
            let mut fds = [
                PollFd::new(input, in_flags),
                PollFd::new(output, out_flags),
            ];
            nix::poll::poll(&mut fds, poll_timeout)?
        };

        Ok(n > 0)
    }

    /// Write out everything queued, waiting as needed.
    pub fn flush(&mut self) -> Result<()> {
        self.check_pid()?;
        if !self.state.is_open() {
            return Err(Error::NotConnected);
        }
        self.ensure_running()?;

        loop {
            self.flush_wqueue()?;
            if self.wqueue.is_empty() {
                return Ok(());
            }
            self.poll_transport(false, None)?;
        }
    }

    // ── Hello ──────────────────────────────────────────────────────────

    fn send_hello(&mut self) -> Result<()> {
        let hello = Message::method_call(
            names::DBUS_SERVICE,
            names::DBUS_PATH,
            names::DBUS_INTERFACE,
            "Hello",
        )?;

        let serial = self.call_async(
            hello,
            Timeout::Default,
            Box::new(|conn, reply| conn.hello_reply(reply)),
        )?;
        self.hello_serial = Some(serial);
        Ok(())
    }

    fn hello_reply(&mut self, reply: &Message) -> Result<()> {
        if reply.message_type() == MessageType::MethodError {
            self.close();
            return Err(remote_error(reply));
        }

        let name = reply.body_string()?;
        if !name.starts_with(':') {
            self.close();
            return Err(Error::protocol(format!(
                "broker assigned malformed unique name {:?}",
                name
            )));
        }

        debug!("connected to bus as {}", name);
        self.unique_name = Some(name);
        self.state = State::Running;
        Ok(())
    }

    // ── Filters, matches, objects ──────────────────────────────────────

    pub fn add_filter(&mut self, handler: MessageHandler) -> Result<FilterId> {
        self.check_pid()?;
        Ok(self.filters.add(handler))
    }

    pub fn remove_filter(&mut self, id: FilterId) -> Result<bool> {
        self.check_pid()?;
        Ok(self.filters.remove(id))
    }

    /// Subscribe to messages matching `rule`. On a bus connection the rule
    /// is also registered with the broker.
    pub fn add_match(&mut self, rule: &str, handler: MessageHandler) -> Result<MatchId> {
        self.check_pid()?;
        self.match_cookie += 1;
        let cookie = self.match_cookie;
        let id = self.matches.add(rule, cookie, handler)?;

        if self.bus_client {
            if let Err(e) = self.send_match_update("AddMatch", rule) {
                self.matches.remove(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    pub fn remove_match(&mut self, id: MatchId) -> Result<bool> {
        self.check_pid()?;
        let Some((rule, _cookie)) = self.matches.remove(id) else {
            return Ok(false);
        };
        if self.bus_client && self.state.is_open() {
            // Best effort; the broker drops the rule with the connection
            // anyway.
            if let Err(e) = self.send_match_update("RemoveMatch", &rule) {
                debug!("RemoveMatch not sent: {}", e);
            }
        }
        Ok(true)
    }

    fn send_match_update(&mut self, member: &str, rule: &str) -> Result<()> {
        let mut msg = Message::method_call(
            names::DBUS_SERVICE,
            names::DBUS_PATH,
            names::DBUS_INTERFACE,
            member,
        )?;
        msg.append_string(rule)?;
        self.send_oneway(msg)
    }

    pub fn add_object(&mut self, path: &str, handler: MessageHandler) -> Result<ObjectId> {
        self.check_pid()?;
        check_object_path(path)?;
        Ok(self.objects.add_callback(path, handler))
    }

    pub fn add_object_vtable(&mut self, path: &str, vtable: Vtable) -> Result<ObjectId> {
        self.check_pid()?;
        check_object_path(path)?;
        Ok(self.objects.add_vtable(path, vtable))
    }

    pub fn add_object_enumerator(
        &mut self,
        path: &str,
        enumerator: Enumerator,
    ) -> Result<ObjectId> {
        self.check_pid()?;
        check_object_path(path)?;
        Ok(self.objects.add_enumerator(path, enumerator))
    }

    pub fn remove_object(&mut self, id: ObjectId) -> Result<bool> {
        self.check_pid()?;
        Ok(self.objects.remove(id))
    }

    /// Every installed object path, including those contributed by
    /// enumerator hooks.
    pub fn object_paths(&mut self) -> Result<Vec<String>> {
        self.check_pid()?;
        let mut paths = self.objects.registered_paths();
        for enumerator in self.objects.enumerators() {
            paths.extend((&mut *enumerator.borrow_mut())(self)?);
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    // ── Reply helpers ──────────────────────────────────────────────────

    /// Answer `call` with an empty method return.
    pub fn reply_method_return(&mut self, call: &Message) -> Result<()> {
        if call.no_reply_expected() {
            return Ok(());
        }
        let reply = Message::method_return(call)?;
        self.send_oneway(reply)
    }

    /// Answer `call` with a named error.
    pub fn reply_method_error(&mut self, call: &Message, name: &str, text: &str) -> Result<()> {
        if call.no_reply_expected() {
            return Ok(());
        }
        let reply = Message::method_error(call, name, text)?;
        self.send_oneway(reply)
    }

    /// Shared buffer pool for kernel-transport frames.
    pub fn memfd_cache(&self) -> &MemfdCache {
        &self.memfd_cache
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Full teardown: queues, callbacks, trees, pooled buffers, and the
        // transport itself (kernel fds included, now that nothing can
        // reference the bus anymore).
        self.close();
        self.wqueue.clear();
        self.rqueue.clear();
        self.replies.clear();
        self.filters.clear();
        self.matches.clear();
        self.objects.clear();
        self.kernel_stage = None;
        self.memfd_cache.flush();

        if let Some(mut ep) = self.endpoint.take() {
            if let Some(child) = ep.child.take() {
                self.exec_child = Some(child);
            }
        }
        if let Some(mut child) = self.exec_child.take() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(child.id() as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
            let _ = child.wait();
        }
    }
}

fn check_object_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::invalid("object path must start with '/'"));
    }
    Ok(())
}

/// Turn a method-error message into the error value handed to callers.
pub(crate) fn remote_error(msg: &Message) -> Error {
    Error::Remote {
        name: msg
            .error_name()
            .unwrap_or("org.freedesktop.DBus.Error.Failed")
            .to_owned(),
        message: msg.body_string().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_defaults() {
        let conn = Connection::new();
        assert_eq!(conn.state(), State::Unset);
        assert!(conn.unique_name().is_none());
        assert!(conn.accept_fd);
        assert!(conn.builtin_peer);
    }

    #[test]
    fn setters_require_unset() {
        let mut conn = Connection::new();
        conn.set_address("unix:path=/tmp/x").unwrap();
        conn.state = State::Running;
        match conn.set_address("unix:path=/tmp/y") {
            Err(Error::PermissionDenied(State::Running)) => {}
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
        assert!(conn.set_bus_client(true).is_err());
        assert!(conn.negotiate_fds(false).is_err());
    }

    #[test]
    fn start_without_configuration_fails() {
        let mut conn = Connection::new();
        match conn.start() {
            Err(Error::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn server_and_bus_client_conflict() {
        let mut conn = Connection::new();
        conn.set_server(true, Uuid::new_v4()).unwrap();
        conn.set_bus_client(true).unwrap();
        conn.set_address("unix:path=/tmp/x").unwrap();
        assert!(conn.start().is_err());
    }

    #[test]
    fn process_after_close_is_not_connected() {
        let mut conn = Connection::new();
        conn.state = State::Running;
        conn.close();
        assert_eq!(conn.state(), State::Closed);
        assert!(matches!(conn.process(), Err(Error::NotConnected)));
        assert!(matches!(conn.wait(None), Err(Error::NotConnected)));
        assert!(matches!(conn.flush(), Err(Error::NotConnected)));
        // close() stays idempotent.
        conn.close();
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn exhausted_address_list_reports_last_error() {
        let mut conn = Connection::new();
        conn.set_address("unix:path=/nonexistent/one;unix:path=/nonexistent/two")
            .unwrap();
        match conn.start() {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {:?}", other),
        }
        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn serials_increase_monotonically() {
        let mut conn = Connection::new();
        let mut previous = 0;
        for _ in 0..5 {
            let mut m = Message::method_call("", "/", "a.b", "M").unwrap();
            conn.seal(&mut m).unwrap();
            let serial = m.serial().unwrap();
            assert!(serial > previous);
            previous = serial;
        }
    }

    #[test]
    fn sealing_through_connection_is_idempotent() {
        let mut conn = Connection::new();
        let mut m = Message::method_call("", "/", "a.b", "M").unwrap();
        conn.seal(&mut m).unwrap();
        let first = m.serial().unwrap();
        conn.seal(&mut m).unwrap();
        assert_eq!(m.serial(), Some(first));
    }

    #[test]
    fn cancel_reply_validates_serial() {
        let mut conn = Connection::new();
        assert!(matches!(
            conn.cancel_reply(0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!conn.cancel_reply(42).unwrap());
    }

    #[test]
    fn object_path_validation() {
        let mut conn = Connection::new();
        assert!(conn
            .add_object("relative", crate::filter::handler(|_, _| Ok(Handled::No)))
            .is_err());
        let id = conn
            .add_object("/ok", crate::filter::handler(|_, _| Ok(Handled::No)))
            .unwrap();
        assert!(conn.remove_object(id).unwrap());
    }
}
