//! # Stream I/O
//!
//! Non-blocking byte plumbing shared by every stream-like transport: frame
//! writes with a resumable cursor, frame reads through a growable buffer,
//! `SCM_RIGHTS` file-descriptor passing on sockets, and the line-oriented
//! reads the authentication handshake needs before framing starts.
//!
//! Everything here is cursor-in, progress-out: a short read or write leaves
//! state in the buffers and reports how far it got, the caller decides when
//! to come back.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::error::{Error, Result};
use crate::message::Message;

const READ_CHUNK: usize = 4096;
const MAX_FDS_PER_MESSAGE: usize = 16;

fn sys_read(fd: RawFd, buf: &mut [u8]) -> std::result::Result<usize, Errno> {
    nix::unistd::read(fd, buf)
}

fn sys_write(fd: RawFd, buf: &[u8]) -> std::result::Result<usize, Errno> {
    nix::unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, buf)
}

/// Buffered reader/writer state for one connection.
///
/// The read buffer is shared between the auth phase (line reads) and the
/// running phase (frame reads): bytes the broker sends right after its final
/// auth line are message bytes and must not be lost.
#[derive(Default)]
pub struct StreamIo {
    rbuf: Vec<u8>,
    /// Descriptors received but not yet claimed by a parsed message.
    rfds: Vec<OwnedFd>,
    /// Whether the fd is a socket; pipes get plain read/write.
    socket: bool,
}

impl StreamIo {
    pub fn new(socket: bool) -> Self {
        Self {
            rbuf: Vec::new(),
            rfds: Vec::new(),
            socket,
        }
    }

    /// Write message bytes starting at `windex`.
    ///
    /// Attached fds travel with the first byte of the message. Returns the
    /// number of bytes written; zero means the kernel buffer is full.
    pub fn write_message(&mut self, fd: RawFd, msg: &Message, windex: usize) -> Result<usize> {
        let wire = msg.wire()?;
        debug_assert!(windex < wire.len());

        let outcome = if self.socket && windex == 0 && !msg.fds().is_empty() {
            let raw_fds: Vec<RawFd> = msg.fds().iter().map(|f| f.as_raw_fd()).collect();
            let iov = [IoSlice::new(wire)];
            let cmsg = [ControlMessage::ScmRights(&raw_fds)];
            sendmsg::<()>(fd, &iov, &cmsg, MsgFlags::MSG_NOSIGNAL, None)
        } else if self.socket {
            let iov = [IoSlice::new(&wire[windex..])];
            sendmsg::<()>(fd, &iov, &[], MsgFlags::MSG_NOSIGNAL, None)
        } else {
            sys_write(fd, &wire[windex..])
        };

        match outcome {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Read until a complete frame is buffered or the fd would block.
    ///
    /// `Ok(None)` means no complete frame yet; a peer hangup surfaces as a
    /// `Transport` error.
    pub fn read_message(&mut self, fd: RawFd) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = self.take_frame()? {
                return Ok(Some(msg));
            }

            match self.fill(fd)? {
                0 => return Ok(None),
                _ => continue,
            }
        }
    }

    /// Read one `\r\n`-terminated line, for the auth handshake.
    pub fn read_line(&mut self, fd: RawFd) -> Result<Option<String>> {
        loop {
            if let Some(pos) = find_crlf(&self.rbuf) {
                let line: Vec<u8> = self.rbuf.drain(..pos + 2).collect();
                let line = std::str::from_utf8(&line[..pos])
                    .map_err(|_| Error::Auth("handshake line is not ASCII".into()))?
                    .to_owned();
                return Ok(Some(line));
            }
            if self.rbuf.len() > 4096 {
                return Err(Error::Auth("handshake line too long".into()));
            }

            match self.fill(fd)? {
                0 => return Ok(None),
                _ => continue,
            }
        }
    }

    /// Write part of the auth output buffer. Zero means try again later.
    pub fn write_some(&mut self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        let outcome = if self.socket {
            let iov = [IoSlice::new(buf)];
            sendmsg::<()>(fd, &iov, &[], MsgFlags::MSG_NOSIGNAL, None)
        } else {
            sys_write(fd, buf)
        };
        match outcome {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// One read into the buffer. Returns bytes gained; zero on WouldBlock.
    fn fill(&mut self, fd: RawFd) -> Result<usize> {
        let old_len = self.rbuf.len();
        self.rbuf.resize(old_len + READ_CHUNK, 0);

        let outcome = if self.socket {
            let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
            let mut iov = [IoSliceMut::new(&mut self.rbuf[old_len..])];
            match recvmsg::<()>(
                fd,
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(received) => match received.cmsgs() {
                    Ok(cmsgs) => {
                        let mut incoming = Vec::new();
                        for cmsg in cmsgs {
                            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                                for r in raw {
                                    incoming.push(unsafe { OwnedFd::from_raw_fd(r) });
                                }
                            }
                        }
                        self.rfds.extend(incoming);
                        Ok(received.bytes)
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        } else {
            sys_read(fd, &mut self.rbuf[old_len..])
        };

        match outcome {
            Ok(0) => {
                self.rbuf.truncate(old_len);
                Err(Error::Transport(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                )))
            }
            Ok(n) => {
                self.rbuf.truncate(old_len + n);
                Ok(n)
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {
                self.rbuf.truncate(old_len);
                Ok(0)
            }
            Err(e) => {
                self.rbuf.truncate(old_len);
                Err(e.into())
            }
        }
    }

    /// Extract one complete frame from the buffer, if present.
    fn take_frame(&mut self) -> Result<Option<Message>> {
        let Some(total) = Message::required_size(&self.rbuf)? else {
            return Ok(None);
        };
        if self.rbuf.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.rbuf.drain(..total).collect();
        let fds = std::mem::take(&mut self.rfds);
        let msg = Message::from_wire(frame, fds)?;
        Ok(Some(msg))
    }

    /// Leftover bytes currently buffered. Used by tests and diagnostics.
    pub fn buffered(&self) -> usize {
        self.rbuf.len()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Put an fd into non-blocking close-on-exec mode, as every dialer must
/// before handing it to the engine.
pub fn prepare_fd(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};

    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut oflags = OFlag::from_bits_truncate(flags);
    oflags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(oflags))?;

    let flags = fcntl(fd, FcntlArg::F_GETFD)?;
    let mut fdflags = FdFlag::from_bits_truncate(flags);
    fdflags.insert(FdFlag::FD_CLOEXEC);
    fcntl(fd, FcntlArg::F_SETFD(fdflags))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    fn sealed(serial: u32) -> Message {
        let mut m = Message::method_call("org.x", "/o", "i.f", "M").unwrap();
        m.append_string("payload").unwrap();
        m.seal(serial).unwrap();
        m
    }

    #[test]
    fn frame_round_trip_over_socketpair() {
        let (a, b) = pair();
        let mut writer = StreamIo::new(true);
        let mut reader = StreamIo::new(true);

        let msg = sealed(5);
        let mut windex = 0;
        while windex < msg.size() {
            windex += writer.write_message(a.as_raw_fd(), &msg, windex).unwrap();
        }

        let got = reader.read_message(b.as_raw_fd()).unwrap().unwrap();
        assert_eq!(got.serial(), Some(5));
        assert_eq!(got.member(), Some("M"));
        assert_eq!(got.body_string().unwrap(), "payload");
    }

    #[test]
    fn read_would_block_without_data() {
        let (_a, b) = pair();
        let mut reader = StreamIo::new(true);
        assert!(reader.read_message(b.as_raw_fd()).unwrap().is_none());
    }

    #[test]
    fn hangup_is_a_transport_error() {
        let (a, b) = pair();
        drop(a);
        let mut reader = StreamIo::new(true);
        match reader.read_message(b.as_raw_fd()) {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn line_reads_leave_message_bytes_buffered() {
        let (a, b) = pair();
        let mut reader = StreamIo::new(true);

        // An auth line followed immediately by the start of a frame.
        let msg = sealed(9);
        let mut bytes = b"OK 0123456789abcdef0123456789abcdef\r\n".to_vec();
        bytes.extend_from_slice(msg.wire().unwrap());
        let mut writer = StreamIo::new(true);
        let mut off = 0;
        while off < bytes.len() {
            off += writer.write_some(a.as_raw_fd(), &bytes[off..]).unwrap();
        }

        let line = reader.read_line(b.as_raw_fd()).unwrap().unwrap();
        assert!(line.starts_with("OK "));

        let got = reader.read_message(b.as_raw_fd()).unwrap().unwrap();
        assert_eq!(got.serial(), Some(9));
    }

    #[test]
    fn fds_ride_along_with_their_frame() {
        let (a, b) = pair();
        let (extra_r, extra_w) = pair();
        drop(extra_w);

        let mut msg = Message::method_call("org.x", "/o", "i.f", "TakeFd").unwrap();
        msg.append_fd(extra_r).unwrap();
        msg.seal(2).unwrap();

        let mut writer = StreamIo::new(true);
        let mut windex = 0;
        while windex < msg.size() {
            windex += writer.write_message(a.as_raw_fd(), &msg, windex).unwrap();
        }

        let mut reader = StreamIo::new(true);
        let got = reader.read_message(b.as_raw_fd()).unwrap().unwrap();
        assert_eq!(got.fds().len(), 1);
    }
}
