//! # Message Marshalling
//!
//! An owned, marshalled D-Bus message: fixed little/big-endian header,
//! header-field array, signature-typed body, and any attached file
//! descriptors. The engine treats messages as opaque once *sealed* — sealing
//! assigns the outgoing serial exactly once and freezes the wire image, so
//! queues and the partial-write cursor can account in plain bytes.
//!
//! Only the pieces the connection engine relies on are implemented: size
//! accounting, sealing, serial/type/field access, and string bodies (enough
//! for `Hello`, the built-in peer interface, and error replies). Complex
//! container types are out of scope for the engine itself.

use std::fmt;
use std::os::fd::OwnedFd;

use crate::error::{Error, Result};

/// Well-known bus names, paths and error names.
pub mod names {
    /// The message bus service itself.
    pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
    /// Object path of the message bus.
    pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
    /// Interface of the message bus.
    pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
    /// Built-in peer interface every connection answers.
    pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

    pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
}

/// Message kind, as carried in the header type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    MethodError = 3,
    Signal = 4,
}

impl MessageType {
    fn from_wire(b: u8) -> Result<Self> {
        match b {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::MethodError),
            4 => Ok(MessageType::Signal),
            other => Err(Error::protocol(format!("unknown message type {}", other))),
        }
    }
}

/// Header flag: the sender does not want a reply.
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;
/// Header flag: do not autostart the destination.
pub const FLAG_NO_AUTO_START: u8 = 0x2;

/// Message protocol version the engine speaks.
pub const PROTOCOL_VERSION: u8 = 1;

// Header field codes.
const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

/// The logical header fields of a message.
#[derive(Debug, Default, Clone)]
pub struct Fields {
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: String,
}

/// An owned D-Bus message.
///
/// Built unsealed, then sealed by the connection when sent. Inbound messages
/// arrive already sealed with the wire image they were read from.
pub struct Message {
    ty: MessageType,
    flags: u8,
    serial: u32,
    fields: Fields,
    body: Vec<u8>,
    fds: Vec<OwnedFd>,
    big_endian: bool,
    /// Complete wire image, present once sealed.
    wire: Option<Vec<u8>>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.ty)
            .field("serial", &self.serial)
            .field("path", &self.fields.path)
            .field("interface", &self.fields.interface)
            .field("member", &self.fields.member)
            .field("reply_serial", &self.fields.reply_serial)
            .field("sealed", &self.wire.is_some())
            .finish()
    }
}

impl Message {
    fn new(ty: MessageType) -> Self {
        Self {
            ty,
            flags: 0,
            serial: 0,
            fields: Fields::default(),
            body: Vec::new(),
            fds: Vec::new(),
            big_endian: false,
            wire: None,
        }
    }

    /// New method call.
    pub fn method_call(
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Self> {
        if path.is_empty() || member.is_empty() {
            return Err(Error::invalid("method call needs a path and a member"));
        }
        let mut m = Self::new(MessageType::MethodCall);
        m.fields.destination = non_empty(destination);
        m.fields.path = Some(path.to_owned());
        m.fields.interface = non_empty(interface);
        m.fields.member = Some(member.to_owned());
        Ok(m)
    }

    /// New method return answering `call`.
    pub fn method_return(call: &Message) -> Result<Self> {
        let serial = call.serial_checked()?;
        let mut m = Self::new(MessageType::MethodReturn);
        m.fields.reply_serial = Some(serial);
        m.fields.destination = call.fields.sender.clone();
        Ok(m)
    }

    /// New method error answering `call`.
    pub fn method_error(call: &Message, name: &str, text: &str) -> Result<Self> {
        let serial = call.serial_checked()?;
        let mut m = Self::new(MessageType::MethodError);
        m.fields.reply_serial = Some(serial);
        m.fields.error_name = Some(name.to_owned());
        m.fields.destination = call.fields.sender.clone();
        if !text.is_empty() {
            m.append_string(text)?;
        }
        Ok(m)
    }

    /// New signal.
    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Self> {
        if path.is_empty() || interface.is_empty() || member.is_empty() {
            return Err(Error::invalid("signal needs path, interface and member"));
        }
        let mut m = Self::new(MessageType::Signal);
        m.fields.path = Some(path.to_owned());
        m.fields.interface = Some(interface.to_owned());
        m.fields.member = Some(member.to_owned());
        Ok(m)
    }

    /// A locally fabricated error, used when no real reply will ever come
    /// (reply timeouts). Carries the serial it answers and is already
    /// sealed with serial 1, like a peer-sent frame would be.
    pub fn synthetic_error(reply_serial: u32, name: &str, text: &str) -> Result<Self> {
        let mut m = Self::new(MessageType::MethodError);
        m.fields.reply_serial = Some(reply_serial);
        m.fields.error_name = Some(name.to_owned());
        m.fields.sender = Some(names::DBUS_SERVICE.to_owned());
        m.append_string(text)?;
        m.seal(1)?;
        Ok(m)
    }

    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Mark that no reply is expected for this call.
    pub fn set_no_reply_expected(&mut self) -> Result<()> {
        if self.wire.is_some() {
            return Err(Error::invalid("message is sealed"));
        }
        self.flags |= FLAG_NO_REPLY_EXPECTED;
        Ok(())
    }

    pub fn no_reply_expected(&self) -> bool {
        self.flags & FLAG_NO_REPLY_EXPECTED != 0
    }

    /// Serial, if sealed (or inbound).
    pub fn serial(&self) -> Option<u32> {
        if self.serial == 0 {
            None
        } else {
            Some(self.serial)
        }
    }

    fn serial_checked(&self) -> Result<u32> {
        self.serial()
            .ok_or_else(|| Error::invalid("message has no serial yet"))
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.fields.reply_serial
    }

    pub fn path(&self) -> Option<&str> {
        self.fields.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.fields.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.fields.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.fields.error_name.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.fields.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.fields.sender.as_deref()
    }

    pub fn signature(&self) -> &str {
        &self.fields.signature
    }

    /// Whether this is a method-return or method-error.
    pub fn is_reply(&self) -> bool {
        matches!(
            self.ty,
            MessageType::MethodReturn | MessageType::MethodError
        )
    }

    /// File descriptors attached to this message. Ownership stays with the
    /// message; they are closed when it is dropped.
    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Attach a file descriptor. The message takes ownership.
    pub fn append_fd(&mut self, fd: OwnedFd) -> Result<()> {
        if self.wire.is_some() {
            return Err(Error::invalid("message is sealed"));
        }
        self.fds.push(fd);
        Ok(())
    }

    /// Append a string argument to the body.
    pub fn append_string(&mut self, s: &str) -> Result<()> {
        if self.wire.is_some() {
            return Err(Error::invalid("message is sealed"));
        }
        align_buf(&mut self.body, 4);
        self.body.extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.body.extend_from_slice(s.as_bytes());
        self.body.push(0);
        self.fields.signature.push('s');
        Ok(())
    }

    /// Read the body as a single string argument.
    pub fn body_string(&self) -> Result<String> {
        if !self.fields.signature.starts_with('s') {
            return Err(Error::protocol(format!(
                "expected string body, signature is {:?}",
                self.fields.signature
            )));
        }
        let mut dec = Decoder::new(&self.body, self.big_endian);
        dec.read_string()
    }

    /// Read the leading run of string arguments from the body.
    ///
    /// Stops at the first non-string element of the signature. Used by
    /// match-rule `argN` comparisons and the built-in property dispatch.
    pub fn body_strings(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut dec = Decoder::new(&self.body, self.big_endian);
        for ch in self.fields.signature.chars() {
            if ch != 's' {
                break;
            }
            out.push(dec.read_string()?);
        }
        Ok(out)
    }

    /// Whether the wire image has been produced.
    pub fn is_sealed(&self) -> bool {
        self.wire.is_some()
    }

    /// Assign `serial` and freeze the wire image. Sealing a sealed message
    /// is a no-op; the original serial wins.
    pub fn seal(&mut self, serial: u32) -> Result<()> {
        if self.wire.is_some() {
            return Ok(());
        }
        if serial == 0 {
            return Err(Error::invalid("serial must be positive"));
        }

        self.serial = serial;

        let mut hdr = Vec::with_capacity(128 + self.body.len());
        hdr.push(b'l');
        hdr.push(self.ty as u8);
        hdr.push(self.flags);
        hdr.push(PROTOCOL_VERSION);
        hdr.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        hdr.extend_from_slice(&serial.to_le_bytes());

        // Header-field array: length prefix, then (BYTE, VARIANT) structs
        // each aligned to 8. Data begins at offset 16, which is already
        // 8-aligned, so the length counts from there.
        let len_at = hdr.len();
        hdr.extend_from_slice(&0u32.to_le_bytes());
        let fields_start = hdr.len();

        if let Some(v) = &self.fields.path {
            put_string_field(&mut hdr, FIELD_PATH, b'o', v);
        }
        if let Some(v) = &self.fields.interface {
            put_string_field(&mut hdr, FIELD_INTERFACE, b's', v);
        }
        if let Some(v) = &self.fields.member {
            put_string_field(&mut hdr, FIELD_MEMBER, b's', v);
        }
        if let Some(v) = &self.fields.error_name {
            put_string_field(&mut hdr, FIELD_ERROR_NAME, b's', v);
        }
        if let Some(v) = self.fields.reply_serial {
            put_u32_field(&mut hdr, FIELD_REPLY_SERIAL, v);
        }
        if let Some(v) = &self.fields.destination {
            put_string_field(&mut hdr, FIELD_DESTINATION, b's', v);
        }
        if let Some(v) = &self.fields.sender {
            put_string_field(&mut hdr, FIELD_SENDER, b's', v);
        }
        if !self.fields.signature.is_empty() {
            put_signature_field(&mut hdr, &self.fields.signature);
        }
        if !self.fds.is_empty() {
            put_u32_field(&mut hdr, FIELD_UNIX_FDS, self.fds.len() as u32);
        }

        let fields_len = (hdr.len() - fields_start) as u32;
        hdr[len_at..len_at + 4].copy_from_slice(&fields_len.to_le_bytes());

        // Body starts on the next 8-byte boundary.
        align_buf(&mut hdr, 8);
        hdr.extend_from_slice(&self.body);

        self.wire = Some(hdr);
        Ok(())
    }

    /// The sealed wire image.
    pub fn wire(&self) -> Result<&[u8]> {
        self.wire
            .as_deref()
            .ok_or_else(|| Error::invalid("message is not sealed"))
    }

    /// Total wire length of the sealed message.
    pub fn size(&self) -> usize {
        self.wire.as_ref().map(|w| w.len()).unwrap_or(0)
    }

    /// How many bytes a frame starting with `buf` occupies in total, or
    /// `None` if not even the fixed header has arrived yet.
    pub fn required_size(buf: &[u8]) -> Result<Option<usize>> {
        if buf.len() < 16 {
            return Ok(None);
        }
        let big_endian = match buf[0] {
            b'l' => false,
            b'B' => true,
            other => {
                return Err(Error::protocol(format!(
                    "bad endianness marker {:#x}",
                    other
                )))
            }
        };
        if buf[3] > PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "unsupported protocol version {}",
                buf[3]
            )));
        }
        let body_len = read_u32_at(buf, 4, big_endian) as usize;
        let fields_len = read_u32_at(buf, 12, big_endian) as usize;
        if body_len > MAX_MESSAGE_SIZE || fields_len > MAX_MESSAGE_SIZE {
            return Err(Error::protocol("frame exceeds maximum message size"));
        }
        Ok(Some(align_up(16 + fields_len, 8) + body_len))
    }

    /// Parse a complete frame. `fds` are the descriptors that arrived with
    /// it; the message takes ownership.
    pub fn from_wire(buf: Vec<u8>, fds: Vec<OwnedFd>) -> Result<Self> {
        let total = Self::required_size(&buf)?
            .ok_or_else(|| Error::protocol("truncated message header"))?;
        if buf.len() != total {
            return Err(Error::protocol("frame length mismatch"));
        }

        let big_endian = buf[0] == b'B';
        let ty = MessageType::from_wire(buf[1])?;
        let flags = buf[2];
        let body_len = read_u32_at(&buf, 4, big_endian) as usize;
        let serial = read_u32_at(&buf, 8, big_endian);
        if serial == 0 {
            return Err(Error::protocol("message serial is zero"));
        }
        let fields_len = read_u32_at(&buf, 12, big_endian) as usize;

        let mut fields = Fields::default();
        let mut dec = Decoder::with_offset(&buf, 16, big_endian);
        let fields_end = 16 + fields_len;
        while dec.pos < fields_end {
            dec.align(8)?;
            if dec.pos >= fields_end {
                break;
            }
            let code = dec.read_u8()?;
            let sig = dec.read_signature()?;
            match (code, sig.as_str()) {
                (FIELD_PATH, "o") => fields.path = Some(dec.read_string()?),
                (FIELD_INTERFACE, "s") => fields.interface = Some(dec.read_string()?),
                (FIELD_MEMBER, "s") => fields.member = Some(dec.read_string()?),
                (FIELD_ERROR_NAME, "s") => fields.error_name = Some(dec.read_string()?),
                (FIELD_REPLY_SERIAL, "u") => fields.reply_serial = Some(dec.read_u32()?),
                (FIELD_DESTINATION, "s") => fields.destination = Some(dec.read_string()?),
                (FIELD_SENDER, "s") => fields.sender = Some(dec.read_string()?),
                (FIELD_SIGNATURE, "g") => fields.signature = dec.read_signature()?,
                (FIELD_UNIX_FDS, "u") => {
                    let n = dec.read_u32()? as usize;
                    if n != fds.len() {
                        return Err(Error::protocol(format!(
                            "message announces {} fds, {} arrived",
                            n,
                            fds.len()
                        )));
                    }
                }
                // Unknown fields with simple signatures are skipped.
                (_, "s") | (_, "o") => {
                    dec.read_string()?;
                }
                (_, "u") => {
                    dec.read_u32()?;
                }
                (_, "g") => {
                    dec.read_signature()?;
                }
                (code, sig) => {
                    return Err(Error::protocol(format!(
                        "unsupported header field {} with signature {:?}",
                        code, sig
                    )));
                }
            }
        }

        // Minimal validity per type, mirroring the reference broker rules.
        match ty {
            MessageType::MethodCall => {
                if fields.path.is_none() || fields.member.is_none() {
                    return Err(Error::protocol("method call without path or member"));
                }
            }
            MessageType::MethodReturn | MessageType::MethodError => {
                if fields.reply_serial.is_none() {
                    return Err(Error::protocol("reply without reply-serial"));
                }
            }
            MessageType::Signal => {
                if fields.path.is_none() || fields.interface.is_none() || fields.member.is_none() {
                    return Err(Error::protocol("signal without full origin"));
                }
            }
        }

        let body_start = align_up(16 + fields_len, 8);
        let body = buf[body_start..body_start + body_len].to_vec();

        Ok(Self {
            ty,
            flags,
            serial,
            fields,
            body,
            fds,
            big_endian,
            wire: Some(buf),
        })
    }
}

/// Hard cap on a single message, matching the reference implementation's
/// 128 MiB limit.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_owned())
    }
}

fn align_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

fn align_buf(buf: &mut Vec<u8>, to: usize) {
    while buf.len() % to != 0 {
        buf.push(0);
    }
}

fn put_string_field(buf: &mut Vec<u8>, code: u8, type_char: u8, value: &str) {
    align_buf(buf, 8);
    buf.push(code);
    // Variant signature: one type character.
    buf.push(1);
    buf.push(type_char);
    buf.push(0);
    align_buf(buf, 4);
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

fn put_u32_field(buf: &mut Vec<u8>, code: u8, value: u32) {
    align_buf(buf, 8);
    buf.push(code);
    buf.push(1);
    buf.push(b'u');
    buf.push(0);
    align_buf(buf, 4);
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_signature_field(buf: &mut Vec<u8>, signature: &str) {
    align_buf(buf, 8);
    buf.push(FIELD_SIGNATURE);
    buf.push(1);
    buf.push(b'g');
    buf.push(0);
    buf.push(signature.len() as u8);
    buf.extend_from_slice(signature.as_bytes());
    buf.push(0);
}

fn read_u32_at(buf: &[u8], at: usize, big_endian: bool) -> u32 {
    let raw: [u8; 4] = buf[at..at + 4].try_into().unwrap_or_default();
    if big_endian {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    }
}

/// Byte-level reader over a marshalled buffer.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8], big_endian: bool) -> Self {
        Self {
            buf,
            pos: 0,
            big_endian,
        }
    }

    fn with_offset(buf: &'a [u8], pos: usize, big_endian: bool) -> Self {
        Self {
            buf,
            pos,
            big_endian,
        }
    }

    fn align(&mut self, to: usize) -> Result<()> {
        let next = align_up(self.pos, to);
        if next > self.buf.len() {
            return Err(Error::protocol("truncated message"));
        }
        self.pos = next;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::protocol("truncated message"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let raw: [u8; 4] = self.take(4)?.try_into().unwrap_or_default();
        Ok(if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::protocol("string is not valid UTF-8"))?
            .to_owned();
        let nul = self.read_u8()?;
        if nul != 0 {
            return Err(Error::protocol("string is not NUL-terminated"));
        }
        Ok(s)
    }

    fn read_signature(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::protocol("signature is not valid UTF-8"))?
            .to_owned();
        let nul = self.read_u8()?;
        if nul != 0 {
            return Err(Error::protocol("signature is not NUL-terminated"));
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_seals_and_reparses() {
        let mut m = Message::method_call("org.example.Svc", "/org/example", "org.example", "Frob")
            .unwrap();
        m.append_string("hello").unwrap();
        m.seal(42).unwrap();

        let wire = m.wire().unwrap().to_vec();
        assert_eq!(Message::required_size(&wire).unwrap(), Some(wire.len()));

        let back = Message::from_wire(wire, Vec::new()).unwrap();
        assert_eq!(back.message_type(), MessageType::MethodCall);
        assert_eq!(back.serial(), Some(42));
        assert_eq!(back.path(), Some("/org/example"));
        assert_eq!(back.interface(), Some("org.example"));
        assert_eq!(back.member(), Some("Frob"));
        assert_eq!(back.destination(), Some("org.example.Svc"));
        assert_eq!(back.signature(), "s");
        assert_eq!(back.body_string().unwrap(), "hello");
    }

    #[test]
    fn sealing_twice_keeps_first_serial() {
        let mut m = Message::method_call("", "/", "i.f", "M").unwrap();
        m.seal(7).unwrap();
        m.seal(8).unwrap();
        assert_eq!(m.serial(), Some(7));
    }

    #[test]
    fn serial_zero_is_rejected() {
        let mut m = Message::method_call("", "/", "i.f", "M").unwrap();
        assert!(m.seal(0).is_err());
    }

    #[test]
    fn method_return_carries_reply_serial() {
        let mut call = Message::method_call("", "/obj", "i.f", "Ping").unwrap();
        call.seal(9).unwrap();
        let mut reply = Message::method_return(&call).unwrap();
        reply.seal(1).unwrap();
        assert_eq!(reply.reply_serial(), Some(9));
        assert!(reply.is_reply());
    }

    #[test]
    fn method_error_round_trips_name_and_text() {
        let mut call = Message::method_call("", "/obj", "i.f", "Nope").unwrap();
        call.seal(3).unwrap();
        let mut err = Message::method_error(&call, names::ERROR_UNKNOWN_METHOD, "no such method")
            .unwrap();
        err.seal(5).unwrap();

        let back = Message::from_wire(err.wire().unwrap().to_vec(), Vec::new()).unwrap();
        assert_eq!(back.message_type(), MessageType::MethodError);
        assert_eq!(back.error_name(), Some(names::ERROR_UNKNOWN_METHOD));
        assert_eq!(back.body_string().unwrap(), "no such method");
    }

    #[test]
    fn synthetic_error_is_presealed() {
        let m = Message::synthetic_error(11, names::ERROR_NO_REPLY, "Method call timed out")
            .unwrap();
        assert!(m.is_sealed());
        assert_eq!(m.reply_serial(), Some(11));
        assert_eq!(m.error_name(), Some(names::ERROR_NO_REPLY));
    }

    #[test]
    fn reply_without_reply_serial_is_protocol_error() {
        // Craft a method-return frame missing the reply-serial field.
        let mut m = Message::new(MessageType::MethodReturn);
        m.fields.reply_serial = Some(1);
        m.seal(2).unwrap();
        let mut wire = m.wire().unwrap().to_vec();

        // Corrupt the field code so the parser does not see a reply-serial.
        // Field data begins at offset 16; the first byte is the code.
        wire[16] = 200;
        match Message::from_wire(wire, Vec::new()) {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn required_size_needs_sixteen_bytes() {
        assert_eq!(Message::required_size(&[b'l'; 8]).unwrap(), None);
    }

    #[test]
    fn bad_endian_marker_is_rejected() {
        let mut wire = vec![0u8; 16];
        wire[0] = b'x';
        assert!(Message::required_size(&wire).is_err());
    }
}
