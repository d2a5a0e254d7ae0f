//! # Bus Address Parsing
//!
//! D-Bus addresses are semicolon-separated lists of transport descriptors,
//! each of the form `transport:key1=value1,key2=value2`. This module turns
//! such a string into a sequence of [`Candidate`] connect descriptors.
//!
//! Parsing is cursor-based: [`AddressCursor::next_candidate`] consumes one
//! segment per call so the connect loop can fall through to the next
//! candidate when dialing fails. Segments with an unrecognized transport
//! prefix, empty segments, and segments that fail validation are skipped;
//! the connect loop decides what to do when the list is exhausted.
//!
//! Values may contain percent-escapes (`%HH`) that decode to raw bytes, and
//! [`escape`] produces the escaped form when composing addresses.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Socket path the system bus conventionally listens on inside a machine.
pub const CONTAINER_BUS_PATH: &str = "/var/run/dbus/system_bus_socket";

/// Address family constraint for TCP candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFamily {
    V4,
    V6,
}

/// One parsed connect descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// `unix:` — a filesystem or abstract-namespace socket.
    Unix {
        /// Socket path bytes. For abstract sockets this is the name
        /// *without* the leading NUL; the dialer prepends it.
        path: Vec<u8>,
        abstract_ns: bool,
    },
    /// `tcp:` — host and port, resolved with stream hints at dial time.
    Tcp {
        host: String,
        port: u16,
        family: Option<TcpFamily>,
    },
    /// `unixexec:` — spawn a program whose stdio is the transport.
    Exec { path: PathBuf, argv: Vec<OsString> },
    /// `kernel:` — a kernel bus node.
    Kernel { path: PathBuf },
    /// `x-container:` — the system bus of a named machine.
    Container { machine: String },
}

/// A candidate plus the optional server GUID the address pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub candidate: Candidate,
    pub guid: Option<Uuid>,
}

/// Stateful cursor over an address list.
///
/// The cursor index survives across calls, so a connection can re-enter the
/// parser after a failed dial and resume with the next segment.
#[derive(Debug, Clone)]
pub struct AddressCursor {
    text: String,
    index: usize,
}

impl AddressCursor {
    pub fn new(address: &str) -> Self {
        Self {
            text: address.to_owned(),
            index: 0,
        }
    }

    /// The full address string this cursor walks.
    pub fn address(&self) -> &str {
        &self.text
    }

    /// Parse the next usable candidate, advancing the cursor.
    ///
    /// Returns `Ok(None)` when the list is exhausted. Unknown transports,
    /// empty segments and segments that fail validation are skipped; the
    /// first validation error encountered on the way is carried in the
    /// result of a later exhaustion via [`AddressCursor::next_candidate`]
    /// returning `Ok(None)` (the connect loop keeps its own last-error).
    pub fn next_candidate(&mut self) -> Result<Option<ParsedAddress>> {
        loop {
            let rest = &self.text[self.index..];
            if rest.is_empty() {
                return Ok(None);
            }

            let (segment, consumed) = match rest.find(';') {
                Some(pos) => (&rest[..pos], pos + 1),
                None => (rest, rest.len()),
            };
            self.index += consumed;

            if segment.is_empty() {
                continue;
            }

            match parse_segment(segment) {
                Ok(Some(parsed)) => return Ok(Some(parsed)),
                // Unknown transport prefix: fall through to the next segment.
                Ok(None) => continue,
                // Recognized transport with invalid keys: skip it as well,
                // the caller never sees a half-parsed candidate.
                Err(e) => {
                    tracing::debug!("skipping unusable address segment {:?}: {}", segment, e);
                    continue;
                }
            }
        }
    }
}

/// Parse one `transport:k=v,...` segment.
///
/// `Ok(None)` means the transport prefix is not recognized.
fn parse_segment(segment: &str) -> Result<Option<ParsedAddress>> {
    let (prefix, rest) = match segment.find(':') {
        Some(pos) => (&segment[..pos], &segment[pos + 1..]),
        None => return Ok(None),
    };

    let pairs = parse_pairs(rest)?;
    let guid = match find_value(&pairs, "guid") {
        Some(v) => {
            let s = String::from_utf8(v.to_vec())
                .map_err(|_| Error::invalid("guid is not valid UTF-8"))?;
            Some(Uuid::try_parse(&s).map_err(|_| Error::invalid("guid is not a 128-bit id"))?)
        }
        None => None,
    };

    let candidate = match prefix {
        "unix" => parse_unix(&pairs)?,
        "tcp" => parse_tcp(&pairs)?,
        "unixexec" => parse_exec(&pairs)?,
        "kernel" => parse_kernel(&pairs)?,
        "x-container" => parse_container(&pairs)?,
        _ => return Ok(None),
    };

    Ok(Some(ParsedAddress { candidate, guid }))
}

/// Key/value list with `%HH` unescaping. Values are raw bytes.
fn parse_pairs(rest: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let mut pairs = Vec::new();

    for item in rest.split(',') {
        if item.is_empty() {
            continue;
        }
        let eq = item
            .find('=')
            .ok_or_else(|| Error::invalid(format!("address key without value: {:?}", item)))?;
        let key = item[..eq].to_owned();
        let value = unescape(&item[eq + 1..])?;
        if pairs.iter().any(|(k, _)| *k == key) {
            return Err(Error::invalid(format!("duplicate address key {:?}", key)));
        }
        pairs.push((key, value));
    }

    Ok(pairs)
}

fn find_value<'a>(pairs: &'a [(String, Vec<u8>)], key: &str) -> Option<&'a [u8]> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_slice())
}

fn utf8_value(pairs: &[(String, Vec<u8>)], key: &str) -> Result<Option<String>> {
    match find_value(pairs, key) {
        Some(v) => String::from_utf8(v.to_vec())
            .map(Some)
            .map_err(|_| Error::invalid(format!("address key {:?} is not valid UTF-8", key))),
        None => Ok(None),
    }
}

fn parse_unix(pairs: &[(String, Vec<u8>)]) -> Result<Candidate> {
    let path = find_value(pairs, "path");
    let abstract_name = find_value(pairs, "abstract");

    match (path, abstract_name) {
        (Some(p), None) => Ok(Candidate::Unix {
            path: p.to_vec(),
            abstract_ns: false,
        }),
        (None, Some(a)) => Ok(Candidate::Unix {
            path: a.to_vec(),
            abstract_ns: true,
        }),
        _ => Err(Error::invalid(
            "unix address needs exactly one of path= or abstract=",
        )),
    }
}

fn parse_tcp(pairs: &[(String, Vec<u8>)]) -> Result<Candidate> {
    let host =
        utf8_value(pairs, "host")?.ok_or_else(|| Error::invalid("tcp address without host"))?;
    let port = utf8_value(pairs, "port")?
        .ok_or_else(|| Error::invalid("tcp address without port"))?
        .parse::<u16>()
        .map_err(|_| Error::invalid("tcp port is not a 16-bit number"))?;

    let family = match utf8_value(pairs, "family")?.as_deref() {
        None => None,
        Some("ipv4") => Some(TcpFamily::V4),
        Some("ipv6") => Some(TcpFamily::V6),
        Some(other) => {
            return Err(Error::invalid(format!("unknown tcp family {:?}", other)));
        }
    };

    Ok(Candidate::Tcp { host, port, family })
}

fn parse_exec(pairs: &[(String, Vec<u8>)]) -> Result<Candidate> {
    let path = find_value(pairs, "path")
        .ok_or_else(|| Error::invalid("unixexec address without path"))?;
    let path = PathBuf::from(OsString::from_vec(path.to_vec()));

    // argvN keys must be contiguous from index 1; argv0 defaults to path.
    let mut argv: Vec<Option<OsString>> = Vec::new();
    for (key, value) in pairs {
        let Some(index) = key.strip_prefix("argv") else {
            continue;
        };
        let index: usize = index
            .parse()
            .map_err(|_| Error::invalid(format!("bad argv index in {:?}", key)))?;
        if index > 256 {
            return Err(Error::invalid("argv index out of range"));
        }
        if index >= argv.len() {
            argv.resize(index + 1, None);
        }
        argv[index] = Some(OsString::from_vec(value.clone()));
    }

    for slot in argv.iter().skip(1) {
        if slot.is_none() {
            return Err(Error::invalid("unixexec argv list has a hole"));
        }
    }

    if argv.is_empty() {
        argv.push(Some(path.clone().into_os_string()));
    } else if argv[0].is_none() {
        argv[0] = Some(path.clone().into_os_string());
    }

    Ok(Candidate::Exec {
        path,
        argv: argv.into_iter().map(|a| a.unwrap_or_default()).collect(),
    })
}

fn parse_kernel(pairs: &[(String, Vec<u8>)]) -> Result<Candidate> {
    let path =
        find_value(pairs, "path").ok_or_else(|| Error::invalid("kernel address without path"))?;
    Ok(Candidate::Kernel {
        path: PathBuf::from(OsString::from_vec(path.to_vec())),
    })
}

fn parse_container(pairs: &[(String, Vec<u8>)]) -> Result<Candidate> {
    let machine = utf8_value(pairs, "machine")?
        .ok_or_else(|| Error::invalid("x-container address without machine"))?;
    if machine.is_empty() {
        return Err(Error::invalid("x-container machine name is empty"));
    }
    Ok(Candidate::Container { machine })
}

fn unescape(value: &str) -> Result<Vec<u8>> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = hex_digit(*bytes.get(i + 1).ok_or_else(truncated)?)?;
            let lo = hex_digit(*bytes.get(i + 2).ok_or_else(truncated)?)?;
            out.push((hi << 4) | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    Ok(out)
}

fn truncated() -> Error {
    Error::invalid("truncated percent escape")
}

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::invalid("bad hex digit in percent escape")),
    }
}

/// Percent-escape a value for inclusion in an address string.
///
/// Alphanumerics plus `_-/.\` pass through, everything else becomes `%HH`.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'/' | b'.' | b'\\') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    out
}

/// Render a candidate back into a single address segment.
///
/// Escaping may differ from the input text, but re-parsing the result yields
/// an equal candidate.
pub fn encode(parsed: &ParsedAddress) -> String {
    let mut out = match &parsed.candidate {
        Candidate::Unix { path, abstract_ns } => {
            let key = if *abstract_ns { "abstract" } else { "path" };
            format!(
                "unix:{}={}",
                key,
                escape(&String::from_utf8_lossy(path))
            )
        }
        Candidate::Tcp { host, port, family } => {
            let mut s = format!("tcp:host={},port={}", escape(host), port);
            match family {
                Some(TcpFamily::V4) => s.push_str(",family=ipv4"),
                Some(TcpFamily::V6) => s.push_str(",family=ipv6"),
                None => {}
            }
            s
        }
        Candidate::Exec { path, argv } => {
            let mut s = format!("unixexec:path={}", escape(&path.to_string_lossy()));
            for (i, arg) in argv.iter().enumerate() {
                s.push_str(&format!(",argv{}={}", i, escape(&arg.to_string_lossy())));
            }
            s
        }
        Candidate::Kernel { path } => {
            format!("kernel:path={}", escape(&path.to_string_lossy()))
        }
        Candidate::Container { machine } => {
            format!("x-container:machine={}", escape(machine))
        }
    };

    if let Some(guid) = parsed.guid {
        out.push_str(&format!(",guid={}", guid.simple()));
    }

    out
}
