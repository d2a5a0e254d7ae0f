//! Kernel bus transport. The node is opened read-write and treated as an
//! opaque framed reader/writer with the same message framing as the stream
//! transports; peer identity is out of band, so connections on this
//! transport skip authentication and the Hello round-trip entirely.

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::debug;

use super::{Endpoint, EndpointKind};
use crate::error::{Error, Result};

pub fn dial(path: &Path) -> Result<Endpoint> {
    if path.as_os_str().is_empty() {
        return Err(Error::invalid("kernel bus path is empty"));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)
        .map_err(Error::Transport)?;

    debug!("kernel bus node opened: {:?}", path);

    Ok(Endpoint {
        input: OwnedFd::from(file),
        output: None,
        kind: EndpointKind::Kernel,
        child: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_node_fails() {
        match dial(Path::new("/dev/nonexistent-bus-node")) {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_path_is_invalid() {
        assert!(matches!(
            dial(Path::new("")),
            Err(Error::InvalidArgument(_))
        ));
    }
}
