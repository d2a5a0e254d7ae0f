//! Container transport: connect to the system bus of a named machine.
//!
//! The machine registry records every running machine under
//! `/run/systemd/machines/<name>` including its leader pid. The leader's
//! root directory is reachable through `/proc/<pid>/root`, which makes the
//! machine's bus socket addressable from outside without switching
//! namespaces.

use std::path::Path;

use tracing::debug;

use super::{unix_socket, DialOutcome};
use crate::address::CONTAINER_BUS_PATH;
use crate::error::{Error, Result};

const MACHINE_REGISTRY: &str = "/run/systemd/machines";

pub fn dial(machine: &str) -> Result<DialOutcome> {
    let leader = machine_leader(machine)?;
    let socket_path = format!("/proc/{}/root{}", leader, CONTAINER_BUS_PATH);
    debug!("container {:?} leader {} bus {}", machine, leader, socket_path);
    unix_socket::dial(socket_path.as_bytes(), false)
}

/// Look up the leader pid of a registered machine.
fn machine_leader(machine: &str) -> Result<u32> {
    if machine.is_empty() || machine.contains('/') {
        return Err(Error::invalid("machine name is empty or contains '/'"));
    }

    let record_path = Path::new(MACHINE_REGISTRY).join(machine);
    let record = std::fs::read_to_string(&record_path).map_err(Error::Transport)?;

    for line in record.lines() {
        if let Some(value) = line.strip_prefix("LEADER=") {
            return value
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::protocol(format!("bad LEADER field for {:?}", machine)));
        }
    }

    Err(Error::protocol(format!(
        "machine record for {:?} has no leader",
        machine
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_in_machine_name_is_rejected() {
        assert!(matches!(
            dial("../etc"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn unregistered_machine_fails() {
        match dial("no-such-machine-for-sure") {
            Err(Error::Transport(_)) => {}
            other => panic!("expected transport error, got {:?}", other.map(|_| ())),
        }
    }
}
