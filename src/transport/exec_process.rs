//! Exec transport: spawn a bridge program and speak the bus protocol over
//! its stdin/stdout. The classic use is `ssh host systemd-stdio-bridge` for
//! remote system buses. Input and output are separate pipe ends, so this
//! transport never supports fd passing.

use std::ffi::OsString;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

use super::{Endpoint, EndpointKind};
use crate::error::{Error, Result};
use crate::socket_io::prepare_fd;

pub fn dial(path: &Path, argv: &[OsString]) -> Result<Endpoint> {
    if argv.is_empty() {
        return Err(Error::invalid("exec transport needs at least argv0"));
    }

    // Parent writes into the child's stdin, reads from its stdout.
    let (child_stdin_r, child_stdin_w) = os_pipe::pipe().map_err(Error::Transport)?;
    let (child_stdout_r, child_stdout_w) = os_pipe::pipe().map_err(Error::Transport)?;

    let mut cmd = Command::new(path);
    cmd.arg0(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(unsafe { Stdio::from_raw_fd(child_stdin_r.into_raw_fd()) });
    cmd.stdout(unsafe { Stdio::from_raw_fd(child_stdout_w.into_raw_fd()) });
    cmd.stderr(Stdio::null());

    let child = cmd.spawn().map_err(Error::Transport)?;
    debug!("exec transport spawned {:?} (pid {})", path, child.id());

    let input = unsafe { OwnedFd::from_raw_fd(child_stdout_r.into_raw_fd()) };
    let output = unsafe { OwnedFd::from_raw_fd(child_stdin_w.into_raw_fd()) };
    prepare_fd(input.as_raw_fd())?;
    prepare_fd(output.as_raw_fd())?;

    Ok(Endpoint {
        input,
        output: Some(output),
        kind: EndpointKind::StreamPipe,
        child: Some(child),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket_io::StreamIo;

    #[test]
    fn child_stdout_reaches_input_fd() {
        // A child that echoes a known auth-style line.
        let endpoint = dial(
            Path::new("/bin/sh"),
            &[
                OsString::from("sh"),
                OsString::from("-c"),
                OsString::from("printf 'OK 0123456789abcdef0123456789abcdef\\r\\n'"),
            ],
        )
        .unwrap();

        assert_eq!(endpoint.kind, EndpointKind::StreamPipe);
        assert!(endpoint.output.is_some());
        assert_ne!(endpoint.input_fd(), endpoint.output_fd());

        let mut io = StreamIo::new(false);
        let start = std::time::Instant::now();
        let line = loop {
            if let Some(line) = io.read_line(endpoint.input_fd()).unwrap() {
                break line;
            }
            if start.elapsed() > std::time::Duration::from_secs(5) {
                panic!("child produced no output");
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };
        assert!(line.starts_with("OK "));

        if let Some(mut child) = endpoint.child {
            let _ = child.wait();
        }
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let result = dial(
            Path::new("/nonexistent/bridge"),
            &[OsString::from("bridge")],
        );
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
