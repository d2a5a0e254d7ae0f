//! # Event-Loop Bridge
//!
//! Glue between a [`Connection`] and the tokio reactor. The engine itself
//! never blocks and never owns a loop; it answers three questions — which
//! fds to watch ([`Connection::fds`]), with what interest
//! ([`Connection::desired_events`]), and until when
//! ([`Connection::next_deadline`]) — and exposes one entry point,
//! [`Connection::process`]. The bridge re-asks those questions before every
//! suspension, mirroring a reactor's prepare hook, and fires `process()`
//! on I/O readiness or deadline expiry.
//!
//! [`drive_until`] additionally takes a shutdown future; when it completes
//! the bridge flushes pending writes best-effort and returns, the way a
//! reactor's exit hook would.

use std::future::Future;
use std::time::Instant;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;

use crate::connection::{Connection, State};
use crate::error::{Error, Result};

/// Drive `conn` until it closes or a fatal error surfaces.
pub async fn drive(conn: &mut Connection) -> Result<()> {
    drive_until(conn, std::future::pending::<()>()).await
}

/// Drive `conn` until it closes, errors, or `shutdown` completes. On
/// shutdown, queued outbound messages are flushed best-effort.
pub async fn drive_until<S>(conn: &mut Connection, shutdown: S) -> Result<()>
where
    S: Future,
{
    conn.set_attached(true)?;
    let result = drive_loop(conn, shutdown).await;
    conn.set_attached(false).ok();
    result
}

async fn drive_loop<S>(conn: &mut Connection, shutdown: S) -> Result<()>
where
    S: Future,
{
    tokio::pin!(shutdown);

    loop {
        // Dispatch until the engine would block.
        loop {
            match conn.process() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(Error::NotConnected) if conn.state() == State::Closed => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        if conn.state() == State::Closed {
            return Ok(());
        }

        // Prepare: refresh interest and deadline for this suspension.
        let events = conn.desired_events()?;
        let deadline = conn.next_deadline()?;
        let (input_fd, output_fd) = conn.fds()?;
        debug_assert!(events.readable || events.writable || deadline.is_some());

        if input_fd == output_fd {
            let mut interest = Interest::READABLE;
            // A concrete interest is required even for timer-only rounds;
            // spurious readiness just re-runs process(), which reports
            // "would block" and comes straight back here.
            if events.writable {
                interest = interest.add(Interest::WRITABLE);
            }
            let afd = AsyncFd::with_interest(input_fd, interest).map_err(Error::Transport)?;
            tokio::select! {
                guard = afd.ready(interest) => {
                    guard.map_err(Error::Transport)?.retain_ready();
                }
                () = sleep_until_instant(deadline), if deadline.is_some() => {}
                _ = &mut shutdown => {
                    debug!("bridge shutting down, flushing");
                    let _ = conn.flush();
                    return Ok(());
                }
            }
        } else {
            let afd_in = AsyncFd::with_interest(input_fd, Interest::READABLE)
                .map_err(Error::Transport)?;
            let afd_out = AsyncFd::with_interest(output_fd, Interest::WRITABLE)
                .map_err(Error::Transport)?;
            tokio::select! {
                guard = afd_in.readable(), if events.readable => {
                    guard.map_err(Error::Transport)?.retain_ready();
                }
                guard = afd_out.writable(), if events.writable => {
                    guard.map_err(Error::Transport)?.retain_ready();
                }
                () = sleep_until_instant(deadline), if deadline.is_some() => {}
                _ = &mut shutdown => {
                    debug!("bridge shutting down, flushing");
                    let _ = conn.flush();
                    return Ok(());
                }
            }
        }
    }
}

async fn sleep_until_instant(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}
