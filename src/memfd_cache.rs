//! # Kernel-Transport Buffer Pool
//!
//! The kernel transport hands large message bodies to the bus through
//! anonymous memory files. Creating one per message is wasteful, so the
//! connection keeps a small pool of reusable buffers. Messages may outlive
//! the connection's dispatch thread in user code, and their drop handler
//! returns buffers here, so the pool is the one piece of connection state
//! behind a mutex.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use memfd::{Memfd, MemfdOptions};

use crate::error::{Error, Result};

/// Buffers kept around after use.
const POOL_MAX: usize = 8;

/// Below this size messages go inline over the transport; at or above it the
/// kernel transport prefers a pooled buffer.
pub const MEMFD_THRESHOLD: usize = 512 * 1024;

struct PooledBuffer {
    memfd: Memfd,
    size: usize,
}

/// Shared pool handle. Cloning is cheap; the last drop releases the buffers.
#[derive(Clone)]
pub struct MemfdCache {
    pool: Arc<Mutex<Vec<PooledBuffer>>>,
}

impl MemfdCache {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Get a buffer of at least `size` bytes, reusing a pooled one if any
    /// is large enough.
    pub fn acquire(&self, size: usize) -> Result<LeasedBuffer> {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = pool.iter().position(|b| b.size >= size) {
            let buffer = pool.remove(pos);
            return Ok(LeasedBuffer {
                memfd: Some(buffer.memfd),
                size: buffer.size,
                cache: self.clone(),
            });
        }
        drop(pool);

        let memfd = MemfdOptions::default()
            .allow_sealing(true)
            .create("buslane-msg")
            .map_err(|e| {
                Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        memfd
            .as_file()
            .set_len(size as u64)
            .map_err(Error::Transport)?;

        Ok(LeasedBuffer {
            memfd: Some(memfd),
            size,
            cache: self.clone(),
        })
    }

    fn give_back(&self, memfd: Memfd, size: usize) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        if pool.len() < POOL_MAX {
            pool.push(PooledBuffer { memfd, size });
        }
        // Over the cap the buffer just drops and closes.
    }

    /// Drop every pooled buffer. Run at connection teardown.
    pub fn flush(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
        pool.clear();
    }

    pub fn pooled(&self) -> usize {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for MemfdCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer checked out of the pool. Returns itself on drop.
pub struct LeasedBuffer {
    memfd: Option<Memfd>,
    size: usize,
    cache: MemfdCache,
}

impl LeasedBuffer {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn file(&self) -> &std::fs::File {
        // The option is only empty mid-drop.
        self.memfd.as_ref().map(|m| m.as_file()).expect("buffer already returned")
    }
}

impl AsRawFd for LeasedBuffer {
    fn as_raw_fd(&self) -> RawFd {
        self.file().as_raw_fd()
    }
}

impl Drop for LeasedBuffer {
    fn drop(&mut self) {
        if let Some(memfd) = self.memfd.take() {
            self.cache.give_back(memfd, self.size);
        }
    }
}
