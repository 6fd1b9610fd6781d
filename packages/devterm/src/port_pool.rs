//! Ephemeral port bookkeeping for terminal backends.
//!
//! Ports come from the OS (bind to port 0, read the number, close the
//! listener). The pool only remembers which of those numbers are handed out so
//! two live terminals never get the same one. There is a window between closing
//! the probe listener and the backend binding the port in which another process
//! could take it; the backend bind then fails and the spawn is rolled back.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Probes before giving up when the OS keeps handing back tracked ports.
const MAX_PROBES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum PortPoolError {
    #[error("failed to bind ephemeral port: {0}")]
    Bind(#[from] std::io::Error),

    #[error("no untracked ephemeral port after {0} probes")]
    Exhausted(usize),
}

#[derive(Debug)]
pub struct PortPool {
    host: IpAddr,
    in_use: Mutex<HashSet<u16>>,
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PortPool {
    pub fn new() -> Self {
        Self::with_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    pub fn with_host(host: IpAddr) -> Self {
        Self {
            host,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    fn ports(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a port that is not tracked as in use and tracks it.
    pub fn allocate(&self) -> Result<u16, PortPoolError> {
        for _ in 0..MAX_PROBES {
            let port = {
                let listener = TcpListener::bind((self.host, 0))?;
                listener.local_addr()?.port()
            };

            if self.ports().insert(port) {
                debug!("Allocated port {}", port);
                return Ok(port);
            }
            debug!("OS returned tracked port {}, probing again", port);
        }
        Err(PortPoolError::Exhausted(MAX_PROBES))
    }

    /// Idempotent; unknown ports are ignored.
    pub fn release(&self, port: u16) {
        if self.ports().remove(&port) {
            debug!("Released port {}", port);
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.ports().contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.ports().len()
    }
}
