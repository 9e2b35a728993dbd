//! Host port reservation for new instances

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::error::{OrchestratorError, Result};

/// Hands out host ports from a range, never the same port to two live reservations
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

/// Claim on a port; released when dropped
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

impl PortAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve the first bindable port in `[start, end]`
    pub fn reserve(self: &Arc<Self>, start: u16, end: u16) -> Result<PortReservation> {
        self.reserve_excluding(start, end, &HashSet::new())
    }

    /// Like [`reserve`](Self::reserve), also skipping ports already held by known instances
    pub fn reserve_excluding(
        self: &Arc<Self>,
        start: u16,
        end: u16,
        in_use: &HashSet<u16>,
    ) -> Result<PortReservation> {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for port in start..=end {
            if reserved.contains(&port) || in_use.contains(&port) {
                continue;
            }
            if !is_bindable(port) {
                trace!("Port {} is in use on the host", port);
                continue;
            }
            reserved.insert(port);
            debug!("Reserved port {}", port);
            return Ok(PortReservation {
                port,
                allocator: Arc::clone(self),
            });
        }

        Err(OrchestratorError::ResourceExhausted { start, end })
    }

    /// Number of ports currently reserved
    pub fn reserved_count(&self) -> usize {
        self.reserved
            .lock()
            .map(|set| set.len())
            .unwrap_or_default()
    }

    fn release(&self, port: u16) {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if reserved.remove(&port) {
            debug!("Released port {}", port);
        }
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

#[cfg(test)]
pub(crate) fn free_port_range(len: u16) -> (u16, u16) {
    // Probe for `len` consecutive bindable ports in the ephemeral range
    let mut start = 40_000u16;
    while start < 60_000 {
        let end = start + len - 1;
        if (start..=end).all(is_bindable) {
            return (start, end);
        }
        start += len;
    }
    panic!("no free port range of length {len}");
}
