//! Host port pool for `NetIn` mappings.
//!
//! Ports are handed out from the front and returned to the back, so a
//! released port is reused only after every never-used port.

use std::collections::VecDeque;

use garden_common::error::{GardenError, Result};
use parking_lot::Mutex;

/// FIFO pool of host ports.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u32,
    free: Mutex<VecDeque<u16>>,
}

impl PortPool {
    /// Creates a pool of `size` ports starting at `start`.
    #[must_use]
    pub fn new(start: u16, size: u16) -> Self {
        let end = (u32::from(start) + u32::from(size)).min(u32::from(u16::MAX) + 1);
        let free = (u32::from(start)..end)
            .filter_map(|p| u16::try_from(p).ok())
            .collect();
        Self {
            start,
            end,
            free: Mutex::new(free),
        }
    }

    /// Takes the next free port.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::PoolExhausted`] when no port is free.
    pub fn acquire(&self) -> Result<u16> {
        self.free.lock().pop_front().ok_or_else(|| GardenError::PoolExhausted {
            resource: "port".into(),
        })
    }

    /// Reserves a specific port if the pool manages it.
    ///
    /// Returns `false` when the port lies outside the pool. Ports outside the
    /// pool are never tracked.
    ///
    /// # Errors
    ///
    /// Returns [`GardenError::PoolExhausted`] when a pooled port is already taken.
    pub fn reserve(&self, port: u16) -> Result<bool> {
        if !self.manages(port) {
            return Ok(false);
        }
        let mut free = self.free.lock();
        let Some(index) = free.iter().position(|p| *p == port) else {
            return Err(GardenError::PoolExhausted {
                resource: format!("port {port}"),
            });
        };
        let _ = free.remove(index);
        Ok(true)
    }

    /// Returns a port to the back of the pool.
    pub fn release(&self, port: u16) {
        if !self.manages(port) {
            return;
        }
        let mut free = self.free.lock();
        if !free.contains(&port) {
            free.push_back(port);
        }
    }

    /// Number of free ports.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    fn manages(&self, port: u16) -> bool {
        port >= self.start && u32::from(port) < self.end
    }
}
