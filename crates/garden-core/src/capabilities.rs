//! Capability dropping for container processes.
//!
//! The set of capabilities is gathered in the parent; [`CapabilityDrop::apply`]
//! runs in the forked child before it switches user and execs, while it still
//! holds `CAP_SETPCAP`.

use std::io;

use caps::{CapSet, Capability};

/// Capabilities a process gives up before it execs.
#[derive(Debug, Clone)]
pub struct CapabilityDrop {
    caps: Vec<Capability>,
}

impl CapabilityDrop {
    /// Drops every capability known to the `caps` crate.
    #[must_use]
    pub fn all() -> Self {
        let mut caps: Vec<Capability> = caps::all().into_iter().collect();
        caps.sort_by_key(|cap| cap.index());
        Self { caps }
    }

    /// Capabilities removed from the bounding set.
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.caps
    }

    /// Empties the bounding, inheritable, and ambient sets of the calling
    /// thread.
    ///
    /// Does not allocate, so it may run between `fork` and `exec`.
    /// Capabilities the kernel does not know are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::PermissionDenied`] if a capability stays in
    /// the bounding set or the inheritable set cannot be cleared.
    pub fn apply(&self) -> io::Result<()> {
        for cap in &self.caps {
            if caps::has_cap(None, CapSet::Bounding, *cap).unwrap_or(false) {
                caps::drop(None, CapSet::Bounding, *cap).map_err(|_| denied())?;
            }
        }
        caps::clear(None, CapSet::Inheritable).map_err(|_| denied())?;
        // Kernels before 4.3 have no ambient set.
        let _ = caps::clear(None, CapSet::Ambient);
        Ok(())
    }
}

fn denied() -> io::Error {
    io::Error::from(io::ErrorKind::PermissionDenied)
}
