//! Cgroups v2 resource management.
//!
//! Each container gets a cgroup at `<cgroup_root>/<handle>`. Limits are
//! written to the unified hierarchy's control files and usage is read back
//! from its stat files.

pub mod cpu;
pub mod memory;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use garden_common::error::{GardenError, Result};
use garden_common::types::{CpuLimits, CpuStat, MemoryLimits, MemoryStat};

/// Handle to a cgroup for a specific container.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    /// Path to this container's cgroup directory.
    path: PathBuf,
}

impl CgroupManager {
    /// Creates a cgroup named `handle` under `root`.
    ///
    /// Enables the `cpu` and `memory` controllers on `root` first so the new
    /// cgroup exposes their control files. Failing to enable them is not an
    /// error: the controllers may already be delegated.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be created.
    pub fn create(root: &Path, handle: &str) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| GardenError::io(root, e))?;
        let subtree = root.join("cgroup.subtree_control");
        if let Err(e) = std::fs::write(&subtree, "+cpu +memory") {
            tracing::debug!(path = %subtree.display(), error = %e, "controllers not enabled");
        }

        let path = root.join(handle);
        std::fs::create_dir_all(&path).map_err(|e| GardenError::io(&path, e))?;
        tracing::info!(path = %path.display(), "cgroup created");
        Ok(Self { path })
    }

    /// Reopens the cgroup of a restored container, if it still exists.
    #[must_use]
    pub fn open(root: &Path, handle: &str) -> Option<Self> {
        let path = root.join(handle);
        path.is_dir().then_some(Self { path })
    }

    /// Path of the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies memory and CPU limits to this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to cgroup control files fails.
    pub fn apply_limits(&self, memory: &MemoryLimits, cpu: &CpuLimits) -> Result<()> {
        memory::set_memory_max(&self.path, memory.limit_in_bytes)?;
        if cpu.limit_in_shares > 0 {
            cpu::set_cpu_weight(&self.path, cpu::shares_to_weight(cpu.limit_in_shares))?;
        }
        Ok(())
    }

    /// Adds a process to this cgroup by writing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        let procs_path = self.path.join("cgroup.procs");
        std::fs::write(&procs_path, pid.to_string()).map_err(|e| GardenError::io(procs_path, e))?;
        tracing::debug!(pid, "added process to cgroup");
        Ok(())
    }

    /// Reads memory usage.
    ///
    /// # Errors
    ///
    /// Returns an error if `memory.current` or `memory.stat` cannot be read.
    pub fn memory_stat(&self) -> Result<MemoryStat> {
        memory::read_memory_stat(&self.path)
    }

    /// Reads CPU usage.
    ///
    /// # Errors
    ///
    /// Returns an error if `cpu.stat` cannot be read.
    pub fn cpu_stat(&self) -> Result<CpuStat> {
        cpu::read_cpu_stat(&self.path)
    }

    /// Whether the kernel recorded an OOM kill in this cgroup.
    #[must_use]
    pub fn oom_killed(&self) -> bool {
        read_keyed(&self.path.join("memory.events"))
            .ok()
            .and_then(|events| events.get("oom_kill").copied())
            .is_some_and(|count| count > 0)
    }

    /// Removes the cgroup.
    ///
    /// The kernel refuses to remove a cgroup that still holds processes, so
    /// callers kill every member first.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_dir(&self.path).map_err(|e| GardenError::io(&self.path, e))?;
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }
}

/// Parses a flat-keyed cgroup file (`key value` per line).
pub(crate) fn read_keyed(path: &Path) -> Result<HashMap<String, u64>> {
    let content = std::fs::read_to_string(path).map_err(|e| GardenError::io(path, e))?;
    Ok(parse_keyed(&content))
}

fn parse_keyed(content: &str) -> HashMap<String, u64> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(' ')?;
            Some((key.to_owned(), value.trim().parse().ok()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keyed_skips_malformed_lines() {
        let parsed = parse_keyed("anon 4096\nfile 8192\nbroken\nweird x\n");
        assert_eq!(parsed.get("anon"), Some(&4096));
        assert_eq!(parsed.get("file"), Some(&8192));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn create_and_destroy_in_plain_directory() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = CgroupManager::create(root.path(), "abc").unwrap();
        assert!(cgroup.path().is_dir());
        assert!(CgroupManager::open(root.path(), "abc").is_some());

        cgroup.destroy().unwrap();
        assert!(CgroupManager::open(root.path(), "abc").is_none());
    }

    #[test]
    fn apply_limits_writes_control_files() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = CgroupManager::create(root.path(), "limits").unwrap();

        cgroup
            .apply_limits(
                &MemoryLimits {
                    limit_in_bytes: 10 * 1024 * 1024,
                },
                &CpuLimits { limit_in_shares: 1024 },
            )
            .unwrap();

        let max = std::fs::read_to_string(cgroup.path().join("memory.max")).unwrap();
        assert_eq!(max, "10485760");
        let weight = std::fs::read_to_string(cgroup.path().join("cpu.weight")).unwrap();
        assert_eq!(weight, "39");
    }

    #[test]
    fn oom_killed_reads_memory_events() {
        let root = tempfile::tempdir().unwrap();
        let cgroup = CgroupManager::create(root.path(), "oom").unwrap();
        assert!(!cgroup.oom_killed());

        std::fs::write(cgroup.path().join("memory.events"), "oom 1\noom_kill 1\n").unwrap();
        assert!(cgroup.oom_killed());
    }
}
