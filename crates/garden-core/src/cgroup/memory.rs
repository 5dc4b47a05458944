//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max` and reads `memory.current` and `memory.stat`.

use std::path::Path;

use garden_common::error::{GardenError, Result};
use garden_common::types::MemoryStat;

/// Sets the hard memory limit for a cgroup; `0` removes the limit.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(cgroup_path: &Path, bytes: u64) -> Result<()> {
    let file = cgroup_path.join("memory.max");
    let value = if bytes == 0 {
        "max".to_owned()
    } else {
        bytes.to_string()
    };
    std::fs::write(&file, &value).map_err(|e| GardenError::io(file, e))?;
    tracing::debug!(limit = %value, "memory max set");
    Ok(())
}

/// Reads memory usage from `memory.current`, `memory.stat` and
/// `memory.swap.current`.
///
/// # Errors
///
/// Returns an error if `memory.current` cannot be read or parsed.
pub fn read_memory_stat(cgroup_path: &Path) -> Result<MemoryStat> {
    let current_path = cgroup_path.join("memory.current");
    let usage = read_single(&current_path)?;
    let stat = super::read_keyed(&cgroup_path.join("memory.stat")).unwrap_or_default();
    let swap = read_single(&cgroup_path.join("memory.swap.current")).unwrap_or(0);
    let get = |key: &str| stat.get(key).copied().unwrap_or(0);
    Ok(MemoryStat {
        usage,
        rss: get("anon"),
        cache: get("file"),
        mapped_file: get("file_mapped"),
        swap,
    })
}

fn read_single(path: &Path) -> Result<u64> {
    let content = std::fs::read_to_string(path).map_err(|e| GardenError::io(path, e))?;
    content.trim().parse().map_err(|_| GardenError::Config {
        message: format!("unexpected content in {}", path.display()),
    })
}
