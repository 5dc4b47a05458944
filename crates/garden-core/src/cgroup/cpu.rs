//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight` and reads `cpu.stat`.

use std::path::Path;

use garden_common::error::{GardenError, Result};
use garden_common::types::CpuStat;

/// Smallest cgroup v1 share value.
const MIN_SHARES: u64 = 2;
/// Largest cgroup v1 share value.
const MAX_SHARES: u64 = 262_144;
/// Largest cgroup v2 weight.
const MAX_WEIGHT: u64 = 10_000;

/// Converts cgroup v1 CPU shares to a cgroup v2 weight.
///
/// Maps `[2, 262144]` linearly onto `[1, 10000]`, clamping out-of-range input.
#[must_use]
pub fn shares_to_weight(shares: u64) -> u64 {
    let shares = shares.clamp(MIN_SHARES, MAX_SHARES);
    1 + ((shares - MIN_SHARES) * (MAX_WEIGHT - 1)) / (MAX_SHARES - MIN_SHARES)
}

/// Sets the CPU weight for a cgroup.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time this cgroup receives under contention.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: u64) -> Result<()> {
    let file = cgroup_path.join("cpu.weight");
    std::fs::write(&file, weight.to_string()).map_err(|e| GardenError::io(file, e))?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}

/// Reads cumulative CPU time from `cpu.stat`, in nanoseconds.
///
/// # Errors
///
/// Returns an error if `cpu.stat` cannot be read.
pub fn read_cpu_stat(cgroup_path: &Path) -> Result<CpuStat> {
    let stat = super::read_keyed(&cgroup_path.join("cpu.stat"))?;
    let usec = |key: &str| stat.get(key).copied().unwrap_or(0).saturating_mul(1000);
    Ok(CpuStat {
        usage: usec("usage_usec"),
        user: usec("user_usec"),
        system: usec("system_usec"),
    })
}
