//! Resource usage collection for a container.
//!
//! Memory and CPU come from the container's cgroup when it has one and
//! from procfs otherwise. Disk usage is always measured by walking the
//! tree, and network usage comes from the `NetIn` forwarders.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use garden_common::types::{CpuStat, DiskStat, MemoryStat, Metrics, NetworkStat};
use garden_core::cgroup::CgroupManager;
use garden_core::usage::{self, DiskUsage};

/// Inputs needed to measure one container.
#[derive(Debug)]
pub struct MetricsSource<'a> {
    /// Cgroup, if one could be created.
    pub cgroup: Option<&'a CgroupManager>,
    /// Process groups of the container's live processes.
    pub process_groups: HashSet<u32>,
    /// Host path of the container tree.
    pub tree: &'a Path,
    /// Bind mount points inside the tree, which are not the container's own.
    pub excluded: &'a [PathBuf],
    /// Usage of the tree right after it was populated.
    pub baseline: DiskUsage,
    /// Usage of the mirrored rootfs.
    pub rootfs: DiskUsage,
    /// Forwarded traffic.
    pub network: NetworkStat,
}

/// Collects a metrics snapshot.
#[must_use]
pub fn collect(source: &MetricsSource<'_>) -> Metrics {
    let samples = usage::sample_groups(&source.process_groups);
    Metrics {
        memory_stat: memory(source.cgroup, &samples),
        cpu_stat: cpu(source.cgroup, &samples),
        disk_stat: disk(source.tree, source.excluded, source.baseline, source.rootfs),
        network_stat: source.network,
    }
}

fn memory(cgroup: Option<&CgroupManager>, samples: &[usage::ProcessSample]) -> MemoryStat {
    if let Some(stat) = cgroup.and_then(|cg| cg.memory_stat().ok()) {
        return stat;
    }
    let rss = samples.iter().map(|s| s.rss_bytes).sum();
    MemoryStat {
        usage: rss,
        rss,
        ..MemoryStat::default()
    }
}

fn cpu(cgroup: Option<&CgroupManager>, samples: &[usage::ProcessSample]) -> CpuStat {
    if let Some(stat) = cgroup.and_then(|cg| cg.cpu_stat().ok()) {
        return stat;
    }
    let user: u64 = samples.iter().map(|s| s.user_ns).sum();
    let system: u64 = samples.iter().map(|s| s.system_ns).sum();
    CpuStat {
        usage: user + system,
        user,
        system,
    }
}

/// Disk usage of a tree relative to its post-populate baseline.
#[must_use]
pub fn disk(tree: &Path, excluded: &[PathBuf], baseline: DiskUsage, rootfs: DiskUsage) -> DiskStat {
    let current = usage::disk_usage_excluding(tree, excluded);
    let exclusive_bytes = current.bytes.saturating_sub(baseline.bytes);
    let exclusive_inodes = current.inodes.saturating_sub(baseline.inodes);
    DiskStat {
        total_bytes_used: exclusive_bytes + rootfs.bytes,
        total_inodes_used: exclusive_inodes + rootfs.inodes,
        exclusive_bytes_used: exclusive_bytes,
        exclusive_inodes_used: exclusive_inodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_grow_exclusive_usage() {
        let tree = tempfile::tempdir().unwrap();
        let baseline = usage::disk_usage(tree.path());
        let rootfs = DiskUsage {
            bytes: 100,
            inodes: 3,
        };

        let before = disk(tree.path(), &[], baseline, rootfs);
        assert_eq!(before.exclusive_bytes_used, 0);
        assert_eq!(before.total_bytes_used, 100);

        std::fs::write(tree.path().join("junk"), vec![0u8; 4096]).unwrap();
        let after = disk(tree.path(), &[], baseline, rootfs);
        assert_eq!(after.exclusive_bytes_used, 4096);
        assert_eq!(after.exclusive_inodes_used, 1);
        assert_eq!(after.total_bytes_used, 4196);
    }

    #[test]
    fn own_process_group_has_cpu_and_memory() {
        let pgid = nix::unistd::getpgrp().as_raw().unsigned_abs();
        let tree = tempfile::tempdir().unwrap();
        let metrics = collect(&MetricsSource {
            cgroup: None,
            process_groups: HashSet::from([pgid]),
            tree: tree.path(),
            excluded: &[],
            baseline: DiskUsage::default(),
            rootfs: DiskUsage::default(),
            network: NetworkStat {
                rx_bytes: 1,
                tx_bytes: 2,
            },
        });
        assert!(metrics.memory_stat.rss > 0);
        assert_eq!(metrics.cpu_stat.usage, metrics.cpu_stat.user + metrics.cpu_stat.system);
        assert_eq!(metrics.network_stat.tx_bytes, 2);
    }
}
