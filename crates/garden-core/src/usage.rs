//! Resource accounting from the filesystem and procfs.
//!
//! Used for metrics when a container has no cgroup, for disk usage (which
//! cgroups do not track), and for server capacity.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use garden_common::error::{GardenError, Result};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// Space used by a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    /// Sum of regular file sizes, hard links counted once.
    pub bytes: u64,
    /// Number of distinct inodes.
    pub inodes: u64,
}

/// Walks `root` without following symlinks and sums what it finds.
///
/// Entries that vanish or cannot be read during the walk are skipped.
#[must_use]
pub fn disk_usage(root: &Path) -> DiskUsage {
    disk_usage_excluding(root, &[])
}

/// Like [`disk_usage`], but skips the subtrees rooted at `excluded`.
#[must_use]
pub fn disk_usage_excluding(root: &Path, excluded: &[PathBuf]) -> DiskUsage {
    let mut seen = HashSet::new();
    let mut usage = DiskUsage::default();
    let walk = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !excluded.iter().any(|x| x == e.path()));
    for entry in walk.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !seen.insert((meta.dev(), meta.ino())) {
            continue;
        }
        usage.inodes += 1;
        if meta.is_file() {
            usage.bytes += meta.len();
        }
    }
    usage
}

/// CPU and memory of one process, read from `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSample {
    /// Process group the process belongs to.
    pub pgid: u32,
    /// User CPU time in nanoseconds, including reaped children.
    pub user_ns: u64,
    /// System CPU time in nanoseconds, including reaped children.
    pub system_ns: u64,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
}

/// Samples a live process. Returns `None` once it has gone.
#[must_use]
pub fn sample_process(pid: u32) -> Option<ProcessSample> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(&stat, clock_ticks(), page_size())
}

/// Every live process whose process group is one of `pgids`.
#[must_use]
pub fn sample_groups(pgids: &HashSet<u32>) -> Vec<ProcessSample> {
    if pgids.is_empty() {
        return Vec::new();
    }
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(sample_process)
        .filter(|s| pgids.contains(&s.pgid))
        .collect()
}

fn parse_stat(stat: &str, ticks_per_sec: u64, page_size: u64) -> Option<ProcessSample> {
    // The command name may contain spaces and parentheses; fields resume
    // after the last `)`.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |i: usize| fields.get(i).and_then(|f| f.parse::<u64>().ok());

    let pgid = u32::try_from(field(2)?).ok()?;
    let ticks_to_ns = |t: u64| t.saturating_mul(1_000_000_000) / ticks_per_sec.max(1);
    let user = field(11)? + field(13).unwrap_or(0);
    let system = field(12)? + field(14).unwrap_or(0);
    Some(ProcessSample {
        pgid,
        user_ns: ticks_to_ns(user),
        system_ns: ticks_to_ns(system),
        rss_bytes: field(21).unwrap_or(0).saturating_mul(page_size),
    })
}

fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    u64::try_from(ticks).unwrap_or(100)
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).unwrap_or(4096)
}

/// Physical memory of the host, from `/proc/meminfo`.
///
/// # Errors
///
/// Returns an error if `/proc/meminfo` cannot be read or lacks `MemTotal`.
pub fn host_memory_bytes() -> Result<u64> {
    let path = Path::new("/proc/meminfo");
    let content = std::fs::read_to_string(path).map_err(|e| GardenError::io(path, e))?;
    content
        .lines()
        .find_map(|line| {
            let kib = line.strip_prefix("MemTotal:")?.trim().strip_suffix("kB")?;
            kib.trim().parse::<u64>().ok()
        })
        .map(|kib| kib * 1024)
        .ok_or_else(|| GardenError::Config {
            message: "MemTotal missing from /proc/meminfo".into(),
        })
}

/// Total size of the filesystem holding `path`.
///
/// # Errors
///
/// Returns an error if `statvfs(3)` fails.
pub fn filesystem_bytes(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| GardenError::io(path, e.into()))?;
    Ok(u64::from(stat.blocks()).saturating_mul(stat.fragment_size()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_usage_counts_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/junk"), vec![0u8; 1024]).unwrap();
        std::fs::write(dir.path().join("a"), b"abc").unwrap();
        std::fs::hard_link(dir.path().join("a"), dir.path().join("b")).unwrap();

        let usage = disk_usage(dir.path());
        assert_eq!(usage.bytes, 1027);
        // root, etc, etc/junk, a (b shares a's inode)
        assert_eq!(usage.inodes, 4);
    }

    #[test]
    fn excluded_subtrees_are_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mount = dir.path().join("mnt");
        std::fs::create_dir(&mount).unwrap();
        std::fs::write(mount.join("big"), vec![0u8; 512]).unwrap();
        std::fs::write(dir.path().join("small"), b"ab").unwrap();

        let usage = disk_usage_excluding(dir.path(), &[mount]);
        assert_eq!(usage.bytes, 2);
        assert_eq!(usage.inodes, 2);
    }

    #[test]
    fn disk_usage_of_missing_dir_is_zero() {
        assert_eq!(disk_usage(Path::new("/no/such/tree")), DiskUsage::default());
    }

    #[test]
    fn parse_stat_handles_spaces_in_comm() {
        let stat = "42 (my (weird) cmd) S 1 42 42 0 -1 4194560 100 0 0 0 \
                    200 100 50 25 20 0 1 0 12345 1000000 256 18446744073709551615";
        let sample = parse_stat(stat, 100, 4096).unwrap();
        assert_eq!(sample.pgid, 42);
        assert_eq!(sample.user_ns, 2_500_000_000);
        assert_eq!(sample.system_ns, 1_250_000_000);
        assert_eq!(sample.rss_bytes, 256 * 4096);
    }

    #[test]
    fn samples_current_process() {
        let sample = sample_process(std::process::id()).unwrap();
        assert!(sample.rss_bytes > 0);
    }

    #[test]
    fn host_has_memory_and_disk() {
        assert!(host_memory_bytes().unwrap() > 0);
        assert!(filesystem_bytes(Path::new("/")).unwrap() > 0);
    }
}
