//! Persistent container snapshots.
//!
//! Every container keeps a JSON snapshot next to its working tree in the
//! depot. Snapshots are rewritten atomically after each state change and
//! read back when the server restarts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use garden_common::constants::SNAPSHOT_FILE;
use garden_common::error::{GardenError, Result};
use garden_common::types::{
    ContainerSpec, ContainerState, Handle, Limits, NetOutRule, PortMapping, Properties,
};
use garden_core::filesystem::bind::BindKind;
use garden_core::network::subnet::NetworkAllocation;
use garden_core::usage::DiskUsage;
use serde::{Deserialize, Serialize};

/// A bind mount as materialized in the container tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRecord {
    /// Host path of the mount point.
    pub target: PathBuf,
    /// How the bind was made.
    pub kind: BindKind,
}

/// Persistent record of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Container handle.
    pub handle: Handle,
    /// Spec the container was created with.
    pub spec: ContainerSpec,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Address assignment.
    pub network: NetworkAllocation,
    /// Current properties.
    pub properties: Properties,
    /// Current limits.
    pub limits: Limits,
    /// Egress rules in the order they were added.
    pub net_out: Vec<NetOutRule>,
    /// Active `NetIn` mappings.
    pub mapped_ports: Vec<PortMapping>,
    /// Bind mounts to undo on destroy.
    pub binds: Vec<BindRecord>,
    /// Recorded events.
    pub events: Vec<String>,
    /// Host path of the rootfs the tree mirrors.
    pub rootfs: Option<PathBuf>,
    /// Usage of the rootfs itself.
    pub rootfs_usage: DiskUsage,
    /// Usage of the tree right after it was populated.
    pub baseline: DiskUsage,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Path of the snapshot inside a container's depot directory.
#[must_use]
pub fn snapshot_path(container_dir: &Path) -> PathBuf {
    container_dir.join(SNAPSHOT_FILE)
}

/// Persists a snapshot atomically.
///
/// # Errors
///
/// Returns an error if the file cannot be written or renamed.
pub fn save(container_dir: &Path, snapshot: &Snapshot) -> Result<()> {
    let path = snapshot_path(container_dir);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&tmp, json).map_err(|e| GardenError::io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| GardenError::io(&path, e))?;
    tracing::debug!(handle = %snapshot.handle, path = %path.display(), "snapshot saved");
    Ok(())
}

/// Reads a snapshot from a container's depot directory.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load(container_dir: &Path) -> Result<Snapshot> {
    let path = snapshot_path(container_dir);
    let content = std::fs::read(&path).map_err(|e| GardenError::io(&path, e))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Every container directory in the depot with its parsed snapshot.
///
/// Directories without a snapshot are skipped; unreadable snapshots are
/// returned as errors so the caller can decide what to do with them.
///
/// # Errors
///
/// Returns an error if the depot cannot be listed.
pub fn load_all(depot: &Path) -> Result<Vec<(PathBuf, Result<Snapshot>)>> {
    let entries = std::fs::read_dir(depot).map_err(|e| GardenError::io(depot, e))?;
    let mut snapshots: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|dir| snapshot_path(dir).is_file())
        .map(|dir| {
            let snapshot = load(&dir);
            (dir, snapshot)
        })
        .collect();
    snapshots.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn sample(handle: &str) -> Snapshot {
        Snapshot {
            handle: Handle::new(handle),
            spec: ContainerSpec::default(),
            state: ContainerState::Active,
            network: NetworkAllocation {
                subnet: "10.254.0.0/30".parse().unwrap(),
                gateway: Ipv4Addr::new(10, 254, 0, 1),
                container_ip: Ipv4Addr::new(10, 254, 0, 2),
                dynamic: true,
            },
            properties: Properties::from([("owner".into(), "me".into())]),
            limits: Limits::default(),
            net_out: Vec::new(),
            mapped_ports: vec![PortMapping {
                host_port: 60000,
                container_port: 8080,
            }],
            binds: Vec::new(),
            events: Vec::new(),
            rootfs: None,
            rootfs_usage: DiskUsage::default(),
            baseline: DiskUsage {
                bytes: 0,
                inodes: 1,
            },
            created_at: Utc::now(),
        }
    }

    #[test]
    fn save_then_load_gives_back_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = sample("abc");
        save(dir.path(), &snapshot).unwrap();
        assert_eq!(load(dir.path()).unwrap(), snapshot);
        assert!(!dir.path().join("snapshot.json.tmp").exists());
    }

    #[test]
    fn load_all_skips_directories_without_snapshots() {
        let depot = tempfile::tempdir().unwrap();
        for handle in ["b", "a"] {
            let dir = depot.path().join(handle);
            std::fs::create_dir(&dir).unwrap();
            save(&dir, &sample(handle)).unwrap();
        }
        std::fs::create_dir(depot.path().join("stray")).unwrap();
        std::fs::create_dir(depot.path().join("broken")).unwrap();
        std::fs::write(depot.path().join("broken/snapshot.json"), b"{").unwrap();

        let all = load_all(depot.path()).unwrap();
        let names: Vec<_> = all
            .iter()
            .map(|(dir, _)| dir.file_name().unwrap().to_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a", "b", "broken"]);
        assert!(all[2].1.is_err());
    }
}
