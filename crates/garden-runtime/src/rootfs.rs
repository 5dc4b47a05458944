//! Root filesystem resolution and container tree population.
//!
//! A container's working tree lives at `<depot>/<handle>/rootfs`. When a
//! rootfs directory is given, its directory structure is mirrored into the
//! tree and every non-directory entry is symlinked back to the source, so
//! files the container creates land in directories it owns.

use std::path::{Component, Path, PathBuf};

use garden_common::error::{GardenError, Result};
use garden_core::usage::{self, DiskUsage};
use walkdir::WalkDir;

/// Where a container's tree comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootfsSource {
    /// An empty tree.
    Empty,
    /// A host directory mirrored into the tree.
    Directory(PathBuf),
}

impl RootfsSource {
    /// Host path of the source directory, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Empty => None,
            Self::Directory(path) => Some(path),
        }
    }
}

/// Interprets the `rootfs_path` of a container spec.
///
/// An empty value selects `default`, or an empty tree when there is none.
/// `raw://<path>` and plain paths must name an existing directory.
///
/// # Errors
///
/// Returns [`GardenError::Rootfs`] for unsupported schemes and missing
/// directories.
pub fn resolve(rootfs_path: &str, default: Option<&Path>) -> Result<RootfsSource> {
    if rootfs_path.is_empty() {
        return Ok(default.map_or(RootfsSource::Empty, |p| {
            RootfsSource::Directory(p.to_path_buf())
        }));
    }

    let path = match rootfs_path.split_once("://") {
        Some(("raw", path)) => path,
        Some(("docker", _)) => {
            return Err(GardenError::Rootfs {
                message: format!("image rootfs is not supported: {rootfs_path}"),
            });
        }
        Some((scheme, _)) => {
            return Err(GardenError::Rootfs {
                message: format!("unsupported rootfs scheme '{scheme}'"),
            });
        }
        None => rootfs_path,
    };

    let path = PathBuf::from(path);
    if !path.is_dir() {
        return Err(GardenError::Rootfs {
            message: format!("rootfs directory does not exist: {}", path.display()),
        });
    }
    Ok(RootfsSource::Directory(path))
}

/// Creates `tree` and mirrors `source` into it.
///
/// Returns the usage of the source itself, which counts toward the
/// container's total disk usage.
///
/// # Errors
///
/// Returns an error if a directory or link cannot be created.
pub fn populate(tree: &Path, source: &RootfsSource) -> Result<DiskUsage> {
    std::fs::create_dir_all(tree).map_err(|e| GardenError::io(tree, e))?;
    let RootfsSource::Directory(root) = source else {
        return Ok(DiskUsage::default());
    };

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| GardenError::Rootfs {
            message: format!("cannot walk rootfs {}: {e}", root.display()),
        })?;
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let target = tree.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| GardenError::io(&target, e))?;
        } else {
            std::os::unix::fs::symlink(entry.path(), &target)
                .map_err(|e| GardenError::io(&target, e))?;
        }
    }

    let usage = usage::disk_usage(root);
    tracing::info!(
        rootfs = %root.display(),
        tree = %tree.display(),
        bytes = usage.bytes,
        "rootfs mirrored"
    );
    Ok(usage)
}

/// Maps a path inside the container onto the host tree.
///
/// Relative paths are taken from `/`. Paths that would climb out of the
/// tree are rejected.
///
/// # Errors
///
/// Returns [`GardenError::InvalidRequest`] if the path contains `..`.
pub fn host_path(tree: &Path, container_path: &str) -> Result<PathBuf> {
    let mut resolved = tree.to_path_buf();
    for component in Path::new(container_path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(GardenError::InvalidRequest {
                    message: format!("path escapes the container: {container_path}"),
                });
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_uses_default_or_nothing() {
        assert_eq!(resolve("", None).unwrap(), RootfsSource::Empty);
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve("", Some(dir.path())).unwrap(),
            RootfsSource::Directory(dir.path().to_path_buf())
        );
    }

    #[test]
    fn raw_scheme_and_plain_paths_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let raw = format!("raw://{}", dir.path().display());
        assert_eq!(
            resolve(&raw, None).unwrap().path(),
            Some(dir.path())
        );
        assert_eq!(
            resolve(dir.path().to_str().unwrap(), None).unwrap().path(),
            Some(dir.path())
        );
    }

    #[test]
    fn unknown_sources_are_rejected() {
        for bad in ["docker:///busybox", "ftp://host/fs", "/no/such/rootfs"] {
            let err = resolve(bad, None).unwrap_err();
            assert!(matches!(err, GardenError::Rootfs { .. }), "{bad}");
        }
    }

    #[test]
    fn populate_mirrors_directories_and_links_files() {
        let rootfs = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(rootfs.path().join("etc")).unwrap();
        std::fs::write(rootfs.path().join("etc/hostname"), b"garden").unwrap();

        let depot = tempfile::tempdir().unwrap();
        let tree = depot.path().join("rootfs");
        let usage = populate(&tree, &RootfsSource::Directory(rootfs.path().into())).unwrap();

        assert_eq!(usage.bytes, 6);
        assert!(tree.join("etc").is_dir() && !tree.join("etc").is_symlink());
        assert!(tree.join("etc/hostname").is_symlink());
        assert_eq!(std::fs::read(tree.join("etc/hostname")).unwrap(), b"garden");

        std::fs::write(tree.join("etc/junk"), b"x").unwrap();
        assert!(!rootfs.path().join("etc/junk").exists());
    }

    #[test]
    fn host_path_stays_inside_the_tree() {
        let tree = Path::new("/depot/h/rootfs");
        assert_eq!(
            host_path(tree, "/home/vcap/file").unwrap(),
            tree.join("home/vcap/file")
        );
        assert_eq!(host_path(tree, "tmp").unwrap(), tree.join("tmp"));
        assert!(host_path(tree, "/home/../../etc").is_err());
    }
}
