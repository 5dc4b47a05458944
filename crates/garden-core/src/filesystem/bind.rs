//! Bind-mount materialization.

use std::path::Path;

use garden_common::error::{GardenError, Result};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use serde::{Deserialize, Serialize};

/// How a bind mount ended up in the container tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindKind {
    /// A kernel bind mount; read-only mode is enforced.
    Mounted,
    /// A symlink to the source; access mode is not enforced.
    Linked,
}

/// Exposes `source` at `target`.
///
/// Tries a recursive bind mount first (remounted read-only when asked) and
/// falls back to a symlink when the server lacks the privilege to mount.
///
/// # Errors
///
/// Returns an error if the source is missing, the target cannot be
/// prepared, or the mount fails for a reason other than missing privilege.
pub fn bind(source: &Path, target: &Path, read_only: bool) -> Result<BindKind> {
    if !source.exists() {
        return Err(GardenError::InvalidRequest {
            message: format!("bind mount source does not exist: {}", source.display()),
        });
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GardenError::io(parent, e))?;
    }
    std::fs::create_dir_all(target).map_err(|e| GardenError::io(target, e))?;

    match mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    ) {
        Ok(()) => {
            if read_only {
                let flags =
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC;
                if let Err(e) = mount(None::<&str>, target, None::<&str>, flags, None::<&str>) {
                    let _ = umount2(target, MntFlags::MNT_DETACH);
                    return Err(GardenError::PermissionDenied {
                        message: format!("read-only remount of {} failed: {e}", target.display()),
                    });
                }
            }
            tracing::debug!(source = %source.display(), dst = %target.display(), read_only, "bind mounted");
            Ok(BindKind::Mounted)
        }
        Err(Errno::EPERM | Errno::EACCES) => {
            std::fs::remove_dir(target).map_err(|e| GardenError::io(target, e))?;
            std::os::unix::fs::symlink(source, target).map_err(|e| GardenError::io(target, e))?;
            tracing::debug!(source = %source.display(), dst = %target.display(), "bind linked");
            Ok(BindKind::Linked)
        }
        Err(e) => Err(GardenError::PermissionDenied {
            message: format!("bind mount of {} failed: {e}", source.display()),
        }),
    }
}

/// Removes a bind created by [`bind`], leaving the source untouched.
///
/// # Errors
///
/// Returns an error if the mount cannot be detached or the link removed.
pub fn unbind(target: &Path, kind: BindKind) -> Result<()> {
    match kind {
        BindKind::Mounted => match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => {}
            Err(e) => {
                return Err(GardenError::PermissionDenied {
                    message: format!("unmount of {} failed: {e}", target.display()),
                });
            }
        },
        BindKind::Linked => {
            if target.is_symlink() {
                std::fs::remove_file(target).map_err(|e| GardenError::io(target, e))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = bind(&dir.path().join("nope"), &dir.path().join("dst"), true).unwrap_err();
        assert!(matches!(err, GardenError::InvalidRequest { .. }));
    }

    #[test]
    fn bound_source_is_visible_and_unbind_spares_it() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("file"), b"data").unwrap();

        let target = dir.path().join("tree/home/alice/mnt");
        let kind = bind(&source, &target, false).unwrap();
        assert_eq!(std::fs::read(target.join("file")).unwrap(), b"data");

        unbind(&target, kind).unwrap();
        assert!(source.join("file").exists());
    }
}
