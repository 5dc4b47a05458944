//! Tar streaming into and out of container trees.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use garden_common::error::{GardenError, Result};

/// Unpacks a tar archive into `destination`, creating it if needed.
///
/// # Errors
///
/// Returns an error if the archive is malformed or an entry cannot be
/// written.
pub fn unpack(archive: &[u8], destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination).map_err(|e| GardenError::io(destination, e))?;
    let mut archive = tar::Archive::new(Cursor::new(archive));
    archive.set_preserve_permissions(true);
    archive
        .unpack(destination)
        .map_err(|e| GardenError::io(destination, e))?;
    tracing::debug!(destination = %destination.display(), "archive unpacked");
    Ok(())
}

/// Packs `source` into a tar archive.
///
/// A directory is archived with its contents under its own name; a file
/// becomes a single entry.
///
/// # Errors
///
/// Returns an error if `source` is missing or cannot be read.
pub fn pack(source: &Path) -> Result<Vec<u8>> {
    let meta = std::fs::metadata(source).map_err(|e| GardenError::io(source, e))?;
    let name = source
        .file_name()
        .map_or_else(|| PathBuf::from("."), PathBuf::from);

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    if meta.is_dir() {
        builder
            .append_dir_all(&name, source)
            .map_err(|e| GardenError::io(source, e))?;
    } else {
        builder
            .append_path_with_name(source, &name)
            .map_err(|e| GardenError::io(source, e))?;
    }
    builder.into_inner().map_err(|e| GardenError::io(source, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_round_trips_through_a_tree() {
        let src = tempfile::tempdir().unwrap();
        let payload = src.path().join("payload");
        std::fs::create_dir(&payload).unwrap();
        std::fs::write(payload.join("some-file"), b"hello").unwrap();

        let archive = pack(&payload).unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack(&archive, &dst.path().join("home/vcap")).unwrap();

        let copied = dst.path().join("home/vcap/payload/some-file");
        assert_eq!(std::fs::read(copied).unwrap(), b"hello");
    }

    #[test]
    fn single_file_is_one_entry() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("note"), b"x").unwrap();
        let archive = pack(&src.path().join("note")).unwrap();

        let mut entries = tar::Archive::new(Cursor::new(archive));
        let names: Vec<_> = entries
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, ["note"]);
    }

    #[test]
    fn missing_source_is_an_error() {
        assert!(pack(Path::new("/no/such/garden/path")).is_err());
    }
}
