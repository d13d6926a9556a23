//! Directory snapshot packaging
//!
//! A snapshot is a tar archive of a directory's contents with paths relative
//! to the directory root. Archives pass through a staging directory on disk
//! and everything staged is removed before the call returns, whether it
//! succeeded or not.

use crate::{types::random_hex, Error, Result, SyncPayload};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Packs directories into payloads and unpacks payloads into directories
pub trait Packager: Send + Sync {
    /// Pack the full current contents of `directory`
    fn pack(&self, directory: &Path) -> Result<SyncPayload>;

    /// Unpack `payload` into `destination`, creating it if needed
    fn unpack(&self, payload: &SyncPayload, destination: &Path) -> Result<()>;
}

/// Tar-based packager with an on-disk staging area
#[derive(Debug, Clone)]
pub struct TarPackager {
    staging_dir: PathBuf,
}

impl TarPackager {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    /// Where archive artifacts live while a pack or unpack is in progress
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    fn stage(&self, name: String) -> Result<Staged> {
        std::fs::create_dir_all(&self.staging_dir)
            .map_err(|e| packaging("create staging directory", &self.staging_dir, e))?;
        Ok(Staged {
            path: self.staging_dir.join(name),
        })
    }

    fn stage_archive(&self, purpose: &str) -> Result<Staged> {
        self.stage(format!("{}-{}.tar", purpose, random_hex(8)?))
    }
}

impl Packager for TarPackager {
    fn pack(&self, directory: &Path) -> Result<SyncPayload> {
        if !directory.is_dir() {
            return Err(Error::Packaging(format!(
                "{} is not a directory",
                directory.display()
            )));
        }

        let staged = self.stage_archive("pack")?;
        let file = File::create(&staged.path)
            .map_err(|e| packaging("create archive", &staged.path, e))?;

        let mut builder = tar::Builder::new(BufWriter::new(file));
        builder.follow_symlinks(false);
        builder
            .append_dir_all("", directory)
            .map_err(|e| packaging("archive", directory, e))?;
        builder
            .into_inner()
            .and_then(|writer| writer.into_inner().map_err(|e| e.into_error()))
            .map_err(|e| packaging("finish archive", &staged.path, e))?;

        let data =
            std::fs::read(&staged.path).map_err(|e| packaging("read archive", &staged.path, e))?;
        tracing::debug!(
            "Packed {} into {} bytes",
            directory.display(),
            data.len()
        );
        Ok(SyncPayload::from(data))
    }

    /// Extract into a staging directory first and only merge a complete
    /// extraction into `destination`, so a broken archive leaves it untouched.
    fn unpack(&self, payload: &SyncPayload, destination: &Path) -> Result<()> {
        let staged = self.stage_archive("unpack")?;
        std::fs::write(&staged.path, payload.as_bytes())
            .map_err(|e| packaging("write archive", &staged.path, e))?;

        let extracted = self.stage(format!("unpack-{}", random_hex(8)?))?;
        std::fs::create_dir_all(&extracted.path)
            .map_err(|e| packaging("create", &extracted.path, e))?;
        let file =
            File::open(&staged.path).map_err(|e| packaging("open archive", &staged.path, e))?;
        let mut archive = tar::Archive::new(file);
        archive.set_preserve_permissions(false);
        archive
            .unpack(&extracted.path)
            .map_err(|e| packaging("unpack into", &extracted.path, e))?;

        let existed = destination.exists();
        if let Err(e) = merge_dir(&extracted.path, destination) {
            if !existed {
                remove_partial(destination);
            }
            return Err(packaging("merge into", destination, e));
        }

        tracing::debug!(
            "Unpacked {} bytes into {}",
            payload.len(),
            destination.display()
        );
        Ok(())
    }
}

/// Move everything under `from` into `to`, overwriting files that exist in both
fn merge_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            merge_dir(&source, &target)?;
        } else if std::fs::rename(&source, &target).is_err() {
            // Staging may sit on another filesystem.
            std::fs::copy(&source, &target)?;
        }
    }
    Ok(())
}

fn remove_partial(destination: &Path) {
    if let Err(e) = std::fs::remove_dir_all(destination) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(
                "Failed to remove partially unpacked {}: {}",
                destination.display(),
                e
            );
        }
    }
}

/// A file or directory in the staging area, removed when dropped
struct Staged {
    path: PathBuf,
}

impl Drop for Staged {
    fn drop(&mut self) {
        let removed = if self.path.is_dir() {
            std::fs::remove_dir_all(&self.path)
        } else {
            std::fs::remove_file(&self.path)
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove staged {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

fn packaging(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Packaging(format!("{} {}: {}", action, path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use tempfile::TempDir;

    fn staging_is_empty(packager: &TarPackager) -> bool {
        match std::fs::read_dir(packager.staging_dir()) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }

    #[test]
    fn test_pack_unpack_files() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        std::fs::create_dir_all(source.join("b")).unwrap();
        std::fs::write(source.join("a.txt"), b"alpha").unwrap();
        std::fs::write(source.join("b").join("c.txt"), b"gamma\x00\xff").unwrap();

        let packager = TarPackager::new(temp_dir.path().join("staging"));
        let payload = packager.pack(&source).unwrap();
        assert!(staging_is_empty(&packager));

        let destination = temp_dir.path().join("destination");
        packager.unpack(&payload, &destination).unwrap();
        assert!(staging_is_empty(&packager));

        assert_eq!(std::fs::read(destination.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(
            std::fs::read(destination.join("b").join("c.txt")).unwrap(),
            b"gamma\x00\xff"
        );
    }

    #[test]
    fn test_pack_unpack_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("empty");
        std::fs::create_dir_all(&source).unwrap();

        let packager = TarPackager::new(temp_dir.path().join("staging"));
        let payload = packager.pack(&source).unwrap();

        let destination = temp_dir.path().join("destination");
        packager.unpack(&payload, &destination).unwrap();
        assert!(destination.is_dir());
        assert_eq!(std::fs::read_dir(&destination).unwrap().count(), 0);
    }

    #[test]
    fn test_pack_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let packager = TarPackager::new(temp_dir.path().join("staging"));
        let err = packager.pack(&temp_dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Packaging);
        assert!(staging_is_empty(&packager));
    }

    #[test]
    fn test_unpack_garbage_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        let packager = TarPackager::new(temp_dir.path().join("staging"));
        let destination = temp_dir.path().join("destination");

        let err = packager
            .unpack(&SyncPayload::from(vec![0xabu8; 1024]), &destination)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Packaging);
        assert!(staging_is_empty(&packager));
        assert!(!destination.exists());
    }

    #[test]
    fn test_unpack_keeps_existing_destination() {
        let temp_dir = TempDir::new().unwrap();
        let packager = TarPackager::new(temp_dir.path().join("staging"));
        let destination = temp_dir.path().join("destination");
        std::fs::create_dir_all(&destination).unwrap();
        std::fs::write(destination.join("keep.txt"), b"mine").unwrap();

        assert!(packager
            .unpack(&SyncPayload::from(vec![0xabu8; 1024]), &destination)
            .is_err());
        assert_eq!(std::fs::read(destination.join("keep.txt")).unwrap(), b"mine");
    }

    #[test]
    fn test_broken_entry_leaves_existing_destination_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a_first.txt"), b"first").unwrap();
        std::fs::write(source.join("z_second.txt"), b"second").unwrap();

        let packager = TarPackager::new(temp_dir.path().join("staging"));
        let mut bytes = packager.pack(&source).unwrap().as_bytes().to_vec();
        // Header, one data block, then the second entry's header.
        bytes[1024..1124].fill(0xff);

        let destination = temp_dir.path().join("destination");
        std::fs::create_dir_all(&destination).unwrap();
        std::fs::write(destination.join("mine.txt"), b"local").unwrap();

        let err = packager
            .unpack(&SyncPayload::from(bytes), &destination)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Packaging);
        assert!(staging_is_empty(&packager));

        let names: Vec<_> = std::fs::read_dir(&destination)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["mine.txt"]);
    }

    #[test]
    fn test_unpack_merges_over_existing_files() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("source");
        std::fs::create_dir_all(source.join("nested")).unwrap();
        std::fs::write(source.join("shared.txt"), b"remote").unwrap();
        std::fs::write(source.join("nested").join("n.txt"), b"deep").unwrap();

        let packager = TarPackager::new(temp_dir.path().join("staging"));
        let payload = packager.pack(&source).unwrap();

        let destination = temp_dir.path().join("destination");
        std::fs::create_dir_all(destination.join("nested")).unwrap();
        std::fs::write(destination.join("shared.txt"), b"local").unwrap();
        std::fs::write(destination.join("extra.txt"), b"kept").unwrap();

        packager.unpack(&payload, &destination).unwrap();
        assert_eq!(std::fs::read(destination.join("shared.txt")).unwrap(), b"remote");
        assert_eq!(std::fs::read(destination.join("nested").join("n.txt")).unwrap(), b"deep");
        assert_eq!(std::fs::read(destination.join("extra.txt")).unwrap(), b"kept");
        assert!(staging_is_empty(&packager));
    }
}
