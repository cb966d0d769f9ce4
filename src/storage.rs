//! Content-addressed blob store.
//!
//! Layout under the storage root:
//! - `blobs/<aa>/<digest>`: read-only file content, named by its SHA-256
//! - `blobs/<aa>/<digest>.stamp`: length + mtime recorded when the blob was published
//! - `tmp/`: staging area; blobs are written here and renamed into place
//!
//! A blob is only considered present when its stamp still matches the file on disk, which
//! catches out-of-band edits and deletions without rehashing on every lookup.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path as FsPath, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::error::StorageError;
use crate::tree::{Digest, Name, Path, Tree};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Stamp {
    len: u64,
    modified_secs: u64,
    modified_nanos: u32,
}

impl Stamp {
    fn of(meta: &fs::Metadata) -> Option<Stamp> {
        let modified = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        Some(Stamp {
            len: meta.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [root.join("blobs"), root.join("tmp")] {
            fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        }
        Ok(Storage { root })
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(&digest.as_str()[..2])
            .join(digest.as_str())
    }

    fn stamp_path(&self, digest: &Digest) -> PathBuf {
        self.blob_path(digest).with_extension("stamp")
    }

    /// Fingerprint `path` without copying anything.
    pub fn describe(&self, path: &FsPath) -> Result<Tree, StorageError> {
        scan(path, |_, _| Ok(()))
    }

    /// Fingerprint `path` and publish every distinct blob it contains.
    pub fn store(&self, path: &FsPath) -> Result<Tree, StorageError> {
        scan(path, |digest, bytes| self.publish(digest, bytes))
    }

    /// Whether every blob `tree` references is present and unmodified.
    pub fn can_restore(&self, tree: &Tree) -> bool {
        tree.leaves().into_iter().all(|d| self.check_blob(d).is_ok())
    }

    /// Materialize `tree` at `dst`, which must not exist yet (its parent may).
    ///
    /// All blobs are verified before anything is written.
    pub fn restore(&self, tree: &Tree, dst: &FsPath) -> Result<(), StorageError> {
        for digest in tree.leaves() {
            self.check_blob(digest)?;
        }
        for (path, node) in tree.walk() {
            let target = path.to_fs_path(dst);
            match node {
                Tree::Dir(_) => {
                    fs::create_dir_all(&target).map_err(|e| StorageError::io(&target, e))?;
                }
                Tree::Leaf(digest) => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
                    }
                    self.link_or_copy(digest, &target)?;
                }
            }
        }
        log::debug!("restored {} into {}", tree.digest().short(), dst.display());
        Ok(())
    }

    /// Rehash every stored blob; returns the digests whose content no longer matches.
    pub fn fsck(&self) -> Result<Vec<Digest>, StorageError> {
        let blobs = self.root.join("blobs");
        let mut corrupt = Vec::new();
        for entry in WalkDir::new(&blobs).min_depth(2).sort_by_file_name() {
            let entry = entry.map_err(|source| StorageError::Walk {
                path: blobs.clone(),
                source,
            })?;
            let Some(digest) = entry
                .file_name()
                .to_str()
                .and_then(|name| Digest::parse(name).ok())
            else {
                continue;
            };
            let bytes = fs::read(entry.path()).map_err(|e| StorageError::io(entry.path(), e))?;
            if Digest::of_bytes(&bytes) != digest {
                log::warn!("blob {} does not match its content", digest.short());
                corrupt.push(digest);
            }
        }
        Ok(corrupt)
    }

    fn check_blob(&self, digest: &Digest) -> Result<(), StorageError> {
        let restore_err = |reason| StorageError::Restore {
            digest: digest.clone(),
            reason,
        };
        let meta = fs::metadata(self.blob_path(digest)).map_err(|_| restore_err("is missing"))?;
        let stamp_path = self.stamp_path(digest);
        let raw = fs::read(&stamp_path).map_err(|_| restore_err("has no stamp"))?;
        let recorded: Stamp = serde_json::from_slice(&raw).map_err(|source| StorageError::Stamp {
            digest: digest.clone(),
            source,
        })?;
        if Stamp::of(&meta).as_ref() != Some(&recorded) {
            return Err(restore_err("was modified after it was stored"));
        }
        Ok(())
    }

    fn publish(&self, digest: &Digest, bytes: &[u8]) -> Result<(), StorageError> {
        if self.check_blob(digest).is_ok() {
            return Ok(());
        }
        let dst = self.blob_path(digest);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let tmp_dir = self.root.join("tmp");
        let mut tmp = NamedTempFile::new_in(&tmp_dir).map_err(|e| StorageError::io(&tmp_dir, e))?;
        tmp.write_all(bytes)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        set_readonly(tmp.path())?;
        tmp.persist(&dst)
            .map_err(|e| StorageError::io(&dst, e.error))?;

        let meta = fs::metadata(&dst).map_err(|e| StorageError::io(&dst, e))?;
        let stamp = Stamp::of(&meta).ok_or_else(|| {
            StorageError::io(
                &dst,
                std::io::Error::other("file system does not report modification times"),
            )
        })?;
        let encoded = serde_json::to_vec(&stamp).map_err(|source| StorageError::Stamp {
            digest: digest.clone(),
            source,
        })?;
        let mut tmp = NamedTempFile::new_in(&tmp_dir).map_err(|e| StorageError::io(&tmp_dir, e))?;
        tmp.write_all(&encoded)
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        let stamp_path = self.stamp_path(digest);
        tmp.persist(&stamp_path)
            .map_err(|e| StorageError::io(&stamp_path, e.error))?;

        log::debug!("stored blob {} ({} bytes)", digest.short(), bytes.len());
        Ok(())
    }

    fn link_or_copy(&self, digest: &Digest, target: &FsPath) -> Result<(), StorageError> {
        let blob = self.blob_path(digest);
        match fs::hard_link(&blob, target) {
            Ok(()) => Ok(()),
            Err(e) if can_fall_back_to_copy(e.kind()) => {
                // Never overwrite an existing destination.
                if fs::symlink_metadata(target).is_ok() {
                    return Err(StorageError::io(target, ErrorKind::AlreadyExists.into()));
                }
                fs::copy(&blob, target).map_err(|e| StorageError::io(target, e))?;
                set_readonly(target)
            }
            Err(e) => Err(StorageError::io(target, e)),
        }
    }
}

/// Link failures that a plain copy can work around.
fn can_fall_back_to_copy(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::CrossesDevices | ErrorKind::Unsupported | ErrorKind::PermissionDenied
    )
}

fn set_readonly(path: &FsPath) -> Result<(), StorageError> {
    let mut perms = fs::metadata(path)
        .map_err(|e| StorageError::io(path, e))?
        .permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms).map_err(|e| StorageError::io(path, e))
}

/// Walk `root`, hashing every regular file and handing `(digest, bytes)` to `on_file`.
fn scan(
    root: &FsPath,
    mut on_file: impl FnMut(&Digest, &[u8]) -> Result<(), StorageError>,
) -> Result<Tree, StorageError> {
    let mut leaf = |path: &FsPath| -> Result<Tree, StorageError> {
        let bytes = fs::read(path).map_err(|e| StorageError::io(path, e))?;
        let digest = Digest::of_bytes(&bytes);
        on_file(&digest, &bytes)?;
        Ok(Tree::leaf(digest))
    };

    let meta = fs::symlink_metadata(root).map_err(|e| StorageError::io(root, e))?;
    if meta.is_file() {
        return leaf(root);
    }
    if !meta.is_dir() {
        return Err(StorageError::UnsupportedFile {
            path: root.to_path_buf(),
        });
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|source| StorageError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        let location = tree_path(root, entry.path())?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            entries.push((location, Tree::empty()));
        } else if file_type.is_file() {
            entries.push((location, leaf(entry.path())?));
        } else {
            return Err(StorageError::UnsupportedFile {
                path: entry.path().to_path_buf(),
            });
        }
    }
    Ok(Tree::from_entries(entries)?)
}

fn tree_path(root: &FsPath, path: &FsPath) -> Result<Path, StorageError> {
    let unsupported = || StorageError::UnsupportedFile {
        path: path.to_path_buf(),
    };
    let relative = path.strip_prefix(root).map_err(|_| unsupported())?;
    let mut names = Vec::new();
    for component in relative.components() {
        let raw = component.as_os_str().to_str().ok_or_else(unsupported)?;
        names.push(Name::new(raw)?);
    }
    Ok(Path::new(names))
}
