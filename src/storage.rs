//! Storage abstraction under the queue index.
//!
//! The index is specified against a lower-level I/O layer that owns file
//! handles, buffering, and barriers. `Directory` is that layer: a minimal,
//! backend-agnostic view of the broker data directory. All index paths are
//! relative to the directory root, e.g. `queues/<dir-name>/journal.jif`.
//!
//! Vocabulary:
//! - `flush()` on a writer is a visibility boundary (userspace → OS), not a
//!   stable-storage guarantee.
//! - Stable-storage durability needs explicit `sync_all` barriers, and for
//!   creates/renames also a parent-directory sync. [`sync_file`] and
//!   [`sync_parent_dir`] are those barriers; they require a backend that can
//!   expose `file_path()`.

use crate::error::{IndexError, IndexResult};
use std::io::{Read, Write};
use std::path::PathBuf;

/// `fsync`/`sync_all` the file at `path`.
///
/// Returns `NotSupported` for backends that do not map to the OS filesystem
/// (no `file_path()`).
pub fn sync_file<D: Directory + ?Sized>(dir: &D, path: &str) -> IndexResult<()> {
    let Some(p) = dir.file_path(path) else {
        return Err(IndexError::NotSupported(
            "sync_file requires Directory::file_path()".into(),
        ));
    };
    let f = std::fs::OpenOptions::new().read(true).open(&p)?;
    f.sync_all()?;
    Ok(())
}

/// `fsync`/`sync_all` the parent directory of `path`.
///
/// Needed to make *names* durable: file creation and rename survive power
/// loss only once the containing directory is synced.
pub fn sync_parent_dir<D: Directory + ?Sized>(dir: &D, path: &str) -> IndexResult<()> {
    let Some(p) = dir.file_path(path) else {
        return Err(IndexError::NotSupported(
            "sync_parent_dir requires Directory::file_path()".into(),
        ));
    };
    let Some(parent) = p.parent() else {
        return Err(IndexError::InvalidConfig(format!(
            "path has no parent directory: {p:?}"
        )));
    };
    let f = std::fs::File::open(parent)?;
    f.sync_all()?;
    Ok(())
}

/// Barrier for callers that accept backend-dependent strength: a real
/// `sync_all` on filesystem backends, a no-op where `file_path()` is
/// unavailable and the backend's `flush` already made bytes visible.
///
/// The journal fsync protocol uses this so that in-memory test backends can
/// exercise the confirm path.
pub fn sync_file_if_possible<D: Directory + ?Sized>(dir: &D, path: &str) -> IndexResult<()> {
    if dir.file_path(path).is_none() {
        return Ok(());
    }
    sync_file(dir, path)
}

/// Trait for directory-like storage backends.
pub trait Directory: Send + Sync {
    /// Create a new file for writing (overwriting if it exists).
    fn create_file(&self, path: &str) -> IndexResult<Box<dyn Write>>;
    /// Open an existing file for reading.
    fn open_file(&self, path: &str) -> IndexResult<Box<dyn Read>>;
    /// Return whether a path exists.
    fn exists(&self, path: &str) -> bool;
    /// Delete a file or directory (directories recursively).
    fn delete(&self, path: &str) -> IndexResult<()>;
    /// Atomically rename/move a file.
    fn atomic_rename(&self, from: &str, to: &str) -> IndexResult<()>;
    /// Create a directory (and parents if needed).
    fn create_dir_all(&self, path: &str) -> IndexResult<()>;
    /// List entries in a directory. A missing directory lists as empty.
    fn list_dir(&self, path: &str) -> IndexResult<Vec<String>>;
    /// Open a file for appending (creating it if missing).
    fn append_file(&self, path: &str) -> IndexResult<Box<dyn Write>>;
    /// Atomically write bytes to a path (write-temp + rename).
    fn atomic_write(&self, path: &str, data: &[u8]) -> IndexResult<()>;
    /// Truncate a file to zero length, creating it if missing.
    fn truncate_file(&self, path: &str) -> IndexResult<()>;
    /// Optional filesystem path for backends that support it.
    fn file_path(&self, path: &str) -> Option<PathBuf>;
}

/// Filesystem-backed `Directory` rooted at the broker data directory.
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Create (or open) a filesystem backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> IndexResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Resolve a path that is about to be written, materializing its
    /// parent. This is the single place queue directories come into
    /// existence: the journal's first lazy append, a segment overlay
    /// append, a terms or upgrade file.
    fn writable(&self, path: &str) -> IndexResult<PathBuf> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(full)
    }
}

fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

impl Directory for FsDirectory {
    fn create_file(&self, path: &str) -> IndexResult<Box<dyn Write>> {
        // Fresh-file writes: the upgraders' `.upgrade` outputs.
        Ok(Box::new(std::fs::File::create(self.writable(path)?)?))
    }

    fn open_file(&self, path: &str) -> IndexResult<Box<dyn Read>> {
        let full = self.resolve(path);
        match std::fs::File::open(&full) {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if is_not_found(&e) => Err(IndexError::MissingPath(full)),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn delete(&self, path: &str) -> IndexResult<()> {
        // Queue directories go recursively (erase, orphan pruning);
        // otherwise it is a single fully-acked segment file. Already-gone
        // paths are not an error.
        let full = self.resolve(path);
        let removed = match std::fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&full),
            Ok(_) => std::fs::remove_file(&full),
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match removed {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn atomic_rename(&self, from: &str, to: &str) -> IndexResult<()> {
        let to = self.writable(to)?;
        std::fs::rename(self.resolve(from), to)?;
        Ok(())
    }

    fn create_dir_all(&self, path: &str) -> IndexResult<()> {
        std::fs::create_dir_all(self.resolve(path))?;
        Ok(())
    }

    fn list_dir(&self, path: &str) -> IndexResult<Vec<String>> {
        // A queue directory that was never written lists as empty, the
        // same answer recovery gets for a queue with no history.
        let entries = match std::fs::read_dir(self.resolve(path)) {
            Ok(it) => it,
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn append_file(&self, path: &str) -> IndexResult<Box<dyn Write>> {
        // The journal's lazy-open handle and segment overlay appends.
        let full = self.writable(path)?;
        let f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(full)?;
        Ok(Box::new(f))
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> IndexResult<()> {
        // Stage next to the destination, sync, rename over it. Used for
        // the recovery-terms file and the format version marker; a failure
        // mid-stage must not leave a stray `.tmp` behind.
        let staged = self.writable(&format!("{path}.tmp"))?;
        let dest = self.resolve(path);
        let write = (|| -> IndexResult<()> {
            let mut f = std::fs::File::create(&staged)?;
            f.write_all(data)?;
            f.sync_all()?;
            std::fs::rename(&staged, &dest)?;
            Ok(())
        })();
        if write.is_err() {
            let _ = std::fs::remove_file(&staged);
            return write;
        }
        // The rename is durable only once the directory itself is synced.
        if let Some(parent) = dest.parent() {
            if let Ok(d) = std::fs::File::open(parent) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }

    fn truncate_file(&self, path: &str) -> IndexResult<()> {
        // Journal reset after a flush drained it into segments.
        let full = self.writable(path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(full)?
            .sync_all()?;
        Ok(())
    }

    fn file_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.resolve(path))
    }
}

/// In-memory `Directory` used for tests.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    files: std::sync::Arc<std::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>>,
}

impl MemoryDirectory {
    /// Create an empty in-memory directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> IndexError {
        IndexError::LockFailed {
            resource: "memory directory".to_string(),
            reason: "lock poisoned".to_string(),
        }
    }
}

impl Directory for MemoryDirectory {
    fn create_file(&self, path: &str) -> IndexResult<Box<dyn Write>> {
        // Overwrite semantics: clear the file eagerly, then append in-place.
        self.files
            .write()
            .map_err(|_| Self::lock_err())?
            .insert(path.to_string(), Vec::new());

        Ok(Box::new(MemoryInPlaceWriter {
            files: self.files.clone(),
            path: path.to_string(),
        }))
    }

    fn open_file(&self, path: &str) -> IndexResult<Box<dyn Read>> {
        let files = self.files.read().map_err(|_| Self::lock_err())?;
        let data = files
            .get(path)
            .ok_or_else(|| IndexError::NotFound(path.to_string()))?
            .clone();
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn exists(&self, path: &str) -> bool {
        self.files
            .read()
            .map(|f| {
                let dir_prefix = format!("{path}/");
                f.contains_key(path) || f.keys().any(|k| k.starts_with(&dir_prefix))
            })
            .unwrap_or(false)
    }

    fn delete(&self, path: &str) -> IndexResult<()> {
        let mut files = self.files.write().map_err(|_| Self::lock_err())?;
        files.remove(path);
        // Directory delete: drop everything under the prefix.
        let dir_prefix = format!("{path}/");
        files.retain(|k, _| !k.starts_with(&dir_prefix));
        Ok(())
    }

    fn atomic_rename(&self, from: &str, to: &str) -> IndexResult<()> {
        let mut files = self.files.write().map_err(|_| Self::lock_err())?;
        if let Some(data) = files.remove(from) {
            files.insert(to.to_string(), data);
        }
        Ok(())
    }

    fn create_dir_all(&self, _path: &str) -> IndexResult<()> {
        Ok(())
    }

    fn list_dir(&self, path: &str) -> IndexResult<Vec<String>> {
        let files = self.files.read().map_err(|_| Self::lock_err())?;
        let prefix = if path.is_empty() {
            "".to_string()
        } else {
            format!("{path}/")
        };
        let mut result: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .map(|k| {
                let rest = k.strip_prefix(&prefix).unwrap_or(k);
                // Only the immediate child name, as a filesystem listing would give.
                match rest.split_once('/') {
                    Some((child, _)) => child.to_string(),
                    None => rest.to_string(),
                }
            })
            .collect();
        result.sort();
        result.dedup();
        Ok(result)
    }

    fn append_file(&self, path: &str) -> IndexResult<Box<dyn Write>> {
        {
            let mut files = self.files.write().map_err(|_| Self::lock_err())?;
            files.entry(path.to_string()).or_insert_with(Vec::new);
        }
        Ok(Box::new(MemoryInPlaceWriter {
            files: self.files.clone(),
            path: path.to_string(),
        }))
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> IndexResult<()> {
        let mut files = self.files.write().map_err(|_| Self::lock_err())?;
        files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn truncate_file(&self, path: &str) -> IndexResult<()> {
        let mut files = self.files.write().map_err(|_| Self::lock_err())?;
        files.insert(path.to_string(), Vec::new());
        Ok(())
    }

    fn file_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

struct MemoryInPlaceWriter {
    files: std::sync::Arc<std::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>>,
    path: String,
}

impl Write for MemoryInPlaceWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut files = self
            .files
            .write()
            .map_err(|_| std::io::Error::other("lock poisoned"))?;
        let entry = files.entry(self.path.clone()).or_insert_with(Vec::new);
        entry.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
