//! Storage abstraction for the log.
//!
//! Vocabulary note:
//! - `flush()` on a writer hands bytes to the OS (a **visibility** boundary).
//! - Stable-storage **durability** (survives power loss after reporting success)
//!   additionally requires explicit `fsync`/`sync_all` barriers and sometimes
//!   parent-directory sync after creates/renames.
//!
//! Backends that do not map to real files (`MemoryDirectory`) return `None` from
//! `file_path()`; durability barriers are `NotSupported` there.

use crate::error::{LogError, LogResult};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Attempt to `fsync`/`sync_all` the file at `path`.
///
/// This does **not** sync the parent directory; if you are relying on file creation or
/// rename being durable across power loss, also call [`sync_parent_dir`].
pub fn sync_file<D: Directory + ?Sized>(dir: &D, path: &str) -> LogResult<()> {
    let Some(p) = dir.file_path(path) else {
        return Err(LogError::NotSupported(
            "sync_file requires Directory::file_path()".into(),
        ));
    };
    let f = std::fs::OpenOptions::new().read(true).open(&p)?;
    f.sync_all()?;
    Ok(())
}

/// Attempt to `fsync`/`sync_all` the parent directory of `path`.
///
/// This is the commonly-missed step needed to make *names* durable (file creation,
/// atomic rename, deletion).
pub fn sync_parent_dir<D: Directory + ?Sized>(dir: &D, path: &str) -> LogResult<()> {
    let Some(p) = dir.file_path(path) else {
        return Err(LogError::NotSupported(
            "sync_parent_dir requires Directory::file_path()".into(),
        ));
    };
    let Some(parent) = p.parent() else {
        return Err(LogError::InvalidConfig(format!(
            "path has no parent directory: {p:?}"
        )));
    };
    let f = std::fs::File::open(parent)?;
    f.sync_all()?;
    Ok(())
}

/// Trait for directory-like storage backends.
pub trait Directory: Send + Sync {
    /// Create a new file for writing (overwriting if it exists).
    fn create_file(&self, path: &str) -> LogResult<Box<dyn Write + Send>>;
    /// Open an existing file for reading.
    fn open_file(&self, path: &str) -> LogResult<Box<dyn Read>>;
    /// Open an existing file for reading, positioned at byte `offset`.
    ///
    /// The default implementation reads and discards the prefix; backends with
    /// random access should override it. Offsets past EOF yield an empty reader.
    fn open_file_at(&self, path: &str, offset: u64) -> LogResult<Box<dyn Read>> {
        let mut r = self.open_file(path)?;
        std::io::copy(&mut (&mut r).take(offset), &mut std::io::sink())?;
        Ok(r)
    }
    /// Return whether a path exists.
    fn exists(&self, path: &str) -> bool;
    /// Delete a file or directory (directories recursively).
    fn delete(&self, path: &str) -> LogResult<()>;
    /// Atomically rename/move a file.
    fn atomic_rename(&self, from: &str, to: &str) -> LogResult<()>;
    /// Create a directory (and parents if needed).
    fn create_dir_all(&self, path: &str) -> LogResult<()>;
    /// List entries in a directory (`""` is the root).
    fn list_dir(&self, path: &str) -> LogResult<Vec<String>>;
    /// Open a file for appending (creating it if missing).
    fn append_file(&self, path: &str) -> LogResult<Box<dyn Write + Send>>;
    /// Atomically write bytes to a path.
    fn atomic_write(&self, path: &str, data: &[u8]) -> LogResult<()>;
    /// Optional filesystem path for backends that support it.
    fn file_path(&self, path: &str) -> Option<PathBuf>;
}

/// Opt-in stable-storage durability operations for a `Directory`.
///
/// Default implementations use [`sync_file`] / [`sync_parent_dir`], which require
/// `Directory::file_path()`. For non-filesystem backends, these return `NotSupported`.
pub trait DurableDirectory: Directory {
    /// Attempt to make the file at `path` durable on stable storage.
    fn sync_file(&self, path: &str) -> LogResult<()> {
        sync_file(self, path)
    }

    /// Attempt to make the *name* of `path` durable (sync the parent directory).
    fn sync_parent_dir(&self, path: &str) -> LogResult<()> {
        sync_parent_dir(self, path)
    }

    /// Whether this backend can issue stable-storage barriers for `path`.
    fn supports_sync(&self, path: &str) -> bool {
        self.file_path(path).is_some()
    }

    /// Atomically write bytes to `path` with explicit durability barriers.
    ///
    /// - write temp file
    /// - `sync_file(temp)`
    /// - atomic rename temp → final
    /// - `sync_parent_dir(final)`
    fn atomic_write_durable(&self, path: &str, data: &[u8]) -> LogResult<()> {
        if self.file_path(path).is_none() {
            return Err(LogError::NotSupported(
                "atomic_write_durable requires Directory::file_path()".into(),
            ));
        }

        let tmp = format!("{path}.tmp");
        if let Err(e) = (|| -> LogResult<()> {
            let mut w = self.create_file(&tmp)?;
            w.write_all(data)?;
            w.flush()?;
            Ok(())
        })() {
            let _ = self.delete(&tmp);
            return Err(e);
        }

        if let Err(e) = self.sync_file(&tmp) {
            let _ = self.delete(&tmp);
            return Err(e);
        }

        if let Err(e) = self.atomic_rename(&tmp, path) {
            let _ = self.delete(&tmp);
            return Err(e);
        }
        self.sync_parent_dir(path)
    }
}

impl<T: Directory + ?Sized> DurableDirectory for T {}

/// Filesystem-backed `Directory` rooted at a local path.
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Create (or open) a filesystem directory backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> LogResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Directory for FsDirectory {
    fn create_file(&self, path: &str) -> LogResult<Box<dyn Write + Send>> {
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(std::fs::File::create(full_path)?))
    }

    fn open_file(&self, path: &str) -> LogResult<Box<dyn Read>> {
        let full_path = self.resolve_path(path);
        if !full_path.exists() {
            return Err(LogError::MissingPath(full_path));
        }
        Ok(Box::new(std::fs::File::open(full_path)?))
    }

    fn open_file_at(&self, path: &str, offset: u64) -> LogResult<Box<dyn Read>> {
        let full_path = self.resolve_path(path);
        if !full_path.exists() {
            return Err(LogError::MissingPath(full_path));
        }
        let mut f = std::fs::File::open(full_path)?;
        f.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(f))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve_path(path).exists()
    }

    fn delete(&self, path: &str) -> LogResult<()> {
        let full_path = self.resolve_path(path);
        if full_path.is_dir() {
            std::fs::remove_dir_all(full_path)?;
        } else if full_path.exists() {
            std::fs::remove_file(full_path)?;
        }
        Ok(())
    }

    fn atomic_rename(&self, from: &str, to: &str) -> LogResult<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        if let Some(parent) = to_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(from_path, to_path)?;
        Ok(())
    }

    fn create_dir_all(&self, path: &str) -> LogResult<()> {
        std::fs::create_dir_all(self.resolve_path(path))?;
        Ok(())
    }

    fn list_dir(&self, path: &str) -> LogResult<Vec<String>> {
        let full_path = self.resolve_path(path);
        if !full_path.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(full_path)? {
            let entry = entry?;
            out.push(entry.file_name().to_string_lossy().to_string());
        }
        out.sort();
        Ok(out)
    }

    fn append_file(&self, path: &str) -> LogResult<Box<dyn Write + Send>> {
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(full_path)?;
        Ok(Box::new(file))
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> LogResult<()> {
        let temp_path = format!("{path}.tmp");
        let full_temp_path = self.resolve_path(&temp_path);
        if let Some(parent) = full_temp_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut temp_file = std::fs::File::create(&full_temp_path)?;
        temp_file.write_all(data)?;
        temp_file.sync_all()?;

        let full_path = self.resolve_path(path);
        std::fs::rename(&full_temp_path, &full_path)?;

        if let Some(parent) = full_path.parent() {
            if let Ok(parent_file) = std::fs::File::open(parent) {
                let _ = parent_file.sync_all();
            }
        }
        Ok(())
    }

    fn file_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.resolve_path(path))
    }
}

type SharedFiles = std::sync::Arc<std::sync::RwLock<std::collections::HashMap<String, Vec<u8>>>>;

/// In-memory `Directory` used for tests.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    files: SharedFiles,
}

impl MemoryDirectory {
    /// Create an empty in-memory directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn write_files(
        &self,
    ) -> LogResult<std::sync::RwLockWriteGuard<'_, std::collections::HashMap<String, Vec<u8>>>>
    {
        self.files
            .write()
            .map_err(|_| LogError::poisoned("memory directory"))
    }

    fn read_files(
        &self,
    ) -> LogResult<std::sync::RwLockReadGuard<'_, std::collections::HashMap<String, Vec<u8>>>>
    {
        self.files
            .read()
            .map_err(|_| LogError::poisoned("memory directory"))
    }
}

impl Directory for MemoryDirectory {
    fn create_file(&self, path: &str) -> LogResult<Box<dyn Write + Send>> {
        // Overwrite semantics: clear the file eagerly, then append in-place.
        self.write_files()?.insert(path.to_string(), Vec::new());
        Ok(Box::new(MemoryInPlaceWriter {
            files: self.files.clone(),
            path: path.to_string(),
        }))
    }

    fn open_file(&self, path: &str) -> LogResult<Box<dyn Read>> {
        let data = self
            .read_files()?
            .get(path)
            .ok_or_else(|| LogError::NotFound(path.to_string()))?
            .clone();
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn open_file_at(&self, path: &str, offset: u64) -> LogResult<Box<dyn Read>> {
        let files = self.read_files()?;
        let data = files
            .get(path)
            .ok_or_else(|| LogError::NotFound(path.to_string()))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        Ok(Box::new(std::io::Cursor::new(data[start..].to_vec())))
    }

    fn exists(&self, path: &str) -> bool {
        self.files
            .read()
            .map(|f| f.contains_key(path))
            .unwrap_or(false)
    }

    fn delete(&self, path: &str) -> LogResult<()> {
        self.write_files()?.remove(path);
        Ok(())
    }

    fn atomic_rename(&self, from: &str, to: &str) -> LogResult<()> {
        let mut files = self.write_files()?;
        if let Some(data) = files.remove(from) {
            files.insert(to.to_string(), data);
        }
        Ok(())
    }

    fn create_dir_all(&self, _path: &str) -> LogResult<()> {
        Ok(())
    }

    fn list_dir(&self, path: &str) -> LogResult<Vec<String>> {
        let files = self.read_files()?;
        let prefix = if path.is_empty() {
            "".to_string()
        } else {
            format!("{path}/")
        };
        let mut result: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .map(|k| k.strip_prefix(&prefix).unwrap_or(k).to_string())
            .collect();
        result.sort();
        Ok(result)
    }

    fn append_file(&self, path: &str) -> LogResult<Box<dyn Write + Send>> {
        self.write_files()?
            .entry(path.to_string())
            .or_insert_with(Vec::new);
        Ok(Box::new(MemoryInPlaceWriter {
            files: self.files.clone(),
            path: path.to_string(),
        }))
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> LogResult<()> {
        self.write_files()?.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn file_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

struct MemoryInPlaceWriter {
    files: SharedFiles,
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
