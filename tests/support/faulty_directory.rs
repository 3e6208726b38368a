//! Filesystem-backed `Directory` wrapper with targeted fault injection.
//!
//! Important: this file lives under `tests/support/` so it is **not** compiled as a standalone
//! integration test target.

use std::io;
use std::sync::{Arc, Mutex};
use txnlog::storage::{Directory, FsDirectory};
use txnlog::LogResult;

/// Fault-injection configuration for segment-file operations.
#[derive(Default)]
pub struct FaultConfig {
    /// Fail when opening an append handle for segment files.
    pub fail_segment_append: bool,
    /// Hide `file_path()` for segment paths (simulates "cannot prove durability").
    pub hide_segment_file_path: bool,
    /// Fail when deleting segment files (during reclamation).
    pub fail_segment_delete: bool,
    /// Count of delete calls attempted against segment files.
    pub delete_calls: usize,
    /// Bytes that segment appends may still write before failing. `None` is unlimited.
    pub write_budget: Option<usize>,
    /// Point `file_path()` for segment paths at a missing file, so fsync fails.
    pub fail_segment_sync: bool,
}

/// A filesystem-backed `Directory` wrapper with targeted fault injection.
pub struct FaultyDirectory {
    inner: FsDirectory,
    cfg: Arc<Mutex<FaultConfig>>,
}

impl FaultyDirectory {
    /// Wrap an existing `FsDirectory`.
    pub fn new(inner: FsDirectory) -> Self {
        Self {
            inner,
            cfg: Arc::new(Mutex::new(FaultConfig::default())),
        }
    }

    /// Access the shared fault config (for toggling failpoints and reading counters).
    pub fn cfg(&self) -> Arc<Mutex<FaultConfig>> {
        self.cfg.clone()
    }

    fn is_segment_path(path: &str) -> bool {
        path.starts_with("log_")
    }
}

/// Append handle that consumes the shared write budget.
struct BudgetedWriter {
    inner: Box<dyn io::Write + Send>,
    cfg: Arc<Mutex<FaultConfig>>,
}

impl io::Write for BudgetedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut cfg = self.cfg.lock().unwrap();
        let n = match cfg.write_budget {
            None => buf.len(),
            Some(0) => return Err(io::Error::other("injected write failure")),
            Some(left) => left.min(buf.len()),
        };
        let n = self.inner.write(&buf[..n])?;
        if let Some(left) = cfg.write_budget.as_mut() {
            *left -= n;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Directory for FaultyDirectory {
    fn create_file(&self, path: &str) -> LogResult<Box<dyn io::Write + Send>> {
        self.inner.create_file(path)
    }

    fn open_file(&self, path: &str) -> LogResult<Box<dyn io::Read>> {
        self.inner.open_file(path)
    }

    fn open_file_at(&self, path: &str, offset: u64) -> LogResult<Box<dyn io::Read>> {
        self.inner.open_file_at(path, offset)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn delete(&self, path: &str) -> LogResult<()> {
        let mut cfg = self.cfg.lock().unwrap();
        if Self::is_segment_path(path) {
            cfg.delete_calls += 1;
            if cfg.fail_segment_delete {
                return Err(io::Error::other("injected delete failure").into());
            }
        }
        drop(cfg);
        self.inner.delete(path)
    }

    fn atomic_rename(&self, from: &str, to: &str) -> LogResult<()> {
        self.inner.atomic_rename(from, to)
    }

    fn create_dir_all(&self, path: &str) -> LogResult<()> {
        self.inner.create_dir_all(path)
    }

    fn list_dir(&self, path: &str) -> LogResult<Vec<String>> {
        self.inner.list_dir(path)
    }

    fn append_file(&self, path: &str) -> LogResult<Box<dyn io::Write + Send>> {
        let cfg = self.cfg.lock().unwrap();
        if cfg.fail_segment_append && Self::is_segment_path(path) {
            return Err(io::Error::other("injected append failure").into());
        }
        drop(cfg);
        let inner = self.inner.append_file(path)?;
        if !Self::is_segment_path(path) {
            return Ok(inner);
        }
        Ok(Box::new(BudgetedWriter {
            inner,
            cfg: self.cfg.clone(),
        }))
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> LogResult<()> {
        self.inner.atomic_write(path, data)
    }

    fn file_path(&self, path: &str) -> Option<std::path::PathBuf> {
        let cfg = self.cfg.lock().unwrap();
        if cfg.hide_segment_file_path && Self::is_segment_path(path) {
            return None;
        }
        let broken = cfg.fail_segment_sync && Self::is_segment_path(path);
        drop(cfg);
        let p = self.inner.file_path(path)?;
        Some(if broken { p.with_extension("missing") } else { p })
    }
}
