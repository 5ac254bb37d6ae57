//! Persistence backends. The store talks to disk only through [`TaskDataSource`],
//! so tests can swap the real filesystem for an in-memory map.

use crate::codec::MARKDOWN_EXTENSION;
use crate::errors::{AppError, AppResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;
use walkdir::WalkDir;

pub trait TaskDataSource: Send + Sync {
    /// All non-hidden markdown files under `dir`, recursively, sorted by path.
    fn list_markdown(&self, dir: &Path) -> AppResult<Vec<PathBuf>>;
    fn read(&self, path: &Path) -> AppResult<String>;
    fn write(&self, path: &Path, content: &str) -> AppResult<()>;
    /// Removing a file that does not exist is not an error.
    fn remove(&self, path: &Path) -> AppResult<()>;
    fn exists(&self, path: &Path) -> bool;
    fn ensure_dir(&self, dir: &Path) -> AppResult<()>;
    /// Whether paths from this source can be handed to a filesystem watcher.
    fn supports_watch(&self) -> bool;
}

pub fn is_markdown(path: &Path) -> bool {
    path.extension().and_then(|value| value.to_str()) == Some(MARKDOWN_EXTENSION)
}

/// True when any component of `path` below `dir` starts with a dot.
pub fn is_hidden_below(dir: &Path, path: &Path) -> bool {
    path.strip_prefix(dir)
        .unwrap_or(path)
        .components()
        .any(|component| component.as_os_str().to_string_lossy().starts_with('.'))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsDataSource;

impl FsDataSource {
    pub fn new() -> Self {
        Self
    }
}

impl TaskDataSource for FsDataSource {
    fn list_markdown(&self, dir: &Path) -> AppResult<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    tracing::warn!(dir = %dir.to_string_lossy(), error = %error, "skipping unreadable directory entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && is_markdown(entry.path()) {
                paths.push(entry.into_path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn read(&self, path: &Path) -> AppResult<String> {
        fs::read_to_string(path).map_err(|error| AppError::Io(format!("{}: {}", path.to_string_lossy(), error)))
    }

    /// Writes through a hidden temp file in the same directory and renames it into
    /// place, so readers never observe a half-written file.
    fn write(&self, path: &Path, content: &str) -> AppResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| AppError::Io(format!("{}: no parent directory", path.to_string_lossy())))?;
        fs::create_dir_all(parent).map_err(|error| AppError::Io(error.to_string()))?;
        let filename = path
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp = parent.join(format!(".{}.{}.tmp", filename, Uuid::new_v4().simple()));
        if let Err(error) = fs::write(&temp, content) {
            let _ = fs::remove_file(&temp);
            return Err(AppError::Io(format!("{}: {}", path.to_string_lossy(), error)));
        }
        fs::rename(&temp, path).map_err(|error| {
            let _ = fs::remove_file(&temp);
            AppError::Io(format!("{}: {}", path.to_string_lossy(), error))
        })
    }

    fn remove(&self, path: &Path) -> AppResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(AppError::Io(format!("{}: {}", path.to_string_lossy(), error))),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn ensure_dir(&self, dir: &Path) -> AppResult<()> {
        fs::create_dir_all(dir).map_err(|error| AppError::Io(error.to_string()))
    }

    fn supports_watch(&self) -> bool {
        true
    }
}

/// In-memory backend with write-failure injection and per-path write counters.
#[derive(Debug, Default)]
pub struct MemoryDataSource {
    files: Mutex<BTreeMap<PathBuf, String>>,
    writes: Mutex<BTreeMap<PathBuf, usize>>,
    fail_writes: AtomicBool,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `write` fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self, path: &Path) -> usize {
        self.writes
            .lock()
            .map(|writes| writes.get(path).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn files(&self) -> AppResult<std::sync::MutexGuard<'_, BTreeMap<PathBuf, String>>> {
        self.files
            .lock()
            .map_err(|_| AppError::Internal("memory data source lock poisoned".to_string()))
    }
}

impl TaskDataSource for MemoryDataSource {
    fn list_markdown(&self, dir: &Path) -> AppResult<Vec<PathBuf>> {
        Ok(self
            .files()?
            .keys()
            .filter(|path| path.starts_with(dir) && is_markdown(path) && !is_hidden_below(dir, path))
            .cloned()
            .collect())
    }

    fn read(&self, path: &Path) -> AppResult<String> {
        self.files()?
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::NotFound(path.to_string_lossy().to_string()))
    }

    fn write(&self, path: &Path, content: &str) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Io(format!("{}: simulated write failure", path.to_string_lossy())));
        }
        self.files()?.insert(path.to_path_buf(), content.to_string());
        if let Ok(mut writes) = self.writes.lock() {
            *writes.entry(path.to_path_buf()).or_insert(0) += 1;
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> AppResult<()> {
        self.files()?.remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files()
            .map(|files| files.contains_key(path))
            .unwrap_or(false)
    }

    fn ensure_dir(&self, _dir: &Path) -> AppResult<()> {
        Ok(())
    }

    fn supports_watch(&self) -> bool {
        false
    }
}
