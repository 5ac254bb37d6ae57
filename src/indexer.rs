use crate::errors::{AppError, AppResult};
use crate::models::Record;
use crate::source::{is_hidden_below, is_markdown, TaskDataSource};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

struct CacheEntry {
    raw: String,
    record: Record,
}

/// Parses task files and remembers the last content seen per path, so unchanged
/// files are never parsed twice.
pub struct Indexer {
    source: Arc<dyn TaskDataSource>,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexDelta {
    pub updated: Vec<Record>,
    pub deleted: Vec<PathBuf>,
}

impl Indexer {
    pub fn new(source: Arc<dyn TaskDataSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn index_all<F>(&self, tasks_dir: &Path, mut progress: F) -> AppResult<Vec<Record>>
    where
        F: FnMut(usize, usize),
    {
        let paths = self.source.list_markdown(tasks_dir)?;
        let total = paths.len();
        let mut records = Vec::with_capacity(total);

        for (index, path) in paths.iter().enumerate() {
            match self.index_path(tasks_dir, path) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!(path = %path.to_string_lossy(), error = %error, "skipping unreadable task file");
                }
            }
            progress(index + 1, total);
        }

        let live: BTreeSet<&PathBuf> = paths.iter().collect();
        self.cache()?.retain(|path, _| live.contains(path));
        Ok(records)
    }

    /// Re-reads just `paths`. Paths that no longer exist (or were never task files) are
    /// reported as deleted when the cache knew them.
    pub fn index_changed(&self, tasks_dir: &Path, paths: &[PathBuf]) -> AppResult<IndexDelta> {
        let mut delta = IndexDelta::default();
        let unique: BTreeSet<&PathBuf> = paths.iter().collect();

        for path in unique {
            let eligible = path.starts_with(tasks_dir) && is_markdown(path) && !is_hidden_below(tasks_dir, path);
            if eligible && self.source.exists(path) {
                match self.index_path(tasks_dir, path) {
                    Ok(record) => {
                        delta.updated.push(record);
                        continue;
                    }
                    Err(error) => {
                        tracing::warn!(path = %path.to_string_lossy(), error = %error, "changed task file unreadable");
                    }
                }
            }
            if self.cache()?.remove(path).is_some() || eligible {
                delta.deleted.push(path.clone());
            }
        }
        Ok(delta)
    }

    /// Drops the cached entry for `path`, forcing the next index to re-parse it.
    pub fn forget(&self, path: &Path) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(path);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    fn index_path(&self, tasks_dir: &Path, path: &Path) -> AppResult<Record> {
        let raw = self.source.read(path)?;
        if let Some(entry) = self.cache()?.get(path) {
            if entry.raw == raw {
                return Ok(entry.record.clone());
            }
        }
        let record = Record::from_file(tasks_dir, path, &raw, Utc::now());
        self.cache()?.insert(
            path.to_path_buf(),
            CacheEntry {
                raw,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    fn cache(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<PathBuf, CacheEntry>>> {
        self.cache
            .lock()
            .map_err(|_| AppError::Internal("indexer cache lock poisoned".to_string()))
    }
}
