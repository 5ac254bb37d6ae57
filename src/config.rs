use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = ".tasks-sync.json";

/// How the query filter treats a condition it cannot classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum UnknownConditionPolicy {
    /// The condition is a no-op and matches every record.
    #[default]
    MatchAll,
    /// The whole expression is rejected with `QUERY_INVALID`.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub tasks_dir: String,
    pub views_dir: String,
    pub schema_file: String,
    pub debounce_ms: u64,
    pub title_max_chars: usize,
    pub unknown_conditions: UnknownConditionPolicy,
    pub watch: bool,
    pub incremental_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tasks_dir: "tasks".to_string(),
            views_dir: "views".to_string(),
            schema_file: "schema.json".to_string(),
            debounce_ms: crate::watcher::DEFAULT_DEBOUNCE.as_millis() as u64,
            title_max_chars: crate::codec::DEFAULT_TITLE_MAX_CHARS,
            unknown_conditions: UnknownConditionPolicy::MatchAll,
            watch: true,
            incremental_threshold: 64,
        }
    }
}

impl StoreConfig {
    /// Reads `<root>/.tasks-sync.json`, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load(root: &Path) -> AppResult<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(&path).map_err(|error| AppError::Io(error.to_string()))?;
        let config = match serde_json::from_slice::<Self>(&bytes) {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(path = %path.to_string_lossy(), error = %error, "ignoring malformed store config");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.tasks_dir.trim().is_empty() || self.views_dir.trim().is_empty() {
            return Err(AppError::Validation("tasksDir and viewsDir must be non-empty".to_string()));
        }
        let tasks = Path::new(&self.tasks_dir);
        let views = Path::new(&self.views_dir);
        // Views are output only and must stay outside the watched tree.
        if views.starts_with(tasks) || tasks.starts_with(views) {
            return Err(AppError::Validation(format!(
                "viewsDir '{}' must not overlap tasksDir '{}'",
                self.views_dir, self.tasks_dir
            )));
        }
        if self.title_max_chars == 0 {
            return Err(AppError::Validation("titleMaxChars must be positive".to_string()));
        }
        Ok(())
    }

    pub fn tasks_path(&self, root: &Path) -> PathBuf {
        root.join(&self.tasks_dir)
    }

    pub fn views_path(&self, root: &Path) -> PathBuf {
        root.join(&self.views_dir)
    }

    pub fn schema_path(&self, root: &Path) -> PathBuf {
        root.join(&self.schema_file)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
