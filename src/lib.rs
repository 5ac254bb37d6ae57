pub mod codec;
pub mod config;
pub mod errors;
pub mod indexer;
pub mod materializer;
pub mod models;
pub mod query;
pub mod schema;
pub mod sort;
pub mod source;
pub mod status;
pub mod store;
pub mod watcher;

pub use crate::config::{StoreConfig, UnknownConditionPolicy};
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{NewRecord, Phase, Record, RecordPatch, ViewDefinition, ViewDraft};
pub use crate::schema::{FieldDefinition, FieldStyle, FieldType, SchemaRegistry, ValueCatalog};
pub use crate::source::{FsDataSource, MemoryDataSource, TaskDataSource};
pub use crate::status::{EngineState, EngineStatus};
pub use crate::store::{StoreSnapshot, SyncStore};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs JSON logging into a daily-rolling file under `<data_dir>/logs`.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing(data_dir: &Path) -> AppResult<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| AppError::Io(error.to_string()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "tasks-sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
