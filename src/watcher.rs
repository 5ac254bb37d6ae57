//! Directory subscriptions with burst coalescing.
//!
//! The `notify` backend delivers raw events on its own thread; they are forwarded
//! into a channel drained by one tokio task per watched directory. Every event
//! restarts that directory's quiet window, and the callback fires once per burst
//! with the set of paths touched during it.

use crate::errors::{AppError, AppResult};
use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBatch {
    pub root: PathBuf,
    pub paths: BTreeSet<PathBuf>,
}

pub type ChangeCallback = Arc<dyn Fn(WatchBatch) + Send + Sync>;

struct Subscription {
    _watcher: RecommendedWatcher,
    debounce: JoinHandle<()>,
}

pub struct DirectoryWatcher {
    window: Duration,
    subscriptions: Mutex<HashMap<PathBuf, Subscription>>,
}

impl DirectoryWatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Starts watching `path` recursively. Must be called from within a tokio runtime.
    /// Watching an already watched path replaces its subscription.
    pub fn watch(&self, path: &Path, on_change: ChangeCallback) -> AppResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| AppError::Internal(format!("watcher needs a tokio runtime: {}", error)))?;

        let (sender, receiver) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) if is_relevant(&event.kind) => {
                    for path in event.paths {
                        let _ = sender.send(path);
                    }
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "filesystem watcher error");
                }
            },
            Config::default(),
        )?;
        watcher.watch(path, RecursiveMode::Recursive)?;

        let debounce = runtime.spawn(debounce_loop(path.to_path_buf(), receiver, self.window, on_change));
        let previous = self.subscriptions()?.insert(
            path.to_path_buf(),
            Subscription {
                _watcher: watcher,
                debounce,
            },
        );
        if let Some(previous) = previous {
            previous.debounce.abort();
        }
        tracing::debug!(path = %path.to_string_lossy(), window_ms = self.window.as_millis() as u64, "watching directory");
        Ok(())
    }

    /// Cancels the subscription and any pending burst for `path`.
    pub fn stop_watching(&self, path: &Path) -> bool {
        let removed = self
            .subscriptions
            .lock()
            .ok()
            .and_then(|mut subscriptions| subscriptions.remove(path));
        match removed {
            Some(subscription) => {
                subscription.debounce.abort();
                tracing::debug!(path = %path.to_string_lossy(), "stopped watching directory");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained = self
            .subscriptions
            .lock()
            .map(|mut subscriptions| subscriptions.drain().collect::<Vec<_>>())
            .unwrap_or_default();
        for (_, subscription) in drained {
            subscription.debounce.abort();
        }
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.subscriptions
            .lock()
            .map(|subscriptions| subscriptions.contains_key(path))
            .unwrap_or(false)
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        let mut paths = self
            .subscriptions
            .lock()
            .map(|subscriptions| subscriptions.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    fn subscriptions(&self) -> AppResult<std::sync::MutexGuard<'_, HashMap<PathBuf, Subscription>>> {
        self.subscriptions
            .lock()
            .map_err(|_| AppError::Internal("watcher registry lock poisoned".to_string()))
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Any => true,
        // Reads by the indexer must not look like changes.
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) => true,
        _ => false,
    }
}

/// Collects paths until `window` passes without a new one, then delivers the batch.
/// A closed channel ends the loop without delivering the unfinished burst.
pub async fn debounce_loop(
    root: PathBuf,
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    window: Duration,
    on_change: ChangeCallback,
) {
    loop {
        let Some(first) = events.recv().await else {
            return;
        };
        let mut paths = BTreeSet::from([first]);
        loop {
            match tokio::time::timeout(window, events.recv()).await {
                Ok(Some(path)) => {
                    paths.insert(path);
                }
                Ok(None) => return,
                Err(_) => break,
            }
        }
        tracing::debug!(root = %root.to_string_lossy(), count = paths.len(), "coalesced filesystem burst");
        on_change(WatchBatch {
            root: root.clone(),
            paths,
        });
    }
}
