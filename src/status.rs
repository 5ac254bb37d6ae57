use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    #[default]
    Idle,
    Busy,
    Error,
}

/// What the engine is doing right now, published to any number of observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: EngineState,
    pub message: String,
    pub progress_current: usize,
    pub progress_total: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub last_error: Option<String>,
    pub warnings: Vec<String>,
    pub reconcile_count: u64,
}

pub struct StatusReporter {
    sender: watch::Sender<EngineStatus>,
    clock: std::sync::Mutex<Option<Instant>>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(EngineStatus::default());
        Self {
            sender,
            clock: std::sync::Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> EngineStatus {
        self.sender.borrow().clone()
    }

    pub fn begin(&self, message: impl Into<String>) {
        let message = message.into();
        if let Ok(mut clock) = self.clock.lock() {
            *clock = Some(Instant::now());
        }
        self.sender.send_modify(|status| {
            status.state = EngineState::Busy;
            status.message = message;
            status.progress_current = 0;
            status.progress_total = 0;
            status.started_at = Some(Utc::now());
            status.elapsed_ms = 0;
        });
    }

    pub fn progress(&self, current: usize, total: usize) {
        let elapsed_ms = self.elapsed_ms();
        self.sender.send_modify(|status| {
            status.progress_current = current;
            status.progress_total = total;
            status.elapsed_ms = elapsed_ms;
        });
    }

    pub fn finish(&self, message: impl Into<String>) {
        let message = message.into();
        let elapsed_ms = self.elapsed_ms();
        self.sender.send_modify(|status| {
            // An error stays visible until it is cleared.
            status.state = if status.last_error.is_some() {
                EngineState::Error
            } else {
                EngineState::Idle
            };
            status.message = message;
            status.elapsed_ms = elapsed_ms;
        });
    }

    pub fn fail(&self, error: impl std::fmt::Display) {
        let text = error.to_string();
        let elapsed_ms = self.elapsed_ms();
        self.sender.send_modify(|status| {
            status.state = EngineState::Error;
            status.message = text.clone();
            status.last_error = Some(text);
            status.elapsed_ms = elapsed_ms;
        });
    }

    /// Forgets the last error. A busy engine stays busy.
    pub fn clear_error(&self) {
        self.sender.send_if_modified(|status| {
            if status.state != EngineState::Error && status.last_error.is_none() {
                return false;
            }
            if status.state == EngineState::Error {
                status.state = EngineState::Idle;
            }
            status.last_error = None;
            true
        });
    }

    pub fn set_warnings(&self, warnings: Vec<String>) {
        self.sender.send_modify(|status| status.warnings = warnings);
    }

    pub fn record_reconcile(&self) {
        self.sender.send_modify(|status| status.reconcile_count += 1);
    }

    fn elapsed_ms(&self) -> u64 {
        self.clock
            .lock()
            .ok()
            .and_then(|clock| *clock)
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_between_busy_idle_and_error() {
        let reporter = StatusReporter::new();
        let receiver = reporter.subscribe();

        reporter.begin("Indexing tasks");
        reporter.progress(3, 10);
        let busy = receiver.borrow().clone();
        assert_eq!(busy.state, EngineState::Busy);
        assert_eq!((busy.progress_current, busy.progress_total), (3, 10));
        assert!(busy.started_at.is_some());

        reporter.finish("Indexed 10 tasks");
        assert_eq!(reporter.current().state, EngineState::Idle);

        reporter.fail("IO_FAILURE: disk full");
        reporter.finish("Materialized views");
        let failed = reporter.current();
        assert_eq!(failed.state, EngineState::Error);
        assert_eq!(failed.last_error.as_deref(), Some("IO_FAILURE: disk full"));

        reporter.clear_error();
        assert_eq!(reporter.current().state, EngineState::Idle);
    }

    #[test]
    fn reconcile_counter_and_warnings_are_published() {
        let reporter = StatusReporter::new();
        reporter.record_reconcile();
        reporter.record_reconcile();
        reporter.set_warnings(vec!["Unknown sort field 'x'".to_string()]);
        let status = reporter.current();
        assert_eq!(status.reconcile_count, 2);
        assert_eq!(status.warnings.len(), 1);
    }
}
