//! The synchronization store.
//!
//! Authoritative state lives in a `watch` channel holding an immutable
//! [`StoreSnapshot`]. Mutations replace the snapshot optimistically and queue their
//! file I/O; a single worker task drains that queue in order, so writes, view
//! materialization and reconciles against disk never overlap.

use crate::codec;
use crate::config::StoreConfig;
use crate::errors::{AppError, AppResult};
use crate::indexer::{IndexDelta, Indexer};
use crate::materializer::{MaterializeReport, ViewMaterializer};
use crate::models::{NewRecord, Record, RecordPatch, ViewDefinition, ViewDraft, MANAGED_KEYS};
use crate::query::{self, Query};
use crate::schema::{self, SchemaRegistry, ValueCatalog};
use crate::sort;
use crate::source::{is_hidden_below, is_markdown, FsDataSource, TaskDataSource};
use crate::status::{EngineStatus, StatusReporter};
use crate::watcher::{ChangeCallback, DirectoryWatcher, WatchBatch};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot, watch};

/// Everything a reader can see at one instant. Records are ordered by id, views by path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub records: Vec<Record>,
    pub views: Vec<ViewDefinition>,
    pub schema: SchemaRegistry,
    pub catalogs: BTreeMap<String, ValueCatalog>,
}

impl StoreSnapshot {
    pub fn record(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn view(&self, id: &str) -> Option<&ViewDefinition> {
        self.views.iter().find(|view| view.id == id)
    }

    fn with_records(&self, mut records: Vec<Record>) -> Self {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            catalogs: self.schema.catalogs(&records),
            records,
            views: self.views.clone(),
            schema: self.schema.clone(),
        }
    }

    fn with_views(&self, mut views: Vec<ViewDefinition>) -> Self {
        views.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            views,
            ..self.clone()
        }
    }

    fn with_schema(&self, schema: SchemaRegistry) -> Self {
        Self {
            catalogs: schema.catalogs(&self.records),
            schema,
            ..self.clone()
        }
    }
}

enum MaterializeScope {
    All,
    Affected(Vec<Record>),
    View(String),
}

enum Job {
    WriteRecord { path: PathBuf, content: String },
    /// The old file is removed only once the new one is on disk.
    RenameRecord { from: PathBuf, to: PathBuf, content: String },
    RemoveRecord { path: PathBuf },
    Materialize(MaterializeScope),
    RenameView { id: String, from: PathBuf },
    RemoveView { path: PathBuf },
    WriteSchema(SchemaRegistry),
    Reconcile,
    Flush(oneshot::Sender<()>),
}

impl Job {
    fn writes_tasks(&self) -> bool {
        matches!(
            self,
            Self::WriteRecord { .. } | Self::RenameRecord { .. } | Self::RemoveRecord { .. }
        )
    }
}

struct Mutation<T> {
    snapshot: Option<StoreSnapshot>,
    jobs: Vec<Job>,
    value: T,
}

impl<T> Mutation<T> {
    fn unchanged(value: T) -> Self {
        Self {
            snapshot: None,
            jobs: Vec::new(),
            value,
        }
    }
}

enum DiskScan {
    Full(Vec<Record>),
    Changed(IndexDelta),
}

impl DiskScan {
    fn apply(&self, current: &[Record]) -> Vec<Record> {
        match self {
            Self::Full(records) => {
                let mut records = records.clone();
                records.sort_by(|a, b| a.id.cmp(&b.id));
                records
            }
            Self::Changed(delta) => {
                let mut by_id = current
                    .iter()
                    .filter(|record| !delta.deleted.contains(&record.path))
                    .map(|record| (record.id.clone(), record.clone()))
                    .collect::<BTreeMap<_, _>>();
                for record in &delta.updated {
                    by_id.insert(record.id.clone(), record.clone());
                }
                by_id.into_values().collect()
            }
        }
    }
}

/// Old and new versions of every record that differs between the two sets.
fn changed_records(before: &[Record], after: &[Record]) -> Vec<Record> {
    let before_by_id = before.iter().map(|record| (record.id.as_str(), record)).collect::<HashMap<_, _>>();
    let after_by_id = after.iter().map(|record| (record.id.as_str(), record)).collect::<HashMap<_, _>>();
    let mut changed = Vec::new();
    for record in before {
        if after_by_id.get(record.id.as_str()) != Some(&record) {
            changed.push(record.clone());
        }
    }
    for record in after {
        if before_by_id.get(record.id.as_str()) != Some(&record) {
            changed.push(record.clone());
        }
    }
    changed
}

fn checked_field_key(key: &str) -> AppResult<&str> {
    let key = key.trim();
    if key.is_empty() || key.contains(':') || key.contains(['\n', '\r']) {
        return Err(AppError::Validation(format!("invalid field name '{}'", key)));
    }
    if MANAGED_KEYS.contains(&key) || schema::is_protected(key) {
        return Err(AppError::Validation(format!(
            "field '{}' is managed by the store and cannot be set directly",
            key
        )));
    }
    Ok(key)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

struct Inner {
    root: PathBuf,
    config: StoreConfig,
    tasks_dir: PathBuf,
    views_dir: PathBuf,
    schema_path: PathBuf,
    source: Arc<dyn TaskDataSource>,
    indexer: Indexer,
    materializer: ViewMaterializer,
    watcher: DirectoryWatcher,
    state: watch::Sender<Arc<StoreSnapshot>>,
    status: StatusReporter,
    jobs: mpsc::UnboundedSender<Job>,
    pending_paths: Mutex<BTreeSet<PathBuf>>,
    full_reconcile: AtomicBool,
    reconcile_queued: AtomicBool,
    // Bumped by every local mutation; a reconcile that saw it move is stale.
    generation: AtomicU64,
    // Task file jobs queued but not yet run. Disk lags memory while this is non-zero.
    queued_task_writes: AtomicUsize,
}

#[derive(Clone)]
pub struct SyncStore {
    inner: Arc<Inner>,
}

impl SyncStore {
    /// Opens `root` on the real filesystem with the configuration found there.
    pub async fn open(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root = root.into();
        let config = StoreConfig::load(&root)?;
        Self::load_all(root, config, Arc::new(FsDataSource::new())).await
    }

    /// Indexes every task, loads views and schema, publishes the first snapshot,
    /// materializes all views and starts watching the tasks directory.
    pub async fn load_all(
        root: impl Into<PathBuf>,
        config: StoreConfig,
        source: Arc<dyn TaskDataSource>,
    ) -> AppResult<Self> {
        config.validate()?;
        let root = root.into();
        let (jobs, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(Arc::new(StoreSnapshot::default()));
        let inner = Arc::new(Inner {
            tasks_dir: config.tasks_path(&root),
            views_dir: config.views_path(&root),
            schema_path: config.schema_path(&root),
            indexer: Indexer::new(source.clone()),
            materializer: ViewMaterializer::new(source.clone(), config.unknown_conditions),
            watcher: DirectoryWatcher::new(config.debounce()),
            source,
            root,
            config,
            state,
            status: StatusReporter::new(),
            jobs,
            pending_paths: Mutex::new(BTreeSet::new()),
            full_reconcile: AtomicBool::new(false),
            reconcile_queued: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            queued_task_writes: AtomicUsize::new(0),
        });
        tokio::spawn(run_worker(Arc::downgrade(&inner), receiver));

        inner.status.begin("Loading tasks");
        let loader = inner.clone();
        let loaded = blocking(move || loader.read_everything()).await;
        let (records, views, schema) = match loaded {
            Ok(loaded) => loaded,
            Err(error) => {
                tracing::warn!(root = %inner.root.to_string_lossy(), error = %error, "store load failed");
                inner.status.fail(&error);
                return Err(error);
            }
        };
        let snapshot = StoreSnapshot {
            catalogs: schema.catalogs(&records),
            records,
            views,
            schema,
        };
        tracing::info!(
            root = %inner.root.to_string_lossy(),
            records = snapshot.records.len(),
            views = snapshot.views.len(),
            "store loaded"
        );
        inner.state.send_replace(Arc::new(snapshot));

        inner.materialize(MaterializeScope::All).await;

        if inner.config.watch && inner.source.supports_watch() {
            inner.start_watching()?;
        }
        let count = inner.state.borrow().records.len();
        inner.status.finish(format!("Loaded {} tasks", count));
        Ok(Self { inner })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.inner.state.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.inner.state.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.subscribe()
    }

    pub fn record(&self, id: &str) -> Option<Record> {
        self.inner.state.borrow().record(id).cloned()
    }

    pub fn view(&self, id: &str) -> Option<ViewDefinition> {
        self.inner.state.borrow().view(id).cloned()
    }

    pub fn is_watching(&self) -> bool {
        self.inner.watcher.is_watching(&self.inner.tasks_dir)
    }

    /// Cancels the directory subscription and drops any burst still being debounced.
    pub fn stop_watching(&self) -> bool {
        self.inner.watcher.stop_watching(&self.inner.tasks_dir)
    }

    /// Ad-hoc filter and sort over the current records.
    pub fn query_records<S: AsRef<str>>(&self, expression: &str, sort_by: &[S]) -> AppResult<Vec<Record>> {
        let snapshot = self.snapshot();
        let mut records = Query::parse(expression, self.inner.config.unknown_conditions)?.filter(&snapshot.records);
        sort::sort_records(&mut records, sort_by);
        Ok(records)
    }

    /// Advisory problems with a view's query and sort, also published as status warnings.
    pub fn check_view(&self, id: &str) -> AppResult<Vec<String>> {
        let snapshot = self.snapshot();
        let view = snapshot
            .view(id)
            .ok_or_else(|| AppError::NotFound(format!("view '{}'", id)))?;
        let mut warnings = Vec::new();
        if let Err(error) = query::validate(&view.query) {
            warnings.push(error.to_string());
        }
        let matching = Query::parse(&view.query, self.inner.config.unknown_conditions)
            .map(|query| query.filter(&snapshot.records))
            .unwrap_or_default();
        warnings.extend(sort::validate(&matching, &view.sort));
        self.inner.status.set_warnings(warnings.clone());
        Ok(warnings)
    }

    pub fn create_record(&self, draft: NewRecord) -> AppResult<Record> {
        let inner = &self.inner;
        self.mutate("create task", |snapshot| {
            let fields = draft
                .fields
                .iter()
                .map(|(key, value)| checked_field_key(key).map(|key| (key.to_string(), value.clone())))
                .collect::<AppResult<Vec<_>>>()?;
            let filename = codec::filename_from_title_capped(&draft.title, inner.config.title_max_chars);
            let path = inner.tasks_dir.join(filename);
            inner.ensure_record_path_free(snapshot, &path)?;

            let cleaned = NewRecord {
                status: draft.status.as_deref().map(codec::flatten_line_breaks),
                fields: BTreeMap::new(),
                ..draft.clone()
            };
            let record = fields
                .iter()
                .fold(Record::create(&inner.tasks_dir, &path, &cleaned, Utc::now()), |record, (key, value)| {
                    record.with_field(key, Some(value.as_str()))
                });

            let mut records = snapshot.records.clone();
            records.push(record.clone());
            Ok(Mutation {
                snapshot: Some(snapshot.with_records(records)),
                jobs: vec![
                    Job::WriteRecord {
                        path: record.path.clone(),
                        content: record.to_file_content(),
                    },
                    Job::Materialize(MaterializeScope::Affected(vec![record.clone()])),
                ],
                value: record,
            })
        })
    }

    pub fn update_record(&self, id: &str, patch: RecordPatch) -> AppResult<Record> {
        let inner = &self.inner;
        self.mutate("update task", |snapshot| {
            let current = snapshot
                .record(id)
                .ok_or_else(|| AppError::NotFound(format!("task '{}'", id)))?;
            let mut next = current.clone();
            if let Some(status) = &patch.status {
                next = next.with_status(&codec::flatten_line_breaks(status), Utc::now());
            }
            if let Some(tags) = &patch.tags {
                next = next.with_tags(tags.clone());
            }
            if let Some(content) = &patch.content {
                next = next.with_content(content.clone());
            }
            for (key, value) in &patch.fields {
                next = next.with_field(checked_field_key(key)?, value.as_deref());
            }
            if let Some(title) = &patch.title {
                let filename = codec::filename_from_title_capped(title, inner.config.title_max_chars);
                let target = current
                    .path
                    .parent()
                    .unwrap_or(inner.tasks_dir.as_path())
                    .join(filename);
                if target != current.path {
                    inner.ensure_record_path_free(snapshot, &target)?;
                    next = next.with_path(&inner.tasks_dir, &target);
                }
            }
            if &next == current {
                return Ok(Mutation::unchanged(next));
            }

            let write = if next.path != current.path {
                Job::RenameRecord {
                    from: current.path.clone(),
                    to: next.path.clone(),
                    content: next.to_file_content(),
                }
            } else {
                Job::WriteRecord {
                    path: next.path.clone(),
                    content: next.to_file_content(),
                }
            };
            let records = snapshot
                .records
                .iter()
                .filter(|record| record.id != current.id)
                .cloned()
                .chain(std::iter::once(next.clone()))
                .collect();
            Ok(Mutation {
                snapshot: Some(snapshot.with_records(records)),
                jobs: vec![
                    write,
                    Job::Materialize(MaterializeScope::Affected(vec![current.clone(), next.clone()])),
                ],
                value: next,
            })
        })
    }

    pub fn delete_record(&self, id: &str) -> AppResult<()> {
        self.mutate("delete task", |snapshot| {
            let current = snapshot
                .record(id)
                .ok_or_else(|| AppError::NotFound(format!("task '{}'", id)))?;
            let records = snapshot
                .records
                .iter()
                .filter(|record| record.id != current.id)
                .cloned()
                .collect();
            Ok(Mutation {
                snapshot: Some(snapshot.with_records(records)),
                jobs: vec![
                    Job::RemoveRecord {
                        path: current.path.clone(),
                    },
                    Job::Materialize(MaterializeScope::Affected(vec![current.clone()])),
                ],
                value: (),
            })
        })
    }

    pub fn create_view(&self, draft: ViewDraft) -> AppResult<ViewDefinition> {
        let inner = &self.inner;
        self.mutate("create view", |snapshot| {
            inner.validate_view_draft(&draft)?;
            let filename = codec::filename_from_title_capped(&draft.name, inner.config.title_max_chars);
            let path = inner.views_dir.join(filename);
            inner.ensure_view_path_free(snapshot, &path)?;

            let view = ViewDefinition::new(path, &draft);
            let mut views = snapshot.views.clone();
            views.push(view.clone());
            Ok(Mutation {
                snapshot: Some(snapshot.with_views(views)),
                jobs: vec![Job::Materialize(MaterializeScope::View(view.id.clone()))],
                value: view,
            })
        })
    }

    pub fn save_view(&self, id: &str, draft: ViewDraft) -> AppResult<ViewDefinition> {
        let inner = &self.inner;
        self.mutate("save view", |snapshot| {
            let current = snapshot
                .view(id)
                .ok_or_else(|| AppError::NotFound(format!("view '{}'", id)))?;
            if current.system {
                return Err(AppError::Validation(format!("view '{}' is a system view", current.name)));
            }
            inner.validate_view_draft(&draft)?;
            let filename = codec::filename_from_title_capped(&draft.name, inner.config.title_max_chars);
            let target = current
                .path
                .parent()
                .unwrap_or(inner.views_dir.as_path())
                .join(filename);
            if target != current.path {
                inner.ensure_view_path_free(snapshot, &target)?;
            }

            let next = ViewDefinition::new(target, &draft);
            if &next == current {
                return Ok(Mutation::unchanged(next));
            }
            let job = if next.path != current.path {
                Job::RenameView {
                    id: next.id.clone(),
                    from: current.path.clone(),
                }
            } else {
                Job::Materialize(MaterializeScope::View(next.id.clone()))
            };
            let views = snapshot
                .views
                .iter()
                .filter(|view| view.id != current.id)
                .cloned()
                .chain(std::iter::once(next.clone()))
                .collect();
            Ok(Mutation {
                snapshot: Some(snapshot.with_views(views)),
                jobs: vec![job],
                value: next,
            })
        })
    }

    pub fn delete_view(&self, id: &str) -> AppResult<()> {
        self.mutate("delete view", |snapshot| {
            let current = snapshot
                .view(id)
                .ok_or_else(|| AppError::NotFound(format!("view '{}'", id)))?;
            if current.system {
                return Err(AppError::Validation(format!("view '{}' is a system view", current.name)));
            }
            let views = snapshot
                .views
                .iter()
                .filter(|view| view.id != current.id)
                .cloned()
                .collect();
            Ok(Mutation {
                snapshot: Some(snapshot.with_views(views)),
                jobs: vec![Job::RemoveView {
                    path: current.path.clone(),
                }],
                value: (),
            })
        })
    }

    /// Replaces the schema. Protected names are stripped and the status defaults
    /// restored before it is published and persisted.
    pub fn save_schema(&self, mut schema: SchemaRegistry) -> AppResult<SchemaRegistry> {
        schema.heal();
        self.mutate("save schema", |snapshot| {
            if snapshot.schema == schema {
                return Ok(Mutation::unchanged(schema.clone()));
            }
            Ok(Mutation {
                snapshot: Some(snapshot.with_schema(schema.clone())),
                jobs: vec![
                    Job::WriteSchema(schema.clone()),
                    Job::Materialize(MaterializeScope::All),
                ],
                value: schema.clone(),
            })
        })
    }

    /// Feeds changed paths to the reconciler as if the watcher had reported them.
    /// An empty list asks for a full re-index.
    pub fn request_reconcile(&self, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            self.inner.full_reconcile.store(true, Ordering::SeqCst);
        }
        self.inner.enqueue_paths(paths);
    }

    /// Resolves once every job queued before the call has run.
    pub async fn flush(&self) -> AppResult<()> {
        let (sender, receiver) = oneshot::channel();
        self.inner.send(Job::Flush(sender))?;
        receiver
            .await
            .map_err(|_| AppError::Internal("store worker stopped".to_string()))
    }

    /// Applies `apply` to the current snapshot under the state lock. On success the
    /// new snapshot is published and its jobs queued before the lock is released, so
    /// queued I/O follows the order in which mutations became visible.
    fn mutate<T, F>(&self, operation: &str, apply: F) -> AppResult<T>
    where
        F: FnOnce(&StoreSnapshot) -> AppResult<Mutation<T>>,
    {
        let inner = &self.inner;
        let mut outcome = None;
        inner.state.send_if_modified(|current| match apply(current.as_ref()) {
            Ok(mutation) => {
                let changed = match mutation.snapshot {
                    Some(next) => {
                        inner.generation.fetch_add(1, Ordering::SeqCst);
                        *current = Arc::new(next);
                        true
                    }
                    None => false,
                };
                for job in mutation.jobs {
                    let writes_tasks = job.writes_tasks();
                    if writes_tasks {
                        inner.queued_task_writes.fetch_add(1, Ordering::SeqCst);
                    }
                    if let Err(error) = inner.send(job) {
                        if writes_tasks {
                            inner.queued_task_writes.fetch_sub(1, Ordering::SeqCst);
                        }
                        tracing::warn!(error = %error, "dropping queued store job");
                    }
                }
                outcome = Some(Ok(mutation.value));
                changed
            }
            Err(error) => {
                outcome = Some(Err(error));
                false
            }
        });

        match outcome {
            Some(Ok(value)) => {
                inner.status.clear_error();
                Ok(value)
            }
            Some(Err(error)) => {
                tracing::warn!(operation = %operation, error = %error, "store mutation rejected");
                inner.status.fail(&error);
                Err(error)
            }
            None => Err(AppError::Internal(format!("{} did not run", operation))),
        }
    }
}

async fn blocking<T, F>(task: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await?
}

async fn run_worker(inner: Weak<Inner>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.run_job(job).await;
    }
    tracing::debug!("store worker stopped");
}

impl Inner {
    fn send(&self, job: Job) -> AppResult<()> {
        self.jobs
            .send(job)
            .map_err(|_| AppError::Internal("store worker stopped".to_string()))
    }

    fn start_watching(self: &Arc<Self>) -> AppResult<()> {
        if self.tasks_dir.starts_with(&self.views_dir) {
            return Err(AppError::Validation(format!(
                "refusing to watch '{}' inside the views directory",
                self.tasks_dir.to_string_lossy()
            )));
        }
        let store = Arc::downgrade(self);
        let on_change: ChangeCallback = Arc::new(move |batch: WatchBatch| {
            if let Some(inner) = store.upgrade() {
                inner.enqueue_paths(batch.paths);
            }
        });
        self.watcher.watch(&self.tasks_dir, on_change)
    }

    fn enqueue_paths<I: IntoIterator<Item = PathBuf>>(&self, paths: I) {
        match self.pending_paths.lock() {
            Ok(mut pending) => pending.extend(paths),
            Err(_) => self.full_reconcile.store(true, Ordering::SeqCst),
        }
        // One queued reconcile absorbs every trigger that arrives before it runs.
        if !self.reconcile_queued.swap(true, Ordering::SeqCst) {
            if let Err(error) = self.send(Job::Reconcile) {
                tracing::warn!(error = %error, "could not queue reconcile");
            }
        }
    }

    fn read_everything(&self) -> AppResult<(Vec<Record>, Vec<ViewDefinition>, SchemaRegistry)> {
        self.source.ensure_dir(&self.tasks_dir)?;
        self.source.ensure_dir(&self.views_dir)?;
        let mut records = self
            .indexer
            .index_all(&self.tasks_dir, |current, total| self.status.progress(current, total))?;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let views = self.read_views()?;
        let schema = SchemaRegistry::load(self.source.as_ref(), &self.schema_path)?;
        Ok((records, views, schema))
    }

    fn read_views(&self) -> AppResult<Vec<ViewDefinition>> {
        let mut views = Vec::new();
        for path in self.source.list_markdown(&self.views_dir)? {
            let raw = match self.source.read(&path) {
                Ok(raw) => raw,
                Err(error) => {
                    tracing::warn!(path = %path.to_string_lossy(), error = %error, "skipping unreadable view file");
                    continue;
                }
            };
            match ViewDefinition::from_file(&path, &raw) {
                Some(view) => views.push(view),
                None => {
                    tracing::warn!(path = %path.to_string_lossy(), "file in views directory is not a view definition");
                }
            }
        }
        views.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(views)
    }

    fn validate_view_draft(&self, draft: &ViewDraft) -> AppResult<()> {
        if draft.name.trim().is_empty() {
            return Err(AppError::Validation("view name must not be empty".to_string()));
        }
        query::validate(&draft.query)?;
        Query::parse(&draft.query, self.config.unknown_conditions)?;
        let problems = sort::validate_descriptors(&draft.sort);
        if !problems.is_empty() {
            return Err(AppError::Validation(problems.join("; ")));
        }
        Ok(())
    }

    fn ensure_record_path_free(&self, snapshot: &StoreSnapshot, path: &Path) -> AppResult<()> {
        let filename = path.file_name();
        let taken = snapshot.records.iter().any(|record| record.path == path) || self.source.exists(path);
        let shadows_view = snapshot.views.iter().any(|view| view.path.file_name() == filename)
            || filename
                .map(|name| self.source.exists(&self.views_dir.join(name)))
                .unwrap_or(false);
        if taken || shadows_view {
            return Err(AppError::Conflict(format!("'{}' already exists", display_name(path))));
        }
        Ok(())
    }

    fn ensure_view_path_free(&self, snapshot: &StoreSnapshot, path: &Path) -> AppResult<()> {
        let filename = path.file_name();
        let taken = snapshot.views.iter().any(|view| view.path == path) || self.source.exists(path);
        let shadows_task = snapshot.records.iter().any(|record| record.path.file_name() == filename)
            || filename
                .map(|name| self.source.exists(&self.tasks_dir.join(name)))
                .unwrap_or(false);
        if taken || shadows_task {
            return Err(AppError::Conflict(format!("'{}' already exists", display_name(path))));
        }
        Ok(())
    }

    async fn run_job(self: &Arc<Self>, job: Job) {
        let writes_tasks = job.writes_tasks();
        match job {
            Job::WriteRecord { path, content } => {
                let inner = self.clone();
                let target = path.clone();
                if let Err(error) = blocking(move || inner.source.write(&target, &content)).await {
                    self.io_failed(vec![path], error);
                }
            }
            Job::RenameRecord { from, to, content } => {
                let inner = self.clone();
                let (old, new) = (from.clone(), to.clone());
                let moved = blocking(move || {
                    inner.source.write(&new, &content)?;
                    inner.source.remove(&old)
                })
                .await;
                if let Err(error) = moved {
                    self.io_failed(vec![from, to], error);
                }
            }
            Job::RemoveRecord { path } => {
                let inner = self.clone();
                let target = path.clone();
                if let Err(error) = blocking(move || inner.source.remove(&target)).await {
                    self.io_failed(vec![path], error);
                }
            }
            Job::Materialize(scope) => self.materialize(scope).await,
            Job::RenameView { id, from } => {
                let inner = self.clone();
                let snapshot = Arc::clone(&self.state.borrow());
                let moved = blocking(move || {
                    let Some(view) = snapshot.view(&id) else {
                        return Ok(());
                    };
                    inner
                        .materializer
                        .materialize(view, &snapshot.records, &snapshot.schema)?;
                    inner.source.remove(&from)?;
                    inner.materializer.forget(&from);
                    Ok(())
                })
                .await;
                if let Err(error) = moved {
                    tracing::warn!(error = %error, "view rename failed");
                    self.status.fail(&error);
                }
            }
            Job::RemoveView { path } => {
                let inner = self.clone();
                let removed = blocking(move || {
                    inner.source.remove(&path)?;
                    inner.materializer.forget(&path);
                    Ok(())
                })
                .await;
                if let Err(error) = removed {
                    tracing::warn!(error = %error, "view delete failed");
                    self.status.fail(&error);
                }
            }
            Job::WriteSchema(schema) => {
                let inner = self.clone();
                if let Err(error) = blocking(move || schema.save(inner.source.as_ref(), &inner.schema_path)).await {
                    tracing::warn!(path = %self.schema_path.to_string_lossy(), error = %error, "schema write failed");
                    self.status.fail(&error);
                }
            }
            Job::Reconcile => self.reconcile().await,
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
        if writes_tasks {
            self.queued_task_writes.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// A failed write leaves memory ahead of disk; re-reading the touched paths
    /// brings it back in line.
    fn io_failed(&self, paths: Vec<PathBuf>, error: AppError) {
        tracing::warn!(
            paths = ?paths.iter().map(|path| path.to_string_lossy().to_string()).collect::<Vec<_>>(),
            error = %error,
            "task file write failed; reconciling from disk"
        );
        self.status.fail(&error);
        self.enqueue_paths(paths);
    }

    async fn materialize(self: &Arc<Self>, scope: MaterializeScope) {
        let inner = self.clone();
        let snapshot = Arc::clone(&self.state.borrow());
        let report = blocking(move || {
            let materializer = &inner.materializer;
            Ok(match scope {
                MaterializeScope::All => materializer.process_all(&snapshot.views, &snapshot.records, &snapshot.schema),
                MaterializeScope::Affected(changed) => {
                    materializer.process_affected(&snapshot.views, &changed, &snapshot.records, &snapshot.schema)
                }
                MaterializeScope::View(id) => {
                    let mut report = MaterializeReport::default();
                    if let Some(view) = snapshot.view(&id).filter(|view| !view.system) {
                        report.push_outcome(
                            materializer.materialize(view, &snapshot.records, &snapshot.schema),
                            &view.path,
                        );
                    }
                    report
                }
            })
        })
        .await;

        match report {
            Ok(report) => {
                if let Some((path, message)) = report.failures.first() {
                    self.status.fail(format!("{}: {}", display_name(path), message));
                } else if !report.written.is_empty() {
                    tracing::debug!(written = report.written.len(), "views refreshed");
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "view materialization aborted");
                self.status.fail(&error);
            }
        }
    }

    /// Puts a reconcile's paths back and queues it again, behind every job already waiting.
    fn defer_reconcile(&self, full: bool, paths: Vec<PathBuf>) {
        if full {
            self.full_reconcile.store(true, Ordering::SeqCst);
        }
        self.enqueue_paths(paths);
    }

    async fn reconcile(self: &Arc<Self>) {
        self.reconcile_queued.store(false, Ordering::SeqCst);
        let full = self.full_reconcile.swap(false, Ordering::SeqCst);
        let drained = self
            .pending_paths
            .lock()
            .map(|mut pending| std::mem::take(&mut *pending))
            .unwrap_or_default();
        // Hidden paths are temp files from atomic writes.
        let paths = drained
            .into_iter()
            .filter(|path| !is_hidden_below(&self.tasks_dir, path))
            .collect::<Vec<_>>();
        if !full && paths.is_empty() {
            return;
        }
        // Writes queued behind this reconcile would be read as their old contents.
        if self.queued_task_writes.load(Ordering::SeqCst) > 0 {
            tracing::debug!("task writes pending; deferring reconcile behind them");
            self.defer_reconcile(full, paths);
            return;
        }

        let incremental = !full
            && paths.len() < self.config.incremental_threshold
            && paths
                .iter()
                .all(|path| path.starts_with(&self.tasks_dir) && is_markdown(path));
        let generation = self.generation.load(Ordering::SeqCst);
        tracing::debug!(paths = paths.len(), incremental, "reconciling tasks with disk");
        self.status.begin("Reconciling tasks");

        let inner = self.clone();
        let scan_paths = paths.clone();
        let scan = blocking(move || {
            if incremental {
                inner
                    .indexer
                    .index_changed(&inner.tasks_dir, &scan_paths)
                    .map(DiskScan::Changed)
            } else {
                inner
                    .indexer
                    .index_all(&inner.tasks_dir, |current, total| inner.status.progress(current, total))
                    .map(DiskScan::Full)
            }
        })
        .await;
        let scan = match scan {
            Ok(scan) => scan,
            Err(error) => {
                tracing::warn!(error = %error, "reconcile failed");
                self.status.fail(&error);
                return;
            }
        };

        let mut stale = false;
        let mut changed = Vec::new();
        self.state.send_if_modified(|current| {
            if self.generation.load(Ordering::SeqCst) != generation
                || self.queued_task_writes.load(Ordering::SeqCst) > 0
            {
                stale = true;
                return false;
            }
            let records = scan.apply(&current.records);
            if records == current.records {
                return false;
            }
            changed = changed_records(&current.records, &records);
            *current = Arc::new(current.with_records(records));
            true
        });

        if stale {
            // The disk read may predate a queued write; try again after it.
            tracing::debug!("local mutation during reconcile; re-queueing");
            self.defer_reconcile(full, paths);
            self.status.finish("Reconcile deferred");
            return;
        }

        self.status.record_reconcile();
        if changed.is_empty() {
            self.status.finish("Tasks unchanged");
            return;
        }
        tracing::info!(changed = changed.len(), "published task changes from disk");
        self.materialize(MaterializeScope::Affected(changed)).await;
        let count = self.state.borrow().records.len();
        self.status.finish(format!("Reconciled {} tasks", count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryDataSource;

    fn root() -> PathBuf {
        PathBuf::from("/root")
    }

    async fn memory_store() -> (Arc<MemoryDataSource>, SyncStore) {
        let source = Arc::new(MemoryDataSource::new());
        let config = StoreConfig {
            watch: false,
            ..StoreConfig::default()
        };
        let store = SyncStore::load_all(root(), config, source.clone()).await.expect("load");
        (source, store)
    }

    fn draft(title: &str) -> NewRecord {
        NewRecord {
            title: title.to_string(),
            ..NewRecord::default()
        }
    }

    #[tokio::test]
    async fn load_creates_schema_and_publishes_records() {
        let source = Arc::new(MemoryDataSource::new());
        source
            .write(&root().join("tasks/Plan-trip.md"), "---\nstatus: \"prog\"\n---\nnotes")
            .expect("seed");
        let config = StoreConfig {
            watch: false,
            ..StoreConfig::default()
        };
        let store = SyncStore::load_all(root(), config, source.clone()).await.expect("load");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].title, "Plan trip");
        assert!(source.exists(&root().join("schema.json")));
        assert!(snapshot.catalogs["status"].contains_key("prog"));
        assert!(!store.is_watching());
    }

    #[tokio::test]
    async fn created_record_is_visible_before_its_write_lands() {
        let (source, store) = memory_store().await;
        let mut updates = store.subscribe();
        let record = store.create_record(draft("Buy milk")).expect("create");
        assert_eq!(record.id, "Buy-milk.md");
        assert!(store.record("Buy-milk.md").is_some());
        assert!(updates.has_changed().expect("sender alive"));

        store.flush().await.expect("flush");
        let written = source.read(&root().join("tasks/Buy-milk.md")).expect("file written");
        assert!(written.starts_with("---\nstatus: \"todo\"\ncreated: "));
    }

    #[tokio::test]
    async fn managed_fields_are_rejected_and_reported() {
        let (_, store) = memory_store().await;
        let record = store.create_record(draft("Task")).expect("create");
        for key in ["status", "title", "done", "elapsed", "completed_at"] {
            let mut patch = RecordPatch::default();
            patch.fields.insert(key.to_string(), Some("x".to_string()));
            let error = store.update_record(&record.id, patch).expect_err("managed key");
            assert!(matches!(error, AppError::Validation(_)), "{key}");
        }
        assert!(store.status().last_error.is_some());
        assert_eq!(store.record(&record.id), Some(record));
    }

    #[tokio::test]
    async fn renames_refuse_existing_task_and_view_names() {
        let (_, store) = memory_store().await;
        store.create_record(draft("Alpha")).expect("alpha");
        let beta = store.create_record(draft("Beta")).expect("beta");
        store
            .create_view(ViewDraft {
                name: "Gamma".to_string(),
                ..ViewDraft::default()
            })
            .expect("view");

        let to_alpha = RecordPatch {
            title: Some("Alpha".to_string()),
            ..RecordPatch::default()
        };
        assert!(matches!(store.update_record(&beta.id, to_alpha), Err(AppError::Conflict(_))));
        let to_gamma = RecordPatch {
            title: Some("Gamma".to_string()),
            ..RecordPatch::default()
        };
        assert!(matches!(store.update_record(&beta.id, to_gamma), Err(AppError::Conflict(_))));
        assert!(matches!(store.create_record(draft("Alpha")), Err(AppError::Conflict(_))));
        assert!(store.record("Beta.md").is_some());
    }

    #[tokio::test]
    async fn invalid_view_drafts_are_rejected() {
        let (_, store) = memory_store().await;
        let unbalanced = ViewDraft {
            name: "Broken".to_string(),
            query: "title == \"open".to_string(),
            ..ViewDraft::default()
        };
        assert!(matches!(store.create_view(unbalanced), Err(AppError::Query(_))));
        let bad_sort = ViewDraft {
            name: "Broken".to_string(),
            sort: vec!["title sideways".to_string()],
            ..ViewDraft::default()
        };
        assert!(matches!(store.create_view(bad_sort), Err(AppError::Validation(_))));
        assert!(store.snapshot().views.is_empty());
    }

    #[tokio::test]
    async fn system_views_are_listed_but_read_only() {
        let source = Arc::new(MemoryDataSource::new());
        let inbox = root().join("views/Inbox.md");
        let original = "---\ntype: \"view\"\nquery: \"\"\nsystem: \"true\"\n---\nhand written\n";
        source.write(&inbox, original).expect("seed");
        let config = StoreConfig {
            watch: false,
            ..StoreConfig::default()
        };
        let store = SyncStore::load_all(root(), config, source.clone()).await.expect("load");

        let id = inbox.to_string_lossy().to_string();
        assert!(store.view(&id).map(|view| view.system).unwrap_or(false));
        assert!(matches!(store.delete_view(&id), Err(AppError::Validation(_))));
        assert!(matches!(
            store.save_view(&id, ViewDraft { name: "Inbox".to_string(), ..ViewDraft::default() }),
            Err(AppError::Validation(_))
        ));
        store.create_record(draft("Anything")).expect("create");
        store.flush().await.expect("flush");
        assert_eq!(source.read(&inbox).expect("inbox"), original);
    }

    #[tokio::test]
    async fn check_view_publishes_advisory_warnings() {
        let (_, store) = memory_store().await;
        store.create_record(draft("One")).expect("create");
        let view = store
            .create_view(ViewDraft {
                name: "Open".to_string(),
                query: "todo".to_string(),
                sort: vec!["priority desc".to_string()],
                ..ViewDraft::default()
            })
            .expect("view");
        let warnings = store.check_view(&view.id).expect("check");
        assert_eq!(warnings, vec!["Unknown sort field 'priority'".to_string()]);
        assert_eq!(store.status().warnings, warnings);
    }

    #[tokio::test]
    async fn schema_save_heals_and_rederives_catalogs() {
        let (source, store) = memory_store().await;
        let mut patch_fields = BTreeMap::new();
        patch_fields.insert("priority".to_string(), "high".to_string());
        store
            .create_record(NewRecord {
                title: "Ship".to_string(),
                fields: patch_fields,
                ..NewRecord::default()
            })
            .expect("create");

        let mut schema = SchemaRegistry::default();
        schema.fields.insert(
            "priority".to_string(),
            schema::FieldDefinition {
                field_type: schema::FieldType::Categorical,
                options: BTreeMap::new(),
            },
        );
        schema.fields.insert("title".to_string(), schema::FieldDefinition::default());
        let saved = store.save_schema(schema).expect("save");
        assert!(!saved.fields.contains_key("title"));
        assert!(saved.fields.contains_key("status"));
        assert_eq!(store.snapshot().catalogs["priority"].get("high"), Some(&None));

        store.flush().await.expect("flush");
        let persisted: SchemaRegistry =
            serde_json::from_str(&source.read(&root().join("schema.json")).expect("schema")).expect("json");
        assert_eq!(persisted, saved);
    }

    #[tokio::test]
    async fn query_records_filters_and_sorts() {
        let (_, store) = memory_store().await;
        for (title, status) in [("Charlie", "done"), ("Alpha", "prog"), ("Bravo", "done")] {
            store
                .create_record(NewRecord {
                    title: title.to_string(),
                    status: Some(status.to_string()),
                    ..NewRecord::default()
                })
                .expect("create");
        }
        let done = store.query_records("status == done", &["title desc"]).expect("query");
        let titles = done.iter().map(|record| record.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Charlie", "Bravo"]);
    }

    #[tokio::test]
    async fn reconcile_picks_up_external_edits_and_deletions() {
        let (source, store) = memory_store().await;
        let record = store.create_record(draft("Edit me")).expect("create");
        store.create_record(draft("Remove me")).expect("create");
        store.flush().await.expect("flush");

        source
            .write(&record.path, "---\nstatus: \"done:external\"\ncreated: \"2024-01-01T00:00:00Z\"\n---\n")
            .expect("external edit");
        source.remove(&root().join("tasks/Remove-me.md")).expect("external delete");
        store.request_reconcile(vec![record.path.clone(), root().join("tasks/Remove-me.md")]);
        store.flush().await.expect("reconciled");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].status, "done:external");
        assert!(snapshot.records[0].done.is_some());
        assert_eq!(store.status().reconcile_count, 1);

        store.request_reconcile(Vec::new());
        store.flush().await.expect("full");
        assert_eq!(store.snapshot(), snapshot);
        assert_eq!(store.status().reconcile_count, 2);
    }

    #[tokio::test]
    async fn queued_reconcile_does_not_revert_a_later_update() {
        let (source, store) = memory_store().await;
        let record = store.create_record(draft("Pay rent")).expect("create");
        store.flush().await.expect("flush");

        store.request_reconcile(Vec::new());
        store
            .update_record(
                &record.id,
                RecordPatch {
                    status: Some("done".to_string()),
                    ..RecordPatch::default()
                },
            )
            .expect("complete");
        assert_eq!(store.record(&record.id).map(|record| record.status), Some("done".to_string()));
        store.flush().await.expect("flush write");
        store.flush().await.expect("flush reconcile");

        assert!(source.read(&record.path).expect("file").contains("status: \"done\""));
        assert_eq!(store.record(&record.id).map(|record| record.status), Some("done".to_string()));
        assert_eq!(store.status().reconcile_count, 1);
    }

    #[tokio::test]
    async fn queued_reconcile_does_not_drop_a_later_create() {
        let (source, store) = memory_store().await;
        store.request_reconcile(Vec::new());
        let record = store.create_record(draft("Book flights")).expect("create");
        store.flush().await.expect("flush write");
        store.flush().await.expect("flush reconcile");

        assert!(source.exists(&record.path));
        assert_eq!(store.record(&record.id), Some(record));
    }

    /// Parks the next listing of the tasks directory until the test releases it.
    struct GatedSource {
        inner: MemoryDataSource,
        gate: Mutex<Option<(std::sync::mpsc::Sender<()>, std::sync::mpsc::Receiver<()>)>>,
    }

    impl GatedSource {
        fn new() -> Self {
            Self {
                inner: MemoryDataSource::new(),
                gate: Mutex::new(None),
            }
        }

        /// Returns (entered, release).
        fn arm(&self) -> (std::sync::mpsc::Receiver<()>, std::sync::mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = std::sync::mpsc::channel();
            let (release_tx, release_rx) = std::sync::mpsc::channel();
            *self.gate.lock().expect("gate") = Some((entered_tx, release_rx));
            (entered_rx, release_tx)
        }
    }

    impl TaskDataSource for GatedSource {
        fn list_markdown(&self, dir: &Path) -> AppResult<Vec<PathBuf>> {
            let gate = if dir == root().join("tasks") {
                self.gate.lock().expect("gate").take()
            } else {
                None
            };
            if let Some((entered, release)) = gate {
                let _ = entered.send(());
                let _ = release.recv();
            }
            self.inner.list_markdown(dir)
        }

        fn read(&self, path: &Path) -> AppResult<String> {
            self.inner.read(path)
        }

        fn write(&self, path: &Path, content: &str) -> AppResult<()> {
            self.inner.write(path, content)
        }

        fn remove(&self, path: &Path) -> AppResult<()> {
            self.inner.remove(path)
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn ensure_dir(&self, dir: &Path) -> AppResult<()> {
            self.inner.ensure_dir(dir)
        }

        fn supports_watch(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn reconcile_overtaken_by_a_mutation_is_discarded_and_retried() {
        let source = Arc::new(GatedSource::new());
        let config = StoreConfig {
            watch: false,
            ..StoreConfig::default()
        };
        let store = SyncStore::load_all(root(), config, source.clone()).await.expect("load");
        let record = store.create_record(draft("Renew passport")).expect("create");
        store.flush().await.expect("flush");

        let (entered, release) = source.arm();
        store.request_reconcile(Vec::new());
        tokio::task::spawn_blocking(move || entered.recv())
            .await
            .expect("join")
            .expect("scan started");

        // The scan is parked holding the pre-update file contents.
        store
            .update_record(
                &record.id,
                RecordPatch {
                    status: Some("prog".to_string()),
                    ..RecordPatch::default()
                },
            )
            .expect("start");
        release.send(()).expect("release scan");
        store.flush().await.expect("flush");
        store.flush().await.expect("flush retried reconcile");

        assert_eq!(store.record(&record.id).map(|record| record.status), Some("prog".to_string()));
        assert!(source.read(&record.path).expect("file").contains("status: \"prog\""));
        // Only the retry publishes; the overtaken scan is dropped.
        assert_eq!(store.status().reconcile_count, 1);
    }

    #[test]
    fn changed_records_reports_both_versions() {
        let tasks = root().join("tasks");
        let a = Record::from_file(&tasks, &tasks.join("a.md"), "---\nstatus: \"todo\"\n---\n", Utc::now());
        let b = Record::from_file(&tasks, &tasks.join("b.md"), "---\nstatus: \"todo\"\n---\n", Utc::now());
        let a_done = a.with_status("done", Utc::now());
        let changed = changed_records(&[a.clone(), b.clone()], &[a_done.clone(), b]);
        assert_eq!(changed, vec![a, a_done]);
    }
}
