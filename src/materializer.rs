//! Renders view definitions into markdown tables on disk.
//!
//! Output is a pure function of the definition, the record set and the schema. The
//! last bytes written per view path are remembered so unchanged output is never
//! rewritten.

use crate::codec;
use crate::config::UnknownConditionPolicy;
use crate::errors::{AppError, AppResult};
use crate::models::{Record, ViewDefinition};
use crate::query::Query;
use crate::schema::{FieldType, SchemaRegistry};
use crate::sort::sort_records;
use crate::source::TaskDataSource;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DEFAULT_COLUMNS: &[&str] = &["title", "status", "created"];
const CELL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaterializeReport {
    pub written: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

impl MaterializeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn push_outcome(&mut self, outcome: AppResult<bool>, path: &Path) {
        match outcome {
            Ok(true) => self.written.push(path.to_path_buf()),
            Ok(false) => self.unchanged.push(path.to_path_buf()),
            Err(error) => {
                tracing::warn!(path = %path.to_string_lossy(), error = %error, "view materialization failed");
                self.failures.push((path.to_path_buf(), error.to_string()));
            }
        }
    }
}

pub struct ViewMaterializer {
    source: Arc<dyn TaskDataSource>,
    policy: UnknownConditionPolicy,
    written: Mutex<HashMap<PathBuf, String>>,
}

impl ViewMaterializer {
    pub fn new(source: Arc<dyn TaskDataSource>, policy: UnknownConditionPolicy) -> Self {
        Self {
            source,
            policy,
            written: Mutex::new(HashMap::new()),
        }
    }

    /// Full file content for `view`: its definition block followed by the table.
    pub fn render(&self, view: &ViewDefinition, records: &[Record], schema: &SchemaRegistry) -> AppResult<String> {
        let query = Query::parse(&view.query, self.policy)?;
        let mut rows = query.filter(records);
        sort_records(&mut rows, &view.sort);

        let columns = if view.columns.is_empty() {
            DEFAULT_COLUMNS.iter().map(|column| column.to_string()).collect::<Vec<_>>()
        } else {
            view.columns.clone()
        };

        let mut body = format!("# {}\n\n", view.name);
        body.push_str(&table_row(columns.iter().map(|column| capitalize(column))));
        body.push_str(&separator_row(columns.len()));
        for record in &rows {
            body.push_str(&table_row(columns.iter().map(|column| cell(record, column, schema))));
        }

        let entries = view.metadata_entries();
        Ok(codec::render(
            entries.iter().map(|(key, value)| (key.as_str(), value.as_str())),
            &body,
        ))
    }

    /// Writes the rendered view unless the target already holds identical bytes.
    /// Returns whether a write happened.
    pub fn materialize(&self, view: &ViewDefinition, records: &[Record], schema: &SchemaRegistry) -> AppResult<bool> {
        let rendered = self.render(view, records, schema)?;
        if self.last_written(&view.path)?.as_deref() == Some(rendered.as_str()) {
            return Ok(false);
        }
        if self.source.exists(&view.path) {
            if let Ok(existing) = self.source.read(&view.path) {
                if existing == rendered {
                    self.remember(&view.path, rendered)?;
                    return Ok(false);
                }
            }
        }
        self.source.write(&view.path, &rendered)?;
        self.remember(&view.path, rendered)?;
        tracing::debug!(path = %view.path.to_string_lossy(), "view materialized");
        Ok(true)
    }

    pub fn process_all(&self, views: &[ViewDefinition], records: &[Record], schema: &SchemaRegistry) -> MaterializeReport {
        let mut report = MaterializeReport::default();
        for view in views.iter().filter(|view| !view.system) {
            report.push_outcome(self.materialize(view, records, schema), &view.path);
        }
        report
    }

    /// Re-materializes only the views whose output can differ: blank queries, and
    /// queries matched by any version (old or new) of a changed record.
    pub fn process_affected(
        &self,
        views: &[ViewDefinition],
        changed: &[Record],
        records: &[Record],
        schema: &SchemaRegistry,
    ) -> MaterializeReport {
        let mut report = MaterializeReport::default();
        for view in views.iter().filter(|view| !view.system) {
            if !self.is_affected(view, changed) {
                continue;
            }
            report.push_outcome(self.materialize(view, records, schema), &view.path);
        }
        report
    }

    pub fn is_affected(&self, view: &ViewDefinition, changed: &[Record]) -> bool {
        match Query::parse(&view.query, self.policy) {
            Ok(query) => query.is_empty() || changed.iter().any(|record| query.matches(record)),
            // Let materialize report the failure.
            Err(_) => true,
        }
    }

    /// Drops the remembered output for `path`, e.g. after the view file is deleted.
    pub fn forget(&self, path: &Path) {
        if let Ok(mut written) = self.written.lock() {
            written.remove(path);
        }
    }

    fn last_written(&self, path: &Path) -> AppResult<Option<String>> {
        Ok(self
            .written
            .lock()
            .map_err(|_| AppError::Internal("materializer cache lock poisoned".to_string()))?
            .get(path)
            .cloned())
    }

    fn remember(&self, path: &Path, rendered: String) -> AppResult<()> {
        self.written
            .lock()
            .map_err(|_| AppError::Internal("materializer cache lock poisoned".to_string()))?
            .insert(path.to_path_buf(), rendered);
        Ok(())
    }
}

fn table_row<I: IntoIterator<Item = String>>(cells: I) -> String {
    let cells = cells.into_iter().collect::<Vec<_>>();
    format!("| {} |\n", cells.join(" | "))
}

fn separator_row(width: usize) -> String {
    format!("|{}\n", "---|".repeat(width))
}

fn capitalize(column: &str) -> String {
    let mut chars = column.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn display_time(value: &DateTime<Utc>) -> String {
    value.format(CELL_TIME_FORMAT).to_string()
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let minutes = elapsed.num_minutes().max(0);
    let (days, hours, minutes) = (minutes / (24 * 60), (minutes / 60) % 24, minutes % 60);
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

fn cell(record: &Record, column: &str, schema: &SchemaRegistry) -> String {
    let value = match column {
        "phase" => record.phase().as_str().to_string(),
        "created" => display_time(&record.created),
        "done" | "completed" | "completed_at" => record.done.as_ref().map(display_time).unwrap_or_default(),
        "elapsed" => record
            .done
            .map(|done| format_elapsed(done - record.created))
            .unwrap_or_default(),
        "tags" => record.tags.iter().cloned().collect::<Vec<_>>().join(", "),
        other => record.field(other),
    };
    let value = codec::flatten_line_breaks(&value).trim().to_string();
    let value = if !value.is_empty() && schema.field_type(column) == FieldType::Url {
        format!("<{}>", value)
    } else {
        value
    };
    value.replace('|', "\\|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{parse_timestamp, ViewDraft};
    use crate::schema::FieldDefinition;
    use crate::source::MemoryDataSource;

    fn tasks() -> PathBuf {
        PathBuf::from("/root/tasks")
    }

    fn record(name: &str, frontmatter: &str) -> Record {
        Record::from_file(
            &tasks(),
            &tasks().join(name),
            &format!("---\n{}\n---\n", frontmatter),
            Utc::now(),
        )
    }

    fn view(name: &str, query: &str, sort: &[&str], columns: &[&str]) -> ViewDefinition {
        let draft = ViewDraft {
            name: name.to_string(),
            query: query.to_string(),
            sort: sort.iter().map(|item| item.to_string()).collect(),
            columns: columns.iter().map(|item| item.to_string()).collect(),
        };
        ViewDefinition::new(PathBuf::from("/root/views").join(codec::filename_from_title(name)), &draft)
    }

    fn sample() -> Vec<Record> {
        vec![
            record(
                "Write-report.md",
                "status: \"done\"\ncreated: \"2024-01-01T08:00:00Z\"\ndone: \"2024-01-03T10:30:00Z\"\ntags: [\"work\"]",
            ),
            record(
                "Call-Sam.md",
                "status: \"prog\"\ncreated: \"2024-01-02T09:00:00Z\"\nlink: \"https://example.com/a\"",
            ),
            record("Buy-milk.md", "status: \"todo\"\ncreated: \"2024-01-05T12:00:00Z\"\nnote: \"a|b\""),
        ]
    }

    fn setup() -> (Arc<MemoryDataSource>, ViewMaterializer) {
        let source = Arc::new(MemoryDataSource::new());
        let materializer = ViewMaterializer::new(source.clone(), UnknownConditionPolicy::MatchAll);
        (source, materializer)
    }

    #[test]
    fn renders_filtered_sorted_table_below_definition() {
        let (_, materializer) = setup();
        let open = view("Open work", "status != done", &["created desc"], &["title", "status"]);
        let rendered = materializer
            .render(&open, &sample(), &SchemaRegistry::with_defaults())
            .expect("render");
        let expected = "---\ntype: \"view\"\nquery: \"status != done\"\nsort: [\"created desc\"]\ncolumns: [\"title\", \"status\"]\n---\n# Open work\n\n| Title | Status |\n|---|---|\n| Buy milk | todo |\n| Call Sam | prog |\n";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn derived_columns_are_presented() {
        let (_, materializer) = setup();
        let mut schema = SchemaRegistry::with_defaults();
        schema.fields.insert(
            "link".to_string(),
            FieldDefinition {
                field_type: FieldType::Url,
                options: Default::default(),
            },
        );
        let all = view("All", "", &["title"], &["title", "phase", "created", "completed", "elapsed", "tags", "link", "note"]);
        let rendered = materializer.render(&all, &sample(), &schema).expect("render");
        assert!(rendered.contains("| Buy milk | todo | 2024-01-05 12:00 |  |  |  |  | a\\|b |"));
        assert!(rendered.contains("| Call Sam | prog | 2024-01-02 09:00 |  |  |  | <https://example.com/a> |  |"));
        assert!(rendered.contains("| Write report | done | 2024-01-01 08:00 | 2024-01-03 10:30 | 2d 2h | work |  |  |"));
    }

    #[test]
    fn elapsed_uses_the_largest_two_units() {
        assert_eq!(format_elapsed(Duration::minutes(2 * 24 * 60 + 3 * 60 + 5)), "2d 3h");
        assert_eq!(format_elapsed(Duration::minutes(4 * 60 + 7)), "4h 7m");
        assert_eq!(format_elapsed(Duration::minutes(42)), "42m");
        assert_eq!(format_elapsed(Duration::minutes(-5)), "0m");
    }

    #[test]
    fn default_columns_apply_when_none_are_given() {
        let (_, materializer) = setup();
        let bare = view("Bare", "#work", &[], &[]);
        let rendered = materializer
            .render(&bare, &sample(), &SchemaRegistry::with_defaults())
            .expect("render");
        assert!(rendered.contains("| Title | Status | Created |\n"));
        assert!(!rendered.contains("columns:"));
    }

    #[test]
    fn rematerializing_unchanged_inputs_is_byte_identical_and_skips_the_write() {
        let (source, materializer) = setup();
        let open = view("Open work", "status != done", &["title"], &["title"]);
        let schema = SchemaRegistry::with_defaults();
        let records = sample();

        assert!(materializer.materialize(&open, &records, &schema).expect("first"));
        let first = source.read(&open.path).expect("first bytes");
        assert!(!materializer.materialize(&open, &records, &schema).expect("second"));
        assert_eq!(source.read(&open.path).expect("second bytes"), first);
        assert_eq!(source.write_count(&open.path), 1);

        // A fresh materializer compares against what is already on disk.
        let fresh = ViewMaterializer::new(source.clone(), UnknownConditionPolicy::MatchAll);
        assert!(!fresh.materialize(&open, &records, &schema).expect("third"));
        assert_eq!(source.write_count(&open.path), 1);
    }

    #[test]
    fn only_affected_views_are_reprocessed() {
        let (source, materializer) = setup();
        let schema = SchemaRegistry::with_defaults();
        let mut records = sample();
        let work = view("Work", "#work", &[], &["title"]);
        let todo = view("Todo", "status == todo", &[], &["title"]);
        let everything = view("Everything", "", &[], &["title"]);
        let views = vec![work.clone(), todo.clone(), everything.clone()];
        assert_eq!(materializer.process_all(&views, &records, &schema).written.len(), 3);

        let old = records[1].clone();
        let new = old.with_status("done", parse_timestamp("2024-01-04T00:00:00Z").expect("time"));
        records[1] = new.clone();
        let report = materializer.process_affected(&views, &[old, new], &records, &schema);

        assert!(report.is_clean());
        assert_eq!(source.write_count(&work.path), 1);
        assert_eq!(source.write_count(&todo.path), 1);
        assert_eq!(report.unchanged, vec![everything.path.clone()]);
    }

    #[test]
    fn system_views_are_never_written_and_broken_queries_are_reported() {
        let source = Arc::new(MemoryDataSource::new());
        let materializer = ViewMaterializer::new(source.clone(), UnknownConditionPolicy::Reject);
        let mut inbox = view("Inbox", "", &[], &[]);
        inbox.system = true;
        let broken = view("Broken", "whatever this is", &[], &[]);
        let fine = view("Fine", "todo", &[], &[]);

        let report = materializer.process_all(&[inbox.clone(), broken.clone(), fine.clone()], &sample(), &SchemaRegistry::with_defaults());
        assert_eq!(report.written, vec![fine.path.clone()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, broken.path);
        assert!(report.failures[0].1.starts_with("QUERY_INVALID:"));
        assert!(!source.exists(&inbox.path));
    }
}
