use crate::codec::{self, Metadata};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const KEY_STATUS: &str = "status";
pub const KEY_CREATED: &str = "created";
pub const KEY_DONE: &str = "done";
pub const KEY_TAGS: &str = "tags";
pub const KEY_TITLE: &str = "title";

pub const DEFAULT_STATUS: &str = "todo";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Keys a caller may never set through a generic field write; they are either
/// derived or owned by dedicated record operations.
pub const MANAGED_KEYS: &[&str] = &["id", "title", "status", "created", "done", "tags", "elapsed"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Todo,
    Prog,
    Done,
}

impl Phase {
    pub fn from_status(status: &str) -> Self {
        let head = status.split(':').next().unwrap_or_default().trim().to_lowercase();
        match head.as_str() {
            "done" | "completed" => Self::Done,
            "prog" | "in-progress" | "doing" | "progress" => Self::Prog,
            _ => Self::Todo,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Prog => "prog",
            Self::Done => "done",
        }
    }
}

pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(value) = DateTime::parse_from_rfc3339(raw) {
        return Some(value.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Second precision is all the file format keeps, so in-memory timestamps are
/// truncated to match what a re-index would read back.
pub fn whole_seconds(value: DateTime<Utc>) -> DateTime<Utc> {
    value.with_nanosecond(0).unwrap_or(value)
}

/// Record id for a task file: its path relative to the tasks directory.
pub fn record_id(tasks_dir: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(tasks_dir).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub title: String,
    pub status: String,
    pub created: DateTime<Utc>,
    pub done: Option<DateTime<Utc>>,
    pub tags: BTreeSet<String>,
    pub path: PathBuf,
    pub content: String,
    pub frontmatter: BTreeMap<String, String>,
}

impl Record {
    pub fn from_file(tasks_dir: &Path, path: &Path, raw: &str, now: DateTime<Utc>) -> Self {
        let (metadata, body) = codec::parse(raw);
        Self::assemble(tasks_dir, path, metadata, body, now)
    }

    /// Derives every structured attribute from `frontmatter` and normalizes the map so
    /// it holds exactly what rendering will persist.
    pub fn assemble(
        tasks_dir: &Path,
        path: &Path,
        mut frontmatter: Metadata,
        content: String,
        now: DateTime<Utc>,
    ) -> Self {
        frontmatter.remove(KEY_TITLE);

        let status = frontmatter
            .get(KEY_STATUS)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_STATUS.to_string());
        frontmatter.insert(KEY_STATUS.to_string(), status.clone());

        let created = match frontmatter.get(KEY_CREATED).and_then(|raw| parse_timestamp(raw)) {
            Some(value) => value,
            None => {
                let fallback = whole_seconds(now);
                frontmatter.insert(KEY_CREATED.to_string(), format_timestamp(&fallback));
                fallback
            }
        };

        let done = if Phase::from_status(&status) == Phase::Done {
            match frontmatter.get(KEY_DONE).and_then(|raw| parse_timestamp(raw)) {
                Some(value) => Some(value),
                None => {
                    let fallback = whole_seconds(now);
                    frontmatter.insert(KEY_DONE.to_string(), format_timestamp(&fallback));
                    Some(fallback)
                }
            }
        } else {
            frontmatter.remove(KEY_DONE);
            None
        };

        let tags = frontmatter
            .get(KEY_TAGS)
            .map(|raw| codec::parse_list(raw))
            .unwrap_or_default()
            .into_iter()
            .collect::<BTreeSet<_>>();
        if tags.is_empty() {
            frontmatter.remove(KEY_TAGS);
        }

        let filename = path
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            id: record_id(tasks_dir, path),
            title: codec::title_from_filename(&filename),
            status,
            created,
            done,
            tags,
            path: path.to_path_buf(),
            content,
            frontmatter,
        }
    }

    pub fn create(tasks_dir: &Path, path: &Path, draft: &NewRecord, now: DateTime<Utc>) -> Self {
        let now = whole_seconds(now);
        let mut frontmatter = draft
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect::<Metadata>();
        let status = draft
            .status
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_STATUS.to_string());
        frontmatter.insert(KEY_STATUS.to_string(), status);
        frontmatter.insert(KEY_CREATED.to_string(), format_timestamp(&now));
        if !draft.tags.is_empty() {
            let tags = draft.tags.iter().cloned().collect::<Vec<_>>();
            frontmatter.insert(KEY_TAGS.to_string(), codec::render_list(&tags));
        }
        Self::assemble(tasks_dir, path, frontmatter, draft.content.clone(), now)
    }

    pub fn phase(&self) -> Phase {
        Phase::from_status(&self.status)
    }

    /// The text after the first `:` of the status, if any.
    pub fn status_label(&self) -> Option<&str> {
        self.status
            .split_once(':')
            .map(|(_, label)| label.trim())
            .filter(|label| !label.is_empty())
    }

    /// Field lookup shared by query, sort and table rendering.
    pub fn field(&self, name: &str) -> String {
        match name {
            KEY_STATUS => self.status.clone(),
            KEY_TITLE => self.title.clone(),
            "id" => self.id.clone(),
            _ => self.frontmatter.get(name).cloned().unwrap_or_default(),
        }
    }

    /// Applies a status change, setting or clearing `done` together with it.
    pub fn with_status(&self, status: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        let status = status.trim();
        let status = if status.is_empty() { DEFAULT_STATUS } else { status };
        let entering_done = Phase::from_status(status) == Phase::Done;

        next.status = status.to_string();
        next.frontmatter.insert(KEY_STATUS.to_string(), next.status.clone());
        match (self.done, entering_done) {
            (Some(_), true) => {}
            (None, true) => {
                let stamp = whole_seconds(now);
                next.done = Some(stamp);
                next.frontmatter.insert(KEY_DONE.to_string(), format_timestamp(&stamp));
            }
            (_, false) => {
                next.done = None;
                next.frontmatter.remove(KEY_DONE);
            }
        }
        next
    }

    pub fn with_tags(&self, tags: BTreeSet<String>) -> Self {
        let mut next = self.clone();
        let tags = tags
            .into_iter()
            .map(|tag| tag.trim().trim_start_matches('#').to_string())
            .filter(|tag| !tag.is_empty())
            .collect::<BTreeSet<_>>();
        if tags.is_empty() {
            next.frontmatter.remove(KEY_TAGS);
        } else {
            let list = tags.iter().cloned().collect::<Vec<_>>();
            next.frontmatter.insert(KEY_TAGS.to_string(), codec::render_list(&list));
        }
        // Re-read through the codec so the set matches what a re-index would produce.
        next.tags = next
            .frontmatter
            .get(KEY_TAGS)
            .map(|raw| codec::parse_list(raw).into_iter().collect())
            .unwrap_or_default();
        next
    }

    pub fn with_content(&self, content: String) -> Self {
        let mut next = self.clone();
        next.content = content;
        next
    }

    pub fn with_field(&self, key: &str, value: Option<&str>) -> Self {
        let mut next = self.clone();
        match value {
            Some(value) => {
                next.frontmatter
                    .insert(key.to_string(), codec::flatten_line_breaks(value).trim().to_string());
            }
            None => {
                next.frontmatter.remove(key);
            }
        }
        next
    }

    pub fn with_path(&self, tasks_dir: &Path, path: &Path) -> Self {
        let mut next = self.clone();
        let filename = path
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_default();
        next.path = path.to_path_buf();
        next.id = record_id(tasks_dir, path);
        next.title = codec::title_from_filename(&filename);
        next
    }

    pub fn to_file_content(&self) -> String {
        let leading = [KEY_STATUS, KEY_CREATED, KEY_DONE, KEY_TAGS];
        let mut entries = Vec::with_capacity(self.frontmatter.len());
        for key in leading {
            if let Some(value) = self.frontmatter.get(key) {
                entries.push((key, value.as_str()));
            }
        }
        for (key, value) in &self.frontmatter {
            if !leading.contains(&key.as_str()) {
                entries.push((key.as_str(), value.as_str()));
            }
        }
        codec::render(entries, &self.content)
    }
}

/// Input for an explicit record creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewRecord {
    pub title: String,
    pub status: Option<String>,
    pub content: String,
    pub tags: BTreeSet<String>,
    pub fields: BTreeMap<String, String>,
}

/// Partial update of a record; `fields` entries set (`Some`) or remove (`None`) custom keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordPatch {
    pub title: Option<String>,
    pub status: Option<String>,
    pub content: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub fields: BTreeMap<String, Option<String>>,
}

pub const VIEW_TYPE: &str = "view";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDefinition {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub query: String,
    pub sort: Vec<String>,
    pub columns: Vec<String>,
    pub system: bool,
}

impl ViewDefinition {
    pub fn new(path: PathBuf, draft: &ViewDraft) -> Self {
        let filename = path
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            id: path.to_string_lossy().to_string(),
            name: codec::title_from_filename(&filename),
            path,
            query: codec::flatten_line_breaks(draft.query.trim()),
            sort: clean_list(&draft.sort),
            columns: clean_list(&draft.columns),
            system: false,
        }
    }

    /// Reads the definition half of a view file. The rendered table is ignored.
    pub fn from_file(path: &Path, raw: &str) -> Option<Self> {
        let (metadata, _) = codec::parse(raw);
        if metadata.get("type").map(String::as_str) != Some(VIEW_TYPE) {
            return None;
        }
        let list = |key: &str| metadata.get(key).map(|raw| codec::parse_list(raw)).unwrap_or_default();
        let filename = path
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_default();
        Some(Self {
            id: path.to_string_lossy().to_string(),
            name: codec::title_from_filename(&filename),
            path: path.to_path_buf(),
            query: metadata.get("query").cloned().unwrap_or_default(),
            sort: list("sort"),
            columns: list("columns"),
            system: metadata
                .get("system")
                .map(|value| value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    pub fn metadata_entries(&self) -> Vec<(String, String)> {
        let mut entries = vec![
            ("type".to_string(), VIEW_TYPE.to_string()),
            ("query".to_string(), self.query.clone()),
        ];
        if !self.sort.is_empty() {
            entries.push(("sort".to_string(), codec::render_list(&self.sort)));
        }
        if !self.columns.is_empty() {
            entries.push(("columns".to_string(), codec::render_list(&self.columns)));
        }
        if self.system {
            entries.push(("system".to_string(), "true".to_string()));
        }
        entries
    }
}

fn clean_list(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Input for creating or editing a view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ViewDraft {
    pub name: String,
    pub query: String,
    pub sort: Vec<String>,
    pub columns: Vec<String>,
}
