use crate::errors::AppResult;
use crate::models::{Record, KEY_STATUS};
use crate::source::TaskDataSource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Field names the system owns. They never appear in the user schema.
pub const PROTECTED_FIELDS: &[&str] = &[
    "id",
    "title",
    "created",
    "done",
    "completed",
    "elapsed",
    "tags",
    "completed_at",
    "due",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Categorical,
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStyle {
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldDefinition {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub options: BTreeMap<String, FieldStyle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SchemaRegistry {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
    #[serde(default)]
    pub order: Vec<String>,
}

/// Known values of one categorical field, each with its color when styled.
pub type ValueCatalog = BTreeMap<String, Option<String>>;

fn default_status_field() -> FieldDefinition {
    let options = [("todo", "gray"), ("prog", "blue"), ("done", "green")]
        .into_iter()
        .map(|(value, color)| {
            (
                value.to_string(),
                FieldStyle {
                    color: color.to_string(),
                },
            )
        })
        .collect();
    FieldDefinition {
        field_type: FieldType::Categorical,
        options,
    }
}

pub fn is_protected(name: &str) -> bool {
    PROTECTED_FIELDS.contains(&name)
}

impl SchemaRegistry {
    pub fn with_defaults() -> Self {
        let mut schema = Self::default();
        schema.heal();
        schema
    }

    /// Loads the registry from `path`. A missing file is created with defaults; an
    /// unreadable one is reset to defaults and rewritten immediately.
    pub fn load(source: &dyn TaskDataSource, path: &Path) -> AppResult<Self> {
        if !source.exists(path) {
            let schema = Self::with_defaults();
            schema.save(source, path)?;
            return Ok(schema);
        }

        let raw = source.read(path)?;
        match serde_json::from_str::<Self>(&raw) {
            Ok(mut schema) => {
                if schema.heal() {
                    tracing::info!(path = %path.to_string_lossy(), "schema healed with default entries");
                    schema.save(source, path)?;
                }
                Ok(schema)
            }
            Err(error) => {
                tracing::warn!(path = %path.to_string_lossy(), error = %error, "schema file corrupt; resetting to defaults");
                let schema = Self::with_defaults();
                schema.save(source, path)?;
                Ok(schema)
            }
        }
    }

    pub fn save(&self, source: &dyn TaskDataSource, path: &Path) -> AppResult<()> {
        let mut bytes = serde_json::to_string_pretty(self)?;
        bytes.push('\n');
        source.write(path, &bytes)
    }

    /// Enforces registry invariants; returns whether anything changed.
    pub fn heal(&mut self) -> bool {
        let before = self.clone();

        self.fields.retain(|name, _| !is_protected(name) && !name.trim().is_empty());

        let status = self
            .fields
            .entry(KEY_STATUS.to_string())
            .or_insert_with(default_status_field);
        if !status.options.contains_key("done") {
            status.options.insert(
                "done".to_string(),
                FieldStyle {
                    color: "green".to_string(),
                },
            );
        }

        let mut seen = BTreeSet::new();
        let fields = &self.fields;
        self.order
            .retain(|name| fields.contains_key(name) && seen.insert(name.clone()));
        for name in self.fields.keys() {
            if !seen.contains(name) {
                self.order.push(name.clone());
            }
        }

        *self != before
    }

    pub fn field_type(&self, name: &str) -> FieldType {
        self.fields
            .get(name)
            .map(|definition| definition.field_type)
            .unwrap_or_default()
    }

    /// Every value seen for each categorical field across `records`, merged with the
    /// styled options declared for it.
    pub fn catalogs(&self, records: &[Record]) -> BTreeMap<String, ValueCatalog> {
        let mut catalogs = BTreeMap::new();
        for (name, definition) in &self.fields {
            if definition.field_type != FieldType::Categorical {
                continue;
            }
            let mut catalog: ValueCatalog = definition
                .options
                .iter()
                .map(|(value, style)| (value.clone(), Some(style.color.clone())))
                .collect();
            for record in records {
                let value = record.field(name);
                if value.trim().is_empty() {
                    continue;
                }
                let color = definition
                    .options
                    .get(&value)
                    .map(|style| style.color.clone());
                catalog.entry(value).or_insert(color);
            }
            catalogs.insert(name.clone(), catalog);
        }
        catalogs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryDataSource;
    use std::path::PathBuf;

    fn schema_path() -> PathBuf {
        PathBuf::from("/root/schema.json")
    }

    #[test]
    fn defaults_include_status_with_done_option() {
        let schema = SchemaRegistry::with_defaults();
        let status = schema.fields.get("status").expect("status field");
        assert_eq!(status.field_type, FieldType::Categorical);
        assert!(status.options.contains_key("done"));
        assert_eq!(schema.order, vec!["status"]);
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let source = MemoryDataSource::new();
        let schema = SchemaRegistry::load(&source, &schema_path()).expect("load");
        assert_eq!(schema, SchemaRegistry::with_defaults());
        assert!(source.exists(&schema_path()));
    }

    #[test]
    fn corrupt_file_is_reset_and_rewritten() {
        let source = MemoryDataSource::new();
        source.write(&schema_path(), "{ not json").expect("seed");
        let schema = SchemaRegistry::load(&source, &schema_path()).expect("load");
        assert_eq!(schema, SchemaRegistry::with_defaults());
        let rewritten = source.read(&schema_path()).expect("read back");
        assert!(serde_json::from_str::<SchemaRegistry>(&rewritten).is_ok());
    }

    #[test]
    fn protected_names_are_stripped_and_done_option_injected() {
        let source = MemoryDataSource::new();
        source
            .write(
                &schema_path(),
                r#"{"fields": {
                    "due": {"type": "text"},
                    "status": {"type": "categorical", "options": {"todo": {"color": "red"}}},
                    "link": {"type": "url"}
                }, "order": ["link", "due", "link"]}"#,
            )
            .expect("seed");
        let schema = SchemaRegistry::load(&source, &schema_path()).expect("load");
        assert!(!schema.fields.contains_key("due"));
        assert_eq!(schema.order, vec!["link", "status"]);
        let status = schema.fields.get("status").expect("status");
        assert_eq!(status.options.get("todo").map(|style| style.color.as_str()), Some("red"));
        assert!(status.options.contains_key("done"));
        assert_eq!(schema.field_type("link"), FieldType::Url);
        assert_eq!(schema.field_type("unknown"), FieldType::Text);
    }

    #[test]
    fn catalogs_merge_options_with_observed_values() {
        let tasks = PathBuf::from("/root/tasks");
        let blocked = Record::from_file(&tasks, &tasks.join("a.md"), "---\nstatus: \"blocked\"\n---\n", chrono::Utc::now());
        let done = Record::from_file(&tasks, &tasks.join("b.md"), "---\nstatus: \"done\"\n---\n", chrono::Utc::now());
        let catalogs = SchemaRegistry::with_defaults().catalogs(&[blocked, done]);
        let status = catalogs.get("status").expect("status catalog");
        assert_eq!(status.get("blocked"), Some(&None));
        assert_eq!(status.get("done"), Some(&Some("green".to_string())));
        assert!(status.contains_key("todo"));
    }
}
