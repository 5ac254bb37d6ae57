use crate::models::{format_timestamp, Record};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Fields every record can be sorted by, whether or not they appear in frontmatter.
pub const KNOWN_SORT_KEYS: &[&str] = &["title", "status", "created", "done", "id", "tags", "phase"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

impl SortKey {
    /// Parses `"field"` or `"field asc|desc"`. Unknown direction words fall back to
    /// ascending; `validate` reports them.
    pub fn parse(descriptor: &str) -> Option<Self> {
        let mut parts = descriptor.split_whitespace();
        let field = parts.next()?.to_string();
        let direction = match parts.next() {
            Some(word) if word.eq_ignore_ascii_case("desc") => Direction::Desc,
            _ => Direction::Asc,
        };
        Some(Self { field, direction })
    }

    fn extract(&self, record: &Record) -> String {
        match self.field.as_str() {
            "created" => format_timestamp(&record.created),
            "done" => record.done.as_ref().map(format_timestamp).unwrap_or_default(),
            "phase" => record.phase().as_str().to_string(),
            "tags" => record.tags.iter().cloned().collect::<Vec<_>>().join(","),
            other => record.field(other),
        }
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let ordering = self.extract(a).cmp(&self.extract(b));
        match self.direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortComparator {
    keys: Vec<SortKey>,
}

impl SortComparator {
    pub fn new<S: AsRef<str>>(descriptors: &[S]) -> Self {
        Self {
            keys: descriptors
                .iter()
                .filter_map(|descriptor| SortKey::parse(descriptor.as_ref()))
                .collect(),
        }
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for key in &self.keys {
            let ordering = key.compare(a, b);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Stable: records that tie on every key keep their input order.
    pub fn sort(&self, records: &mut [Record]) {
        if self.keys.is_empty() {
            return;
        }
        records.sort_by(|a, b| self.compare(a, b));
    }
}

pub fn sort_records<S: AsRef<str>>(records: &mut [Record], descriptors: &[S]) {
    SortComparator::new(descriptors).sort(records);
}

/// Reports descriptors naming a field no record carries, and unknown directions.
pub fn validate<S: AsRef<str>>(records: &[Record], descriptors: &[S]) -> Vec<String> {
    let mut available: BTreeSet<&str> = KNOWN_SORT_KEYS.iter().copied().collect();
    for record in records {
        available.extend(record.frontmatter.keys().map(String::as_str));
    }

    let mut errors = Vec::new();
    for descriptor in descriptors {
        let descriptor = descriptor.as_ref();
        if let Some(field) = descriptor.split_whitespace().next() {
            if !available.contains(field) {
                errors.push(format!("Unknown sort field '{}'", field));
            }
        }
        errors.extend(descriptor_errors(descriptor));
    }
    errors
}

/// Shape-only check: direction words and descriptor arity, independent of any records.
pub fn validate_descriptors<S: AsRef<str>>(descriptors: &[S]) -> Vec<String> {
    descriptors
        .iter()
        .flat_map(|descriptor| descriptor_errors(descriptor.as_ref()))
        .collect()
}

fn descriptor_errors(descriptor: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let mut parts = descriptor.split_whitespace();
    let Some(field) = parts.next() else {
        return errors;
    };
    if let Some(direction) = parts.next() {
        if !direction.eq_ignore_ascii_case("asc") && !direction.eq_ignore_ascii_case("desc") {
            errors.push(format!("Unknown sort direction '{}' for field '{}'", direction, field));
        }
    }
    if parts.next().is_some() {
        errors.push(format!("Malformed sort descriptor '{}'", descriptor));
    }
    errors
}
