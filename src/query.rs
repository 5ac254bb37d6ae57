//! Boolean filter expressions over records.
//!
//! ```text
//! expression := group (("||" | "or") group)*
//! group      := condition (("&&" | "and") condition)*
//! condition  := status-token | "#"tag | field ("==" | "!=") value
//!             | field "like" pattern | field "contains" value
//! ```
//!
//! Separators inside double quotes are literal. Matching is case-insensitive except
//! for tags.

use crate::config::UnknownConditionPolicy;
use crate::errors::{AppError, AppResult};
use crate::models::Record;
use once_cell::sync::Lazy;
use regex::Regex;

const STATUS_TOKENS: &[&str] = &["todo", "doing", "in-progress", "done", "completed"];

static WORD_OPERATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^(\S+)\s+(like|contains)\s+(.+)$").expect("valid word operator regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LikePattern {
    Substring(String),
    Prefix(String),
    Suffix(String),
}

impl LikePattern {
    fn parse(raw: &str) -> Self {
        let lowered = raw.to_lowercase();
        let leading = lowered.starts_with('%');
        let trailing = lowered.len() > 1 && lowered.ends_with('%');
        match (leading, trailing) {
            (true, true) => Self::Substring(lowered[1..lowered.len() - 1].to_string()),
            (true, false) => Self::Suffix(lowered[1..].to_string()),
            (false, true) => Self::Prefix(lowered[..lowered.len() - 1].to_string()),
            // Without wildcards this is a substring test, looser than SQL.
            (false, false) => Self::Substring(lowered),
        }
    }

    fn matches(&self, value: &str) -> bool {
        let value = value.to_lowercase();
        match self {
            Self::Substring(needle) => value.contains(needle.as_str()),
            Self::Prefix(needle) => value.starts_with(needle.as_str()),
            Self::Suffix(needle) => value.ends_with(needle.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Status(String),
    Tag(String),
    Equals { field: String, value: String },
    NotEquals { field: String, value: String },
    Like { field: String, pattern: LikePattern },
    Contains { field: String, value: String },
    Unrecognized(String),
}

impl Condition {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let lowered = text.to_lowercase();
        if STATUS_TOKENS.contains(&lowered.as_str()) {
            return Self::Status(lowered);
        }
        if let Some(tag) = text.strip_prefix('#') {
            if !tag.is_empty() && !tag.contains(char::is_whitespace) {
                return Self::Tag(tag.to_string());
            }
        }
        if let Some(condition) = parse_symbol_operator(text) {
            return condition;
        }
        if let Some(captures) = WORD_OPERATOR.captures(text) {
            let field = captures[1].to_string();
            let value = strip_quotes(&captures[3]);
            return if captures[2].eq_ignore_ascii_case("like") {
                Self::Like {
                    field,
                    pattern: LikePattern::parse(&value),
                }
            } else {
                Self::Contains {
                    field,
                    value: value.to_lowercase(),
                }
            };
        }
        Self::Unrecognized(text.to_string())
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Status(token) => record.status.to_lowercase() == *token,
            Self::Tag(tag) => record.tags.contains(tag),
            Self::Equals { field, value } => record.field(field).to_lowercase() == *value,
            Self::NotEquals { field, value } => record.field(field).to_lowercase() != *value,
            Self::Like { field, pattern } => pattern.matches(&record.field(field)),
            Self::Contains { field, value } => record.field(field).to_lowercase().contains(value.as_str()),
            Self::Unrecognized(_) => true,
        }
    }
}

fn parse_symbol_operator(text: &str) -> Option<Condition> {
    let equals = text.find("==");
    let not_equals = text.find("!=");
    let (index, negated) = match (equals, not_equals) {
        (Some(eq), Some(ne)) if ne < eq => (ne, true),
        (Some(eq), _) => (eq, false),
        (None, Some(ne)) => (ne, true),
        (None, None) => return None,
    };
    let field = text[..index].trim();
    if field.is_empty() || field.contains(char::is_whitespace) {
        return None;
    }
    let field = field.to_string();
    let value = strip_quotes(&text[index + 2..]).to_lowercase();
    Some(if negated {
        Condition::NotEquals { field, value }
    } else {
        Condition::Equals { field, value }
    })
}

fn strip_quotes(raw: &str) -> String {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return trimmed[1..trimmed.len() - 1].replace("\\\"", "\"");
        }
    }
    trimmed.to_string()
}

/// Splits on `symbol` or a whitespace-delimited `word`, ignoring separators inside
/// double quotes.
fn split_outside_quotes(input: &str, symbol: &str, word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut skip_until = 0usize;
    let mut in_quotes = false;
    let mut previous: Option<char> = None;

    for (index, ch) in input.char_indices() {
        if index < skip_until {
            previous = Some(ch);
            continue;
        }
        if ch == '"' && previous != Some('\\') {
            in_quotes = !in_quotes;
        } else if !in_quotes {
            let rest = &input[index..];
            if rest.starts_with(symbol) {
                parts.push(input[start..index].to_string());
                start = index + symbol.len();
                skip_until = start;
            } else if ch.is_whitespace() {
                let candidate = &rest[ch.len_utf8()..];
                let is_word = candidate.len() > word.len()
                    && candidate.is_char_boundary(word.len())
                    && candidate[..word.len()].eq_ignore_ascii_case(word)
                    && candidate[word.len()..].starts_with(char::is_whitespace);
                if is_word {
                    parts.push(input[start..index].to_string());
                    start = index + ch.len_utf8() + word.len();
                    skip_until = start;
                }
            }
        }
        previous = Some(ch);
    }
    parts.push(input[start..].to_string());
    parts
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    groups: Vec<Vec<Condition>>,
}

impl Query {
    pub fn parse(expression: &str, policy: UnknownConditionPolicy) -> AppResult<Self> {
        let mut groups = Vec::new();
        for group_text in split_outside_quotes(expression, "||", "or") {
            let mut conditions = Vec::new();
            for condition_text in split_outside_quotes(&group_text, "&&", "and") {
                if condition_text.trim().is_empty() {
                    continue;
                }
                let condition = Condition::parse(&condition_text);
                if policy == UnknownConditionPolicy::Reject && !condition.is_recognized() {
                    return Err(AppError::Query(format!(
                        "unrecognized condition '{}'",
                        condition_text.trim()
                    )));
                }
                conditions.push(condition);
            }
            if !conditions.is_empty() {
                groups.push(conditions);
            }
        }
        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[Vec<Condition>] {
        &self.groups
    }

    /// True for a blank expression, which matches every record.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.groups.is_empty()
            || self
                .groups
                .iter()
                .any(|group| group.iter().all(|condition| condition.matches(record)))
    }

    pub fn filter(&self, records: &[Record]) -> Vec<Record> {
        records
            .iter()
            .filter(|record| self.matches(record))
            .cloned()
            .collect()
    }
}

pub fn filter(records: &[Record], expression: &str, policy: UnknownConditionPolicy) -> AppResult<Vec<Record>> {
    Ok(Query::parse(expression, policy)?.filter(records))
}

/// Rejects unbalanced quotes and expressions with nothing the filter recognizes.
pub fn validate(expression: &str) -> AppResult<()> {
    if expression.trim().is_empty() {
        return Ok(());
    }
    let quotes = expression.matches('"').count() - expression.matches("\\\"").count();
    if quotes % 2 != 0 {
        return Err(AppError::Query("unbalanced quotes in query".to_string()));
    }
    let query = Query::parse(expression, UnknownConditionPolicy::MatchAll)?;
    let recognized = query
        .groups()
        .iter()
        .flatten()
        .any(Condition::is_recognized);
    if !recognized {
        return Err(AppError::Query(format!(
            "query '{}' contains no recognized operator, tag or status",
            expression.trim()
        )));
    }
    Ok(())
}
