//! Flat frontmatter codec shared by task and view files.
//!
//! The metadata block is a single level of `key: value` lines between two `---`
//! delimiter lines. Values are opaque strings; list-valued keys (`tags`, `sort`,
//! `columns`) hold a bracketed literal such as `["a", "b"]`.

use std::collections::BTreeMap;

pub const DELIMITER: &str = "---";
pub const MARKDOWN_EXTENSION: &str = "md";
pub const DEFAULT_TITLE_MAX_CHARS: usize = 50;

const UNTITLED: &str = "Untitled";
// Private-use code point standing in for an escaped dash while decoding filenames.
const DASH_PLACEHOLDER: char = '\u{E000}';

pub type Metadata = BTreeMap<String, String>;

pub fn parse(content: &str) -> (Metadata, String) {
    let mut metadata = Metadata::new();
    let mut body_lines = Vec::new();
    let mut delimiters_seen = 0usize;

    for line in content.split('\n') {
        if delimiters_seen < 2 && line.trim() == DELIMITER {
            delimiters_seen += 1;
            continue;
        }
        if delimiters_seen == 1 {
            if let Some((key, value)) = parse_metadata_line(line) {
                metadata.insert(key, value);
            }
        } else {
            body_lines.push(line);
        }
    }

    // An unterminated block swallows the rest of the file as metadata.
    (metadata, body_lines.join("\n"))
}

fn parse_metadata_line(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), unquote(value.trim())))
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].replace("\\\"", "\"")
    } else {
        value.to_string()
    }
}

/// Renders `entries` in the given order followed by the body.
pub fn render<'a, I>(entries: I, body: &str) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::from(DELIMITER);
    out.push('\n');
    for (key, value) in entries {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&render_value(value));
        out.push('\n');
    }
    out.push_str(DELIMITER);
    out.push('\n');
    out.push_str(body);
    out
}

fn render_value(value: &str) -> String {
    let flat = flatten_line_breaks(value);
    if is_list_literal(&flat) {
        return flat;
    }
    format!("\"{}\"", flat.replace('"', "\\\""))
}

pub fn flatten_line_breaks(value: &str) -> String {
    value.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

fn is_list_literal(value: &str) -> bool {
    value.starts_with('[') && value.ends_with(']')
}

/// Splits a `[ "a", "b" ]` literal. Anything that is not a bracketed list yields no items.
pub fn parse_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if !is_list_literal(trimmed) || trimmed.len() < 2 {
        return Vec::new();
    }
    trimmed[1..trimmed.len() - 1]
        .split(',')
        .map(|item| item.trim().trim_matches('"').trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

pub fn render_list<S: AsRef<str>>(items: &[S]) -> String {
    let quoted = items
        .iter()
        .map(|item| format!("\"{}\"", flatten_line_breaks(item.as_ref()).replace([',', '"'], "")))
        .collect::<Vec<_>>();
    format!("[{}]", quoted.join(", "))
}

pub fn filename_from_title(title: &str) -> String {
    filename_from_title_capped(title, DEFAULT_TITLE_MAX_CHARS)
}

pub fn filename_from_title_capped(title: &str, max_chars: usize) -> String {
    let capped = title.trim().chars().take(max_chars).collect::<String>();
    let stem = capped
        .replace('-', "--")
        .replace(' ', "-")
        .chars()
        .filter(|ch| ch.is_alphanumeric() || *ch == '-')
        .collect::<String>();
    if stem.is_empty() {
        format!("{}.{}", UNTITLED, MARKDOWN_EXTENSION)
    } else {
        format!("{}.{}", stem, MARKDOWN_EXTENSION)
    }
}

pub fn title_from_filename(filename: &str) -> String {
    let stem = filename
        .strip_suffix(".md")
        .unwrap_or(filename);
    let title = stem
        .replace("--", &DASH_PLACEHOLDER.to_string())
        .replace('-', " ")
        .replace(DASH_PLACEHOLDER, "-");
    if title.is_empty() {
        UNTITLED.to_string()
    } else {
        title
    }
}
