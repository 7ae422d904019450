//! TOML handler.
//!
//! Keys are mapped from table headers and dotted keys. Sections, comments
//! and table ordering survive because edits are line splices.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::errors::{ApplyError, ValidationError};
use crate::handlers::structured::{self, KeyIndex, KeyPath};
use crate::handlers::{read_target, reject_conflict_markers, FileHandler, StructuralRefinement};
use crate::models::{Change, FileType};

const FORMAT: &str = "toml";

#[derive(Debug, Clone, Copy, Default)]
pub struct TomlHandler;

impl FileHandler for TomlHandler {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn can_handle(&self, path: &str) -> bool {
        FileType::from_path(path) == FileType::Toml
    }

    fn validate_change(
        &self,
        path: &str,
        content: &str,
        _start: usize,
        _end: usize,
    ) -> Result<(), ValidationError> {
        reject_conflict_markers(path, content)?;
        let doc_err = match parse_document(content) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if parse_document(&format!("value = {}", content.trim())).is_ok() {
            return Ok(());
        }
        Err(ValidationError::InvalidContent {
            path: path.to_string(),
            format: FORMAT.to_string(),
            detail: doc_err,
        })
    }

    fn detect_structural_conflicts(
        &self,
        path: &Path,
        changes: &[&Change],
    ) -> Option<StructuralRefinement> {
        let original = read_target(path).ok()?;
        if let Err(e) = parse_document(&original) {
            debug!(path = %path.display(), error = %e, "document does not parse, no refinement");
            return None;
        }
        structured::refine(&path.display().to_string(), &original, changes, scan_keys)
    }

    fn render_change(
        &self,
        path: &str,
        original: &str,
        content: &str,
        start: usize,
        end: usize,
    ) -> Result<String, ApplyError> {
        structured::render_checked(path, FORMAT, original, content, start, end, parse_document)
    }

    fn render_merge(
        &self,
        path: &str,
        original: &str,
        changes: &[&Change],
    ) -> Result<String, ApplyError> {
        structured::merge_disjoint(path, FORMAT, original, changes, scan_keys, parse_document)
    }
}

pub fn parse_document(text: &str) -> Result<(), String> {
    toml::from_str::<toml::Table>(text)
        .map(|_| ())
        .map_err(|e| e.message().to_string())
}

// ---------------------------------------------------------------------------
// Key scanner
// ---------------------------------------------------------------------------

/// Split a dotted key outside quotes, unquoting each part.
fn split_dotted(key: &str) -> KeyPath {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in key.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '.') => parts.push(std::mem::take(&mut current).trim().to_string()),
            (None, c) => current.push(c),
        }
    }
    parts.push(current.trim().to_string());
    parts
}

/// Open multi-line constructs of a value.
#[derive(Debug, Default)]
struct ValueState {
    depth: i32,
    triple: Option<char>,
}

impl ValueState {
    fn is_open(&self) -> bool {
        self.depth > 0 || self.triple.is_some()
    }

    /// Feed one line of value text.
    fn feed(&mut self, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let triple_at = |q: char| chars.get(i..i + 3).is_some_and(|s| s.iter().all(|x| *x == q));
            if let Some(q) = self.triple {
                if triple_at(q) {
                    self.triple = None;
                    i += 3;
                } else {
                    i += 1;
                }
                continue;
            }
            match c {
                '"' | '\'' if triple_at(c) => {
                    self.triple = Some(c);
                    i += 3;
                    continue;
                }
                '"' | '\'' => {
                    i += 1;
                    while i < chars.len() && chars[i] != c {
                        if c == '"' && chars[i] == '\\' {
                            i += 1;
                        }
                        i += 1;
                    }
                }
                '#' => break,
                '[' | '{' => self.depth += 1,
                ']' | '}' => self.depth -= 1,
                _ => {}
            }
            i += 1;
        }
    }
}

/// Find `=` outside quotes.
fn find_assignment(line: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '=') => return Some(i),
            (None, '#') => return None,
            _ => {}
        }
    }
    None
}

/// Map each line to the table or key path it defines.
pub fn scan_keys(text: &str) -> KeyIndex {
    let mut lines: Vec<Vec<KeyPath>> = Vec::new();
    let mut table: KeyPath = Vec::new();
    let mut array_counts: HashMap<KeyPath, usize> = HashMap::new();
    let mut pending: Option<(KeyPath, ValueState)> = None;

    for line in text.lines() {
        if let Some((key, mut state)) = pending.take() {
            state.feed(line);
            lines.push(vec![key.clone()]);
            if state.is_open() {
                pending = Some((key, state));
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            lines.push(Vec::new());
            continue;
        }

        if let Some(inner) = trimmed.strip_prefix("[[") {
            let name = split_dotted(inner.split("]]").next().unwrap_or_default());
            let count = array_counts.entry(name.clone()).or_insert(0);
            table = name;
            table.push(format!("[{count}]"));
            *count += 1;
            lines.push(vec![table.clone()]);
        } else if let Some(inner) = trimmed.strip_prefix('[') {
            table = split_dotted(inner.split(']').next().unwrap_or_default());
            lines.push(vec![table.clone()]);
        } else if let Some(eq) = find_assignment(trimmed) {
            let mut key = table.clone();
            key.extend(split_dotted(&trimmed[..eq]));
            let mut state = ValueState::default();
            state.feed(&trimmed[eq + 1..]);
            lines.push(vec![key.clone()]);
            if state.is_open() {
                pending = Some((key, state));
            }
        } else if table.is_empty() {
            lines.push(Vec::new());
        } else {
            lines.push(vec![table.clone()]);
        }
    }

    KeyIndex::new(lines)
}
