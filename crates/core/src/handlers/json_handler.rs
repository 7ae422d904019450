//! JSON handler.

use std::path::Path;

use tracing::debug;

use crate::errors::{ApplyError, ValidationError};
use crate::handlers::structured::{self, KeyIndex, KeyPath};
use crate::handlers::{read_target, reject_conflict_markers, FileHandler, StructuralRefinement};
use crate::models::{Change, FileType};

const FORMAT: &str = "json";

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHandler;

impl FileHandler for JsonHandler {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn can_handle(&self, path: &str) -> bool {
        FileType::from_path(path) == FileType::Json
    }

    fn validate_change(
        &self,
        path: &str,
        content: &str,
        _start: usize,
        _end: usize,
    ) -> Result<(), ValidationError> {
        reject_conflict_markers(path, content)?;
        validate_fragment(content).map_err(|detail| ValidationError::InvalidContent {
            path: path.to_string(),
            format: FORMAT.to_string(),
            detail,
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
    serde_json::from_str::<serde_json::Value>(text)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Fragment validation
// ---------------------------------------------------------------------------

/// Accept a value, a run of object members, or a run of array elements.
///
/// Unbalanced brackets at the edges are completed with synthetic openers
/// and closers, and dangling edge commas are dropped, before wrapping.
fn validate_fragment(content: &str) -> Result<(), String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    let first_err = match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(_) => return Ok(()),
        Err(e) => e.to_string(),
    };

    let body = trimmed.trim_matches(|c: char| c == ',' || c.is_whitespace());
    if body.is_empty() {
        return Ok(());
    }
    let (closers, openers) = unbalanced(body);
    if body.chars().all(|c| "{}[],".contains(c) || c.is_whitespace()) {
        return Ok(());
    }

    for wrapper in ['{', '['] {
        let mut text = String::new();
        text.push(wrapper);
        let mut ctx = wrapper;
        for closer in closers.iter().rev() {
            if ctx == '{' {
                text.push_str("\"_\":");
            }
            let opener = if *closer == '}' { '{' } else { '[' };
            text.push(opener);
            ctx = opener;
        }
        let inner = if closers.is_empty() {
            body
        } else {
            body.trim_start_matches(|c: char| c == ',' || c.is_whitespace())
        };
        text.push_str(inner.trim_end_matches(|c: char| c == ',' || c.is_whitespace()));
        for opener in openers.iter().rev() {
            text.push(if *opener == '{' { '}' } else { ']' });
        }
        text.push(if wrapper == '{' { '}' } else { ']' });

        if serde_json::from_str::<serde_json::Value>(&text).is_ok() {
            return Ok(());
        }
    }
    Err(first_err)
}

/// Unmatched closers (in encounter order) and still-open openers, ignoring
/// brackets inside strings.
fn unbalanced(text: &str) -> (Vec<char>, Vec<char>) {
    let mut closers = Vec::new();
    let mut open: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => open.push(c),
            '}' | ']' => {
                if open.pop().is_none() {
                    closers.push(c);
                }
            }
            _ => {}
        }
    }
    (closers, open)
}

// ---------------------------------------------------------------------------
// Key scanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open(char),
    Close,
    Colon,
    Comma,
    Str(String),
    Scalar,
}

fn tokenize(text: &str) -> Vec<(usize, Token)> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 0;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            '{' | '[' => tokens.push((line, Token::Open(c))),
            '}' | ']' => tokens.push((line, Token::Close)),
            ':' => tokens.push((line, Token::Colon)),
            ',' => tokens.push((line, Token::Comma)),
            '"' => {
                let start_line = line;
                let mut s = String::new();
                let mut escaped = false;
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        line += 1;
                    }
                    if escaped {
                        s.push(ch);
                        escaped = false;
                    } else if ch == '\\' {
                        escaped = true;
                    } else if ch == '"' {
                        break;
                    } else {
                        s.push(ch);
                    }
                }
                tokens.push((start_line, Token::Str(s)));
            }
            c if c.is_whitespace() => {}
            _ => {
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || "{}[],:\"".contains(next) {
                        break;
                    }
                    chars.next();
                }
                tokens.push((line, Token::Scalar));
            }
        }
    }
    tokens
}

enum Frame {
    Object {
        path: KeyPath,
        key: Option<String>,
        expect_key: bool,
    },
    Array {
        path: KeyPath,
        index: usize,
    },
}

/// Path of a value appearing at the current position.
fn value_path(stack: &[Frame]) -> Option<KeyPath> {
    match stack.last()? {
        Frame::Object { path, key, .. } => {
            let mut p = path.clone();
            p.extend(key.clone());
            Some(p)
        }
        Frame::Array { path, index } => {
            let mut p = path.clone();
            p.push(format!("[{index}]"));
            Some(p)
        }
    }
}

/// Map each line to the key paths of the keys and scalar values on it.
pub fn scan_keys(text: &str) -> KeyIndex {
    let mut lines: Vec<Vec<KeyPath>> = vec![Vec::new(); text.lines().count().max(1)];
    let mut stack: Vec<Frame> = Vec::new();

    let mut record = |line: usize, key: KeyPath| {
        if let Some(slot) = lines.get_mut(line) {
            if !slot.contains(&key) {
                slot.push(key);
            }
        }
    };

    for (line, token) in tokenize(text) {
        match token {
            Token::Str(s) => match stack.last_mut() {
                Some(Frame::Object {
                    path,
                    key,
                    expect_key,
                }) if *expect_key => {
                    let mut p = path.clone();
                    p.push(s.clone());
                    *key = Some(s);
                    *expect_key = false;
                    record(line, p);
                }
                _ => {
                    if let Some(p) = value_path(&stack) {
                        record(line, p);
                    }
                }
            },
            Token::Scalar => {
                if let Some(p) = value_path(&stack) {
                    record(line, p);
                }
            }
            Token::Open(c) => {
                let path = value_path(&stack).unwrap_or_default();
                stack.push(if c == '{' {
                    Frame::Object {
                        path,
                        key: None,
                        expect_key: true,
                    }
                } else {
                    Frame::Array { path, index: 0 }
                });
            }
            Token::Close => {
                stack.pop();
            }
            Token::Colon => {}
            Token::Comma => match stack.last_mut() {
                Some(Frame::Object { expect_key, .. }) => *expect_key = true,
                Some(Frame::Array { index, .. }) => *index += 1,
                None => {}
            },
        }
    }

    KeyIndex::new(lines)
}
