//! YAML handler.
//!
//! Keys are mapped by indentation. Comments, anchors and aliases stay in
//! place because every edit is a line splice; only the touched lines change.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::errors::{ApplyError, ValidationError};
use crate::handlers::structured::{self, KeyIndex, KeyPath};
use crate::handlers::{read_target, reject_conflict_markers, FileHandler, StructuralRefinement};
use crate::models::{Change, FileType};

const FORMAT: &str = "yaml";

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlHandler;

impl FileHandler for YamlHandler {
    fn name(&self) -> &'static str {
        FORMAT
    }

    fn can_handle(&self, path: &str) -> bool {
        FileType::from_path(path) == FileType::Yaml
    }

    fn validate_change(
        &self,
        path: &str,
        content: &str,
        _start: usize,
        _end: usize,
    ) -> Result<(), ValidationError> {
        reject_conflict_markers(path, content)?;
        let invalid = |detail: String| ValidationError::InvalidContent {
            path: path.to_string(),
            format: FORMAT.to_string(),
            detail,
        };

        if let Some(n) = content
            .lines()
            .position(|l| l.chars().take_while(|c| c.is_whitespace()).any(|c| c == '\t'))
        {
            return Err(invalid(format!("tab indentation on fragment line {}", n + 1)));
        }
        parse_document(&dedent(content)).map_err(invalid)
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

/// Parse every document of a (possibly multi-document) stream.
pub fn parse_document(text: &str) -> Result<(), String> {
    for doc in serde_yaml::Deserializer::from_str(text) {
        serde_yaml::Value::deserialize(doc).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Remove the indentation common to all non-blank lines.
fn dedent(content: &str) -> String {
    let common = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    content
        .lines()
        .map(|l| l.get(common..).unwrap_or("").trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Key scanner
// ---------------------------------------------------------------------------

struct Entry {
    indent: usize,
    segment: String,
    is_item: bool,
}

fn current_path(stack: &[Entry]) -> KeyPath {
    stack.iter().map(|e| e.segment.clone()).collect()
}

/// Split `key: value` outside quotes. Flow collections and plain scalars
/// yield `None`.
fn split_key(rest: &str) -> Option<(String, &str)> {
    if rest.starts_with('{') || rest.starts_with('[') || rest.starts_with('#') {
        return None;
    }
    let (key, after) = if let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') {
        let close = rest[1..].find(quote)? + 1;
        (rest[1..close].to_string(), &rest[close + 1..])
    } else {
        let colon = rest
            .match_indices(':')
            .map(|(i, _)| i)
            .find(|&i| rest[i + 1..].is_empty() || rest[i + 1..].starts_with([' ', '\t']))?;
        (rest[..colon].trim_end().to_string(), &rest[colon..])
    };
    let value = after.trim_start().strip_prefix(':')?;
    if key.is_empty() || key.contains(" #") {
        return None;
    }
    Some((key, value.trim()))
}

fn is_block_indicator(value: &str) -> bool {
    let head = value.split_whitespace().find(|t| !t.starts_with('&') && !t.starts_with('!'));
    head.is_some_and(|t| t.starts_with('|') || t.starts_with('>'))
}

/// Map each line to the key path owning it, by indentation.
pub fn scan_keys(text: &str) -> KeyIndex {
    let mut lines: Vec<Vec<KeyPath>> = Vec::new();
    let mut stack: Vec<Entry> = Vec::new();
    let mut seq_next: HashMap<(KeyPath, usize), usize> = HashMap::new();
    let mut block_owner: Option<usize> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();

        if let Some(owner) = block_owner {
            if trimmed.is_empty() {
                lines.push(Vec::new());
                continue;
            }
            if indent > owner {
                lines.push(vec![current_path(&stack)]);
                continue;
            }
            block_owner = None;
        }

        let trimmed = trimmed.trim_end();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('%') {
            lines.push(Vec::new());
            continue;
        }
        if trimmed == "---" || trimmed.starts_with("--- ") || trimmed == "..." {
            stack.clear();
            seq_next.clear();
            lines.push(Vec::new());
            continue;
        }

        let is_item = trimmed == "-" || trimmed.starts_with("- ");
        while let Some(top) = stack.last() {
            let keep_parent = is_item && top.indent == indent && !top.is_item;
            if top.indent > indent || (top.indent == indent && !keep_parent) {
                stack.pop();
            } else {
                break;
            }
        }

        let mut rest = trimmed;
        let mut col = indent;
        while rest == "-" || rest.starts_with("- ") {
            let parent = current_path(&stack);
            let counter = seq_next.entry((parent, col)).or_insert(0);
            let index = *counter;
            *counter += 1;
            stack.push(Entry {
                indent: col,
                segment: format!("[{index}]"),
                is_item: true,
            });
            let after = &rest[1..];
            let body = after.trim_start();
            col += 1 + (after.len() - body.len());
            rest = body;
        }

        let mut keys = Vec::new();
        if let Some((key, value)) = split_key(rest) {
            stack.push(Entry {
                indent: col,
                segment: key,
                is_item: false,
            });
            let path = current_path(&stack);
            seq_next.retain(|(parent, _), _| !structured::is_prefix(&path, parent));
            if is_block_indicator(value) {
                block_owner = Some(col);
            }
            keys.push(path);
        } else if !stack.is_empty() {
            keys.push(current_path(&stack));
        }
        lines.push(keys);
    }

    KeyIndex::new(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::structured::display_key;

    const DOC: &str = "\
# service definition
defaults: &defaults
  retries: 3
service:
  <<: *defaults
  name: api
  ports:
  - 80
  - 443
  script: |
    echo start: now
    run
  env:
    - name: A
      value: '1'
";

    fn keys_on(index: &KeyIndex, n: usize) -> Vec<String> {
        index.line_keys(n).iter().map(display_key).collect()
    }

    #[test]
    fn test_scan_keys_by_indentation() {
        let index = scan_keys(DOC);
        assert!(keys_on(&index, 1).is_empty());
        assert_eq!(keys_on(&index, 2), vec!["defaults"]);
        assert_eq!(keys_on(&index, 3), vec!["defaults.retries"]);
        assert_eq!(keys_on(&index, 5), vec!["service.<<"]);
        assert_eq!(keys_on(&index, 6), vec!["service.name"]);
        assert_eq!(keys_on(&index, 8), vec!["service.ports.[0]"]);
        assert_eq!(keys_on(&index, 9), vec!["service.ports.[1]"]);
        assert_eq!(keys_on(&index, 11), vec!["service.script"]);
        assert_eq!(keys_on(&index, 12), vec!["service.script"]);
        assert_eq!(keys_on(&index, 14), vec!["service.env.[0].name"]);
        assert_eq!(keys_on(&index, 15), vec!["service.env.[0].value"]);
    }

    #[test]
    fn test_validate_fragment() {
        let h = YamlHandler;
        assert!(h.validate_change("a.yml", "    name: api\n    port: 80", 1, 2).is_ok());
        assert!(h.validate_change("a.yml", "  - 80\n  - 443", 1, 2).is_ok());
        assert!(matches!(
            h.validate_change("a.yml", "\tname: api", 1, 1),
            Err(ValidationError::InvalidContent { .. })
        ));
        assert!(matches!(
            h.validate_change("a.yml", "name: [unclosed", 1, 1),
            Err(ValidationError::InvalidContent { .. })
        ));
    }

    #[test]
    fn test_merge_keeps_comments_and_anchors() {
        let a = Change::new("svc.yaml", 6, 7, "  name: web\n  ports:").unwrap();
        let b = Change::new("svc.yaml", 7, 9, "  ports:\n  - 8080\n  - 8443").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.yaml");
        std::fs::write(&path, DOC).unwrap();

        let refinement = YamlHandler
            .detect_structural_conflicts(&path, &[&a, &b])
            .unwrap();
        // Both ranges carry the `ports` key line.
        assert!(!refinement.disjoint);

        let c = Change::new("svc.yaml", 3, 3, "  retries: 5").unwrap();
        let d = Change::new("svc.yaml", 6, 6, "  name: web").unwrap();
        let merged = YamlHandler.render_merge("svc.yaml", DOC, &[&c, &d]).unwrap();
        assert!(merged.starts_with("# service definition\ndefaults: &defaults\n  retries: 5\n"));
        assert!(merged.contains("  <<: *defaults\n  name: web\n"));
    }

    #[test]
    fn test_keyless_lines_rewritten_differently_are_not_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "# old note\nname: api\nport: 80\n").unwrap();

        let a = Change::new("app.yaml", 1, 1, "# note A").unwrap();
        let b = Change::new("app.yaml", 1, 1, "# note B").unwrap();
        let refinement = YamlHandler
            .detect_structural_conflicts(&path, &[&a, &b])
            .unwrap();
        assert!(!refinement.disjoint);
    }

    #[test]
    fn test_stacked_appends_are_not_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "name: api\n").unwrap();

        let a = Change::new("app.yaml", 2, 2, "port: 80").unwrap();
        let b = Change::new("app.yaml", 2, 2, "debug: true").unwrap();
        let refinement = YamlHandler
            .detect_structural_conflicts(&path, &[&a, &b])
            .unwrap();
        // The keys differ but both edits insert at the same point.
        assert_eq!(refinement.footprints[0], vec!["port"]);
        assert_eq!(refinement.footprints[1], vec!["debug"]);
        assert!(!refinement.disjoint);
    }
}
