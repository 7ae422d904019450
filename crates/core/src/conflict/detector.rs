//! Conflict detection logic.
//!
//! Changes are grouped per file and swept in `(start_line, end_line)` order;
//! every maximal run of transitively overlapping ranges becomes one
//! [`Conflict`]. Groups are then classified from their line geometry and,
//! for structured files, refined by the owning handler.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::handlers::HandlerRegistry;
use crate::models::{normalize_content, Change};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a conflict group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Identical line ranges, differing content.
    Exact,
    /// One member's range fully contains another's.
    Major,
    /// Ranges overlap without containment.
    Partial,
    /// Partial overlap below the configured threshold.
    Minor,
    /// Overlapping lines but non-overlapping logical keys.
    DisjointKeys,
    /// Identical ranges and equivalent content.
    SemanticDuplicate,
}

impl ConflictType {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Exact | Self::Major => Severity::High,
            Self::Partial => Severity::Medium,
            Self::Minor | Self::DisjointKeys | Self::SemanticDuplicate => Severity::Low,
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Major => write!(f, "major"),
            Self::Partial => write!(f, "partial"),
            Self::Minor => write!(f, "minor"),
            Self::DisjointKeys => write!(f, "disjoint-keys"),
            Self::SemanticDuplicate => write!(f, "semantic-duplicate"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A group of changes to one file whose line ranges overlap transitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub file_path: String,
    /// Smallest start and largest end across the group.
    pub line_range: (usize, usize),
    /// Indices into the batch's change slice, in `(start, end)` order.
    pub changes: Vec<usize>,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub overlap_percentage: f64,
}

impl Conflict {
    fn reclassify(&mut self, conflict_type: ConflictType) {
        self.conflict_type = conflict_type;
        self.severity = conflict_type.severity();
    }
}

/// Result of a detection pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Ordered by file path, then start line.
    pub conflicts: Vec<Conflict>,
    /// Indices of changes in no group, in submission order.
    pub non_conflicting: Vec<usize>,
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Line-range conflict detector.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    partial_threshold: f64,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl ConflictDetector {
    /// `partial_threshold` is the overlap percentage below which a partial
    /// conflict is classified `minor`.
    pub fn new(partial_threshold: f64) -> Self {
        Self { partial_threshold }
    }

    /// Detect conflicts among all `changes`.
    pub fn detect(&self, changes: &[Change]) -> Detection {
        self.detect_subset(changes, 0..changes.len())
    }

    /// Detect conflicts among the changes at `indices` only.
    pub fn detect_subset(
        &self,
        changes: &[Change],
        indices: impl IntoIterator<Item = usize>,
    ) -> Detection {
        let mut by_path: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for idx in indices {
            by_path.entry(changes[idx].path()).or_default().push(idx);
        }
        info!(files = by_path.len(), "detecting conflicts");

        let mut conflicts = Vec::new();
        let mut non_conflicting = Vec::new();

        for (path, mut members) in by_path {
            members.sort_by_key(|&i| (changes[i].start_line(), changes[i].end_line(), i));

            let mut component: Vec<usize> = Vec::new();
            let mut frontier = 0;
            for idx in members {
                let change = &changes[idx];
                if !component.is_empty() && change.start_line() > frontier {
                    self.close_component(path, changes, &mut component, &mut conflicts, &mut non_conflicting);
                }
                frontier = if component.is_empty() {
                    change.end_line()
                } else {
                    frontier.max(change.end_line())
                };
                component.push(idx);
            }
            self.close_component(path, changes, &mut component, &mut conflicts, &mut non_conflicting);
        }

        non_conflicting.sort_unstable();
        info!(
            conflicts = conflicts.len(),
            non_conflicting = non_conflicting.len(),
            "conflict detection complete"
        );
        Detection {
            conflicts,
            non_conflicting,
        }
    }

    fn close_component(
        &self,
        path: &str,
        changes: &[Change],
        component: &mut Vec<usize>,
        conflicts: &mut Vec<Conflict>,
        non_conflicting: &mut Vec<usize>,
    ) {
        match component.len() {
            0 => {}
            1 => non_conflicting.push(component[0]),
            _ => {
                let members = std::mem::take(component);
                let conflict = self.classify(path, changes, members);
                debug!(
                    path,
                    conflict_type = %conflict.conflict_type,
                    members = conflict.changes.len(),
                    overlap = conflict.overlap_percentage,
                    "conflict detected"
                );
                conflicts.push(conflict);
            }
        }
        component.clear();
    }

    /// Classify a connected group by its line geometry.
    pub fn classify(&self, path: &str, changes: &[Change], members: Vec<usize>) -> Conflict {
        let group: Vec<&Change> = members.iter().map(|&i| &changes[i]).collect();
        let start = group.iter().map(|c| c.start_line()).min().unwrap_or(1);
        let end = group.iter().map(|c| c.end_line()).max().unwrap_or(start);

        let same_range = group
            .iter()
            .all(|c| (c.start_line(), c.end_line()) == (group[0].start_line(), group[0].end_line()));
        let contains = |a: &Change, b: &Change| a.start_line() <= b.start_line() && b.end_line() <= a.end_line();

        let mut overlap: f64 = 0.0;
        let mut containment = false;
        for (i, a) in group.iter().enumerate() {
            for b in group.iter().skip(i + 1) {
                if a.overlaps(b) {
                    overlap = overlap.max(overlap_percentage(a, b));
                    containment |= contains(a, b) || contains(b, a);
                }
            }
        }

        let conflict_type = if same_range {
            let canonical = semantic_form(group[0].content());
            if group.iter().all(|c| semantic_form(c.content()) == canonical) {
                ConflictType::SemanticDuplicate
            } else {
                ConflictType::Exact
            }
        } else if containment {
            ConflictType::Major
        } else if overlap < self.partial_threshold {
            ConflictType::Minor
        } else {
            ConflictType::Partial
        };
        if matches!(conflict_type, ConflictType::Exact | ConflictType::Major) {
            overlap = 100.0;
        }

        Conflict {
            file_path: path.to_string(),
            line_range: (start, end),
            changes: members,
            conflict_type,
            severity: conflict_type.severity(),
            overlap_percentage: overlap,
        }
    }

    /// Ask each group's handler whether the members touch disjoint keys and
    /// reclassify those that do as [`ConflictType::DisjointKeys`].
    ///
    /// Semantic duplicates are left alone.
    pub fn refine(
        &self,
        detection: &mut Detection,
        changes: &[Change],
        registry: &HandlerRegistry,
        workspace_root: &Path,
    ) -> usize {
        let mut refined = 0;
        for conflict in &mut detection.conflicts {
            if conflict.conflict_type == ConflictType::SemanticDuplicate {
                continue;
            }
            let handler = registry.handler_for(&conflict.file_path);
            let members: Vec<&Change> = conflict.changes.iter().map(|&i| &changes[i]).collect();
            let full_path = workspace_root.join(&conflict.file_path);
            if let Some(refinement) = handler.detect_structural_conflicts(&full_path, &members) {
                debug!(
                    path = %conflict.file_path,
                    disjoint = refinement.disjoint,
                    footprints = ?refinement.footprints,
                    "structural refinement"
                );
                if refinement.disjoint {
                    conflict.reclassify(ConflictType::DisjointKeys);
                    refined += 1;
                }
            }
        }
        if refined > 0 {
            info!(refined, "conflicts reclassified as disjoint-keys");
        }
        refined
    }
}

/// `intersection / min(len_a, len_b) * 100` for two changes.
pub fn overlap_percentage(a: &Change, b: &Change) -> f64 {
    let lo = a.start_line().max(b.start_line());
    let hi = a.end_line().min(b.end_line());
    if hi < lo {
        return 0.0;
    }
    let intersection = (hi - lo + 1) as f64;
    let shorter = a.line_count().min(b.line_count()) as f64;
    intersection / shorter * 100.0
}

/// Content compared for duplicates: unified line endings, trailing
/// whitespace stripped per line, surrounding blank lines dropped.
fn semantic_form(content: &str) -> String {
    let normalized = normalize_content(content);
    let lines: Vec<&str> = normalized.lines().map(str::trim_end).collect();
    let first = lines.iter().position(|l| !l.is_empty());
    let last = lines.iter().rposition(|l| !l.is_empty());
    match (first, last) {
        (Some(f), Some(l)) => lines[f..=l].join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, start: usize, end: usize, content: &str) -> Change {
        Change::new(path, start, end, content).unwrap()
    }

    #[test]
    fn test_no_conflicts_disjoint_ranges() {
        let changes = vec![
            change("a.rs", 1, 2, "x"),
            change("a.rs", 3, 4, "y"),
            change("b.rs", 1, 4, "z"),
        ];
        let detection = ConflictDetector::default().detect(&changes);
        assert!(detection.conflicts.is_empty());
        assert_eq!(detection.non_conflicting, vec![0, 1, 2]);
    }

    #[test]
    fn test_exact_conflict() {
        let changes = vec![
            change("config.json", 10, 12, "a"),
            change("config.json", 10, 12, "b"),
        ];
        let detection = ConflictDetector::default().detect(&changes);
        assert_eq!(detection.conflicts.len(), 1);
        let conflict = &detection.conflicts[0];
        assert_eq!(conflict.conflict_type, ConflictType::Exact);
        assert_eq!(conflict.severity, Severity::High);
        assert_eq!(conflict.overlap_percentage, 100.0);
        assert_eq!(conflict.line_range, (10, 12));
    }

    #[test]
    fn test_partial_fifty_percent() {
        let changes = vec![change("f.txt", 10, 13, "a"), change("f.txt", 12, 15, "b")];
        let detection = ConflictDetector::default().detect(&changes);
        let conflict = &detection.conflicts[0];
        assert_eq!(conflict.conflict_type, ConflictType::Partial);
        assert_eq!(conflict.severity, Severity::Medium);
        assert_eq!(conflict.overlap_percentage, 50.0);
        assert_eq!(conflict.line_range, (10, 15));
    }

    #[test]
    fn test_minor_below_threshold() {
        let changes = vec![change("f.txt", 1, 20, "a"), change("f.txt", 20, 40, "b")];
        let detection = ConflictDetector::new(10.0).detect(&changes);
        assert_eq!(detection.conflicts[0].conflict_type, ConflictType::Minor);
        assert_eq!(detection.conflicts[0].overlap_percentage, 5.0);

        let detection = ConflictDetector::new(5.0).detect(&changes);
        assert_eq!(detection.conflicts[0].conflict_type, ConflictType::Partial);
    }

    #[test]
    fn test_major_containment() {
        let changes = vec![change("f.txt", 1, 10, "a"), change("f.txt", 3, 4, "b")];
        let detection = ConflictDetector::default().detect(&changes);
        assert_eq!(detection.conflicts[0].conflict_type, ConflictType::Major);
        assert_eq!(detection.conflicts[0].overlap_percentage, 100.0);
    }

    #[test]
    fn test_semantic_duplicate() {
        let changes = vec![
            change("f.txt", 5, 6, "let x = 1;  \r\nlet y = 2;\n"),
            change("f.txt", 5, 6, "\nlet x = 1;\nlet y = 2;"),
        ];
        let detection = ConflictDetector::default().detect(&changes);
        assert_eq!(
            detection.conflicts[0].conflict_type,
            ConflictType::SemanticDuplicate
        );
        assert_eq!(detection.conflicts[0].severity, Severity::Low);
    }

    #[test]
    fn test_transitive_grouping() {
        // 1-3 and 5-7 do not touch each other, 3-5 bridges them.
        let changes = vec![
            change("f.txt", 5, 7, "c"),
            change("f.txt", 1, 3, "a"),
            change("f.txt", 20, 21, "lonely"),
            change("f.txt", 3, 5, "b"),
        ];
        let detection = ConflictDetector::default().detect(&changes);
        assert_eq!(detection.conflicts.len(), 1);
        assert_eq!(detection.conflicts[0].changes, vec![1, 3, 0]);
        assert_eq!(detection.conflicts[0].line_range, (1, 7));
        assert_eq!(detection.non_conflicting, vec![2]);
    }

    #[test]
    fn test_conflicts_ordered_by_path_then_line() {
        let changes = vec![
            change("b.txt", 1, 2, "x"),
            change("b.txt", 2, 3, "y"),
            change("a.txt", 9, 9, "x"),
            change("a.txt", 9, 9, "y"),
            change("a.txt", 1, 1, "x"),
            change("a.txt", 1, 1, "y"),
        ];
        let detection = ConflictDetector::default().detect(&changes);
        let order: Vec<(&str, usize)> = detection
            .conflicts
            .iter()
            .map(|c| (c.file_path.as_str(), c.line_range.0))
            .collect();
        assert_eq!(order, vec![("a.txt", 1), ("a.txt", 9), ("b.txt", 1)]);
    }

    #[test]
    fn test_detect_subset_skips_filtered() {
        let changes = vec![change("f.txt", 1, 3, "a"), change("f.txt", 2, 4, "b")];
        let detection = ConflictDetector::default().detect_subset(&changes, [1]);
        assert!(detection.conflicts.is_empty());
        assert_eq!(detection.non_conflicting, vec![1]);
    }

    #[test]
    fn test_refine_disjoint_json_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("app.json"),
            "{\n  \"server\": {\n    \"port\": 80\n  },\n  \"debug\": false\n}\n",
        )
        .unwrap();
        let changes = vec![
            change("app.json", 3, 4, "    \"port\": 8080\n  },"),
            change("app.json", 4, 5, "  },\n  \"debug\": true"),
        ];
        let detector = ConflictDetector::default();
        let mut detection = detector.detect(&changes);
        assert_eq!(detection.conflicts[0].conflict_type, ConflictType::Partial);

        let refined = detector.refine(
            &mut detection,
            &changes,
            &HandlerRegistry::with_defaults(),
            dir.path(),
        );
        assert_eq!(refined, 1);
        assert_eq!(detection.conflicts[0].conflict_type, ConflictType::DisjointKeys);
        assert_eq!(detection.conflicts[0].severity, Severity::Low);
    }
}
