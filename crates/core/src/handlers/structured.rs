//! Shared machinery for key-value formats.
//!
//! Each structured handler supplies a line scanner that maps every line of
//! a document to the logical key paths it carries. Blank, comment and
//! punctuation-only lines carry none. On top of that index this module
//! computes change footprints, decides whether a conflict group touches
//! disjoint keys, and splices a disjoint group in one pass.

use std::collections::BTreeSet;

use tracing::debug;

use crate::errors::{ApplyError, StructureError};
use crate::handlers::lines::{content_lines, splice_text, LineBuffer};
use crate::handlers::StructuralRefinement;
use crate::models::Change;

/// Logical key path, outermost segment first. Sequence positions are
/// rendered as `[n]`.
pub type KeyPath = Vec<String>;

/// Line scanner of one format.
pub type Scanner = fn(&str) -> KeyIndex;

/// Whole-document parse check of one format.
pub type Parser = fn(&str) -> Result<(), String>;

/// Dotted rendering of a key path; the root renders as `$`.
pub fn display_key(key: &KeyPath) -> String {
    if key.is_empty() {
        "$".to_string()
    } else {
        key.join(".")
    }
}

/// Whether `a` equals `b` or is one of its ancestors.
pub fn is_prefix(a: &KeyPath, b: &KeyPath) -> bool {
    a.len() <= b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// Drop every key that has an ancestor (or duplicate) in the set.
pub fn minimal_keys(keys: impl IntoIterator<Item = KeyPath>) -> Vec<KeyPath> {
    let mut sorted: Vec<KeyPath> = keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
    sorted.sort_by_key(|k| k.len());
    let mut out: Vec<KeyPath> = Vec::new();
    for key in sorted {
        if !out.iter().any(|kept| is_prefix(kept, &key)) {
            out.push(key);
        }
    }
    out.sort();
    out
}

// ---------------------------------------------------------------------------
// Key index
// ---------------------------------------------------------------------------

/// Per-line key paths of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyIndex {
    lines: Vec<Vec<KeyPath>>,
}

impl KeyIndex {
    pub fn new(lines: Vec<Vec<KeyPath>>) -> Self {
        Self { lines }
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Keys carried by 1-based line `n`.
    pub fn line_keys(&self, n: usize) -> &[KeyPath] {
        n.checked_sub(1)
            .and_then(|i| self.lines.get(i))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Keys carried by lines `start..=end`, clamped to the document.
    pub fn keys_in(&self, start: usize, end: usize) -> BTreeSet<KeyPath> {
        (start..=end)
            .flat_map(|n| self.line_keys(n).iter().cloned())
            .collect()
    }

    pub fn all_keys(&self) -> BTreeSet<KeyPath> {
        self.lines.iter().flatten().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Footprints
// ---------------------------------------------------------------------------

/// Keys one change touches in the original and introduces in its result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    pub touched: BTreeSet<KeyPath>,
    pub introduced: BTreeSet<KeyPath>,
}

impl Footprint {
    /// Minimal key set covering both touched and introduced keys.
    pub fn keys(&self) -> Vec<KeyPath> {
        minimal_keys(self.touched.iter().chain(&self.introduced).cloned())
    }

    /// Whether no key of `self` equals or prefixes a key of `other`, or the
    /// other way round.
    pub fn is_disjoint(&self, other: &Footprint) -> bool {
        let ours = self.keys();
        let theirs = other.keys();
        ours.iter()
            .all(|a| theirs.iter().all(|b| !is_prefix(a, b) && !is_prefix(b, a)))
    }
}

/// Compute a change's footprint.
///
/// Introduced keys are read from the change's own lines after splicing it
/// alone into the original, so fragment keys are anchored in their real
/// container.
pub fn footprint(
    path: &str,
    original: &str,
    index: &KeyIndex,
    change: &Change,
    scan: Scanner,
) -> Result<Footprint, StructureError> {
    let (start, end) = (change.start_line(), change.end_line());
    let unmappable = |detail: String| StructureError::Unmappable {
        path: path.to_string(),
        start,
        end,
        detail,
    };

    let spliced =
        splice_text(path, original, change.content(), start, end).map_err(|e| unmappable(e.to_string()))?;
    let touched = index.keys_in(start, end.min(index.line_count()));

    let new_lines = content_lines(change.content()).len();
    let introduced = if new_lines == 0 {
        BTreeSet::new()
    } else {
        scan(&spliced).keys_in(start, start + new_lines - 1)
    };

    Ok(Footprint {
        touched,
        introduced,
    })
}

/// Decide whether a conflict group touches disjoint logical keys.
///
/// `None` when any member cannot be mapped.
pub fn refine(
    path: &str,
    original: &str,
    changes: &[&Change],
    scan: Scanner,
) -> Option<StructuralRefinement> {
    let index = scan(original);
    let mut footprints = Vec::with_capacity(changes.len());
    for change in changes {
        match footprint(path, original, &index, change, scan) {
            Ok(fp) => footprints.push(fp),
            Err(e) => {
                debug!(path, error = %e, "cannot map change to keys");
                return None;
            }
        }
    }

    let keys_disjoint = footprints.iter().enumerate().all(|(i, a)| {
        footprints
            .iter()
            .skip(i + 1)
            .all(|b| a.is_disjoint(b))
    });

    // Members without keys (comments, blank lines, appends) pass the key
    // test trivially; the group only counts as disjoint if it splices.
    let disjoint = keys_disjoint
        && match trimmed_edits(path, original, changes) {
            Ok(_) => true,
            Err(e) => {
                debug!(path, error = %e, "key-disjoint group cannot be spliced");
                false
            }
        };

    Some(StructuralRefinement {
        disjoint,
        footprints: footprints
            .iter()
            .map(|fp| fp.keys().iter().map(display_key).collect())
            .collect(),
    })
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// One member after its shared edge lines were trimmed. Zero-based,
/// half-open line range; `from == to` is a pure insertion.
#[derive(Debug)]
struct TrimmedEdit {
    fingerprint: String,
    from: usize,
    to: usize,
    lines: Vec<String>,
}

impl TrimmedEdit {
    fn is_insertion(&self) -> bool {
        self.from == self.to
    }
}

fn trim_member(
    buffer: &LineBuffer,
    changes: &[&Change],
    i: usize,
) -> TrimmedEdit {
    let change = changes[i];
    let shared = |n: usize| {
        changes
            .iter()
            .enumerate()
            .any(|(j, other)| j != i && other.start_line() <= n && n <= other.end_line())
    };
    let same = |a: &str, n: usize| buffer.line(n).is_some_and(|orig| orig.trim() == a.trim());

    let mut lo = change.start_line();
    let mut hi = change.end_line().min(buffer.len());
    let mut body = content_lines(change.content());

    while lo <= hi && shared(lo) && body.first().is_some_and(|l| same(l, lo)) {
        body.remove(0);
        lo += 1;
    }
    while hi >= lo && shared(hi) && body.last().is_some_and(|l| same(l, hi)) {
        body.pop();
        hi -= 1;
    }

    TrimmedEdit {
        fingerprint: change.fingerprint().to_string(),
        from: lo - 1,
        to: hi.max(lo - 1),
        lines: body,
    }
}

/// Trim every member of a group and check that the trimmed ranges no longer
/// overlap. Edits come back sorted top-down.
fn trimmed_edits(
    path: &str,
    original: &str,
    changes: &[&Change],
) -> Result<(LineBuffer, Vec<TrimmedEdit>), ApplyError> {
    let buffer = LineBuffer::parse(original);
    for change in changes {
        buffer.check_range(path, change.start_line(), change.end_line())?;
    }

    let mut edits: Vec<TrimmedEdit> = (0..changes.len())
        .map(|i| trim_member(&buffer, changes, i))
        .filter(|e| !(e.is_insertion() && e.lines.is_empty()))
        .collect();

    edits.sort_by_key(|e| (e.from, e.to));
    let mut max_to = 0;
    for pair in edits.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        max_to = max_to.max(a.to);
        let stacked_insertions = a.is_insertion() && b.is_insertion() && a.from == b.from;
        if max_to > b.from || stacked_insertions {
            return Err(StructureError::KeyCollision {
                path: path.to_string(),
                detail: format!(
                    "changes {} and {} still overlap after trimming shared lines",
                    a.fingerprint, b.fingerprint
                ),
            }
            .into());
        }
    }
    Ok((buffer, edits))
}

/// Splice a disjoint-keys group into `original` in one pass.
///
/// Each member sheds the edge lines it shares with another member when its
/// content repeats them unchanged. The trimmed ranges must not overlap. The
/// result must parse and carry every key a member introduces.
pub fn merge_disjoint(
    path: &str,
    format: &str,
    original: &str,
    changes: &[&Change],
    scan: Scanner,
    parse: Parser,
) -> Result<String, ApplyError> {
    let (mut buffer, mut edits) = trimmed_edits(path, original, changes)?;

    let index = scan(original);
    let mut expected: BTreeSet<KeyPath> = BTreeSet::new();
    for change in changes {
        expected.extend(footprint(path, original, &index, change, scan)?.introduced);
    }

    // Bottom-up; a replacement goes before an insertion at the same line so
    // the insertion lands above it.
    edits.sort_by(|a, b| {
        b.from
            .cmp(&a.from)
            .then(a.is_insertion().cmp(&b.is_insertion()))
    });
    for edit in edits {
        buffer.replace(edit.from, edit.to, edit.lines);
    }
    let merged = buffer.render();

    parse(&merged).map_err(|detail| StructureError::Parse {
        path: path.to_string(),
        format: format.to_string(),
        detail,
    })?;

    let present = scan(&merged).all_keys();
    if let Some(missing) = expected.iter().find(|k| !present.contains(*k)) {
        return Err(StructureError::MissingKey {
            path: path.to_string(),
            key: display_key(missing),
        }
        .into());
    }

    debug!(path, members = changes.len(), "merged disjoint-keys group");
    Ok(merged)
}

/// Render a single change and check the whole document still parses.
pub fn render_checked(
    path: &str,
    format: &str,
    original: &str,
    content: &str,
    start: usize,
    end: usize,
    parse: Parser,
) -> Result<String, ApplyError> {
    let updated = splice_text(path, original, content, start, end)?;
    parse(&updated).map_err(|detail| StructureError::Parse {
        path: path.to_string(),
        format: format.to_string(),
        detail,
    })?;
    Ok(updated)
}
