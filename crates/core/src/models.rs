//! Domain model types used throughout reviewapply.
//!
//! A [`Change`] is one proposed edit: replace lines `start_line..=end_line`
//! of `path` with `content`. Changes are created once by whatever ingests
//! review suggestions and are never mutated afterwards; conflicts and
//! resolutions refer to them by their index in the batch slice.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::ValidationError;

// ---------------------------------------------------------------------------
// File type
// ---------------------------------------------------------------------------

/// Format of the target file, derived from its extension.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Json,
    Yaml,
    Toml,
    PlainText,
}

impl FileType {
    /// Derive the file type from a path's extension.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let ext = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") => Self::Json,
            Some("yaml") | Some("yml") => Self::Yaml,
            Some("toml") => Self::Toml,
            _ => Self::PlainText,
        }
    }

    /// Whether the format is a key-value structured format.
    pub fn is_structured(&self) -> bool {
        !matches!(self, Self::PlainText)
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Yaml => write!(f, "yaml"),
            Self::Toml => write!(f, "toml"),
            Self::PlainText => write!(f, "plain_text"),
        }
    }
}

// ---------------------------------------------------------------------------
// Change category
// ---------------------------------------------------------------------------

/// Metadata key carrying the change category.
pub const CATEGORY_KEY: &str = "category";

/// Provenance category of a change, used for priority arbitration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeCategory {
    /// Explicitly picked by a human among alternatives.
    UserSelection,
    SecurityFix,
    SyntaxError,
    RegularSuggestion,
    Formatting,
}

impl Default for ChangeCategory {
    fn default() -> Self {
        Self::RegularSuggestion
    }
}

impl ChangeCategory {
    /// Parse a category label. Accepts kebab-case, snake_case and a few
    /// short aliases.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "user-selection" | "user" | "selected" => Some(Self::UserSelection),
            "security-fix" | "security" => Some(Self::SecurityFix),
            "syntax-error" | "syntax" => Some(Self::SyntaxError),
            "regular-suggestion" | "suggestion" | "regular" => Some(Self::RegularSuggestion),
            "formatting" | "format" | "style" => Some(Self::Formatting),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserSelection => write!(f, "user-selection"),
            Self::SecurityFix => write!(f, "security-fix"),
            Self::SyntaxError => write!(f, "syntax-error"),
            Self::RegularSuggestion => write!(f, "regular-suggestion"),
            Self::Formatting => write!(f, "formatting"),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization & fingerprint
// ---------------------------------------------------------------------------

/// Canonical relative form of a path: forward slashes, no empty or `.`
/// segments, `..` resolved lexically. Leading `..` segments are kept so the
/// file policy can reject paths escaping the workspace.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}

/// Unify line endings. All other whitespace is significant.
pub fn normalize_content(content: &str) -> String {
    content.replace("\r\n", "\n")
}

/// Deterministic 16-hex-character identity of a proposed edit.
///
/// Collisions are not detected.
pub fn fingerprint(path: &str, start_line: usize, end_line: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_path(path).as_bytes());
    hasher.update([0u8]);
    hasher.update(start_line.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(end_line.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_content(content).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// Wire form of a change, as produced by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// One proposed edit. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ChangeRecord")]
pub struct Change {
    path: String,
    start_line: usize,
    end_line: usize,
    content: String,
    metadata: BTreeMap<String, String>,
    fingerprint: String,
    file_type: FileType,
}

impl Change {
    /// Create a change with empty metadata.
    pub fn new(
        path: &str,
        start_line: usize,
        end_line: usize,
        content: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::with_metadata(path, start_line, end_line, content, BTreeMap::new())
    }

    /// Create a change carrying provenance metadata.
    pub fn with_metadata(
        path: &str,
        start_line: usize,
        end_line: usize,
        content: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self, ValidationError> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(ValidationError::EmptyPath);
        }
        if start_line == 0 || start_line > end_line {
            return Err(ValidationError::InvalidRange {
                path,
                start: start_line,
                end: end_line,
            });
        }
        let content = content.into();
        let fingerprint = fingerprint(&path, start_line, end_line, &content);
        let file_type = FileType::from_path(&path);
        Ok(Self {
            path,
            start_line,
            end_line,
            content,
            metadata,
            fingerprint,
            file_type,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
    pub fn start_line(&self) -> usize {
        self.start_line
    }
    pub fn end_line(&self) -> usize {
        self.end_line
    }
    pub fn content(&self) -> &str {
        &self.content
    }
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Number of lines in the replaced range.
    pub fn line_count(&self) -> usize {
        self.end_line - self.start_line + 1
    }

    /// Category from the `category` metadata key; unknown or missing labels
    /// fall back to [`ChangeCategory::RegularSuggestion`].
    pub fn category(&self) -> ChangeCategory {
        self.metadata
            .get(CATEGORY_KEY)
            .and_then(|label| ChangeCategory::from_label(label))
            .unwrap_or_default()
    }

    /// Whether this change's range intersects `other`'s.
    pub fn overlaps(&self, other: &Change) -> bool {
        self.start_line <= other.end_line && other.start_line <= self.end_line
    }
}

impl TryFrom<ChangeRecord> for Change {
    type Error = ValidationError;

    fn try_from(record: ChangeRecord) -> Result<Self, Self::Error> {
        Self::with_metadata(
            &record.path,
            record.start_line,
            record.end_line,
            record.content,
            record.metadata,
        )
    }
}

// ---------------------------------------------------------------------------
// Outcomes & batch result
// ---------------------------------------------------------------------------

/// What happened to one submitted change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChangeOutcome {
    Applied,
    Skipped { reason: String },
    Failed { reason: String },
}

impl ChangeOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Applied => None,
            Self::Skipped { reason } | Self::Failed { reason } => Some(reason),
        }
    }

    /// Short label for tables and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A change together with its outcome, reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeReport {
    /// Position in the submitted batch.
    pub index: usize,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub fingerprint: String,
    pub outcome: ChangeOutcome,
}

impl ChangeReport {
    pub fn new(index: usize, change: &Change, outcome: ChangeOutcome) -> Self {
        Self {
            index,
            path: change.path().to_string(),
            start_line: change.start_line(),
            end_line: change.end_line(),
            fingerprint: change.fingerprint().to_string(),
            outcome,
        }
    }

    /// Report for a record that never became a [`Change`].
    pub fn rejected(index: usize, record: &ChangeRecord, reason: impl Into<String>) -> Self {
        let path = normalize_path(&record.path);
        let fingerprint = fingerprint(&path, record.start_line, record.end_line, &record.content);
        Self {
            index,
            path,
            start_line: record.start_line,
            end_line: record.end_line,
            fingerprint,
            outcome: ChangeOutcome::skipped(reason),
        }
    }
}

/// Batch-level aggregate handed to reporting layers.
///
/// Counts reflect what the engine did to each change. When the batch was
/// rolled back afterwards (`BatchReport::rolled_back`), applied changes were
/// undone on disk but still count as applied here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub applied_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub conflict_count: usize,
    /// `applied / considered * 100`, always within `[0, 100]`.
    pub success_rate: f64,
}

impl ResolutionResult {
    /// Aggregate outcomes.
    ///
    /// `policy_skipped` is the number of changes skipped because
    /// `skip_all_conflicts` is active; they are removed from the denominator.
    /// It must be zero when that policy is off. An empty denominator yields
    /// a rate of 100.
    pub fn from_outcomes(
        outcomes: &[ChangeOutcome],
        conflict_count: usize,
        policy_skipped: usize,
    ) -> Self {
        let applied_count = outcomes.iter().filter(|o| o.is_applied()).count();
        let skipped_count = outcomes
            .iter()
            .filter(|o| matches!(o, ChangeOutcome::Skipped { .. }))
            .count();
        let failed_count = outcomes
            .iter()
            .filter(|o| matches!(o, ChangeOutcome::Failed { .. }))
            .count();

        let considered = outcomes.len().saturating_sub(policy_skipped);
        let success_rate = if considered == 0 {
            100.0
        } else {
            (applied_count as f64 / considered as f64 * 100.0).clamp(0.0, 100.0)
        };

        Self {
            applied_count,
            skipped_count,
            failed_count,
            conflict_count,
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src//main.rs"), "src/main.rs");
        assert_eq!(normalize_path("src\\lib\\mod.rs"), "src/lib/mod.rs");
        assert_eq!(normalize_path("a/b/../c"), "a/c");
        assert_eq!(normalize_path("/etc/app.toml"), "etc/app.toml");
        assert_eq!(normalize_path("../outside.txt"), "../outside.txt");
        assert_eq!(normalize_path("a/../../b"), "../b");
    }

    #[test]
    fn test_fingerprint_is_pure() {
        let a = fingerprint("config.json", 10, 12, "{\"a\": 1}");
        let b = fingerprint("./config.json", 10, 12, "{\"a\": 1}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_sensitive_to_content_and_range() {
        let base = fingerprint("f.txt", 1, 2, "hello world");
        assert_ne!(base, fingerprint("f.txt", 1, 2, "hello  world"));
        assert_ne!(base, fingerprint("f.txt", 1, 2, "hello world "));
        assert_ne!(base, fingerprint("f.txt", 1, 3, "hello world"));
        assert_ne!(base, fingerprint("g.txt", 1, 2, "hello world"));
        // Line endings are normalized.
        assert_eq!(
            fingerprint("f.txt", 1, 2, "a\r\nb"),
            fingerprint("f.txt", 1, 2, "a\nb")
        );
    }

    #[test]
    fn test_change_rejects_bad_ranges() {
        assert!(matches!(
            Change::new("a.txt", 0, 1, "x"),
            Err(ValidationError::InvalidRange { .. })
        ));
        assert!(matches!(
            Change::new("a.txt", 5, 4, "x"),
            Err(ValidationError::InvalidRange { .. })
        ));
        assert_eq!(Change::new("./", 1, 1, "x"), Err(ValidationError::EmptyPath));
        assert!(Change::new("a.txt", 3, 3, "x").is_ok());
    }

    #[test]
    fn test_change_derives_type_and_category() {
        let mut meta = BTreeMap::new();
        meta.insert(CATEGORY_KEY.to_string(), "security_fix".to_string());
        let change = Change::with_metadata("deploy/app.YML", 1, 2, "a: 1", meta).unwrap();
        assert_eq!(change.file_type(), FileType::Yaml);
        assert_eq!(change.category(), ChangeCategory::SecurityFix);

        let plain = Change::new("README.md", 1, 1, "x").unwrap();
        assert_eq!(plain.file_type(), FileType::PlainText);
        assert_eq!(plain.category(), ChangeCategory::RegularSuggestion);
    }

    #[test]
    fn test_change_deserializes_from_record() {
        let json = r#"[
            {"path": "./a.toml", "start_line": 2, "end_line": 3, "content": "x = 1",
             "metadata": {"category": "formatting", "author": "bot"}},
            {"path": "b.txt", "start_line": 1, "end_line": 1, "content": ""}
        ]"#;
        let changes: Vec<Change> = serde_json::from_str(json).unwrap();
        assert_eq!(changes[0].path(), "a.toml");
        assert_eq!(changes[0].file_type(), FileType::Toml);
        assert_eq!(changes[0].category(), ChangeCategory::Formatting);
        assert_eq!(changes[0].fingerprint(), fingerprint("a.toml", 2, 3, "x = 1"));
        assert!(changes[1].metadata().is_empty());

        let bad = r#"[{"path": "a.txt", "start_line": 4, "end_line": 1, "content": ""}]"#;
        assert!(serde_json::from_str::<Vec<Change>>(bad).is_err());
        let records: Vec<ChangeRecord> = serde_json::from_str(bad).unwrap();
        assert!(Change::try_from(records[0].clone()).is_err());
    }

    #[test]
    fn test_rejected_record_report() {
        let record = ChangeRecord {
            path: "./a.txt".to_string(),
            start_line: 4,
            end_line: 1,
            content: "x".to_string(),
            metadata: BTreeMap::new(),
        };
        let report = ChangeReport::rejected(2, &record, "invalid range");
        assert_eq!(report.index, 2);
        assert_eq!(report.path, "a.txt");
        assert_eq!(report.fingerprint, fingerprint("a.txt", 4, 1, "x"));
        assert_eq!(report.outcome, ChangeOutcome::skipped("invalid range"));
    }

    #[test]
    fn test_success_rate_empty_batch() {
        let result = ResolutionResult::from_outcomes(&[], 0, 0);
        assert_eq!(result.success_rate, 100.0);
    }

    #[test]
    fn test_success_rate_counts() {
        let outcomes = vec![
            ChangeOutcome::Applied,
            ChangeOutcome::skipped("dup"),
            ChangeOutcome::failed("io"),
            ChangeOutcome::Applied,
        ];
        let result = ResolutionResult::from_outcomes(&outcomes, 1, 0);
        assert_eq!(result.applied_count, 2);
        assert_eq!(result.skipped_count, 1);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.success_rate, 50.0);
    }

    #[test]
    fn test_success_rate_excludes_policy_skips() {
        let outcomes = vec![
            ChangeOutcome::skipped("manual review"),
            ChangeOutcome::skipped("manual review"),
        ];
        let result = ResolutionResult::from_outcomes(&outcomes, 1, 2);
        assert_eq!(result.success_rate, 100.0);

        let outcomes = vec![
            ChangeOutcome::Applied,
            ChangeOutcome::skipped("manual review"),
            ChangeOutcome::skipped("manual review"),
        ];
        let result = ResolutionResult::from_outcomes(&outcomes, 1, 2);
        assert_eq!(result.success_rate, 100.0);
    }
}
