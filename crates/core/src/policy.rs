//! File-policy enforcement ahead of conflict detection.
//!
//! [`FilePolicy`] encapsulates `max_file_size` and `ignore_patterns` from
//! the `[policy]` config section and evaluates every change's target before
//! anything else looks at it.
//!
//! # Decision model
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Path escapes the workspace root | `Escapes` |
//! | Path matches an ignore pattern | `Ignored` |
//! | Size exceeds `max_file_size` (when > 0) | `Oversize` |
//! | None of the above | `Allow` |
//!
//! Blocked changes are recorded as skipped with the decision's
//! [`ValidationError`] message and never reach the detector.

use std::path::Path;

use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::errors::ValidationError;
use crate::models::normalize_path;

// ---------------------------------------------------------------------------
// Decision enum
// ---------------------------------------------------------------------------

/// The outcome of evaluating a path against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePolicyDecision {
    /// Path passes all checks.
    Allow,
    /// Path resolves outside the workspace root.
    Escapes,
    /// Path matches an ignore pattern.
    Ignored { pattern: String },
    /// File exceeds the configured `max_file_size`.
    Oversize { size: u64, limit: u64 },
}

impl FilePolicyDecision {
    /// `true` if the file is blocked.
    pub fn is_blocked(&self) -> bool {
        !matches!(self, Self::Allow)
    }

    /// Short human-readable label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Escapes => "escapes",
            Self::Ignored { .. } => "ignored",
            Self::Oversize { .. } => "oversize",
        }
    }

    /// Convert a blocking decision into the validation error recorded for
    /// the change. `Allow` maps to `Ok(())`.
    pub fn into_result(self, path: &str) -> Result<(), ValidationError> {
        match self {
            Self::Allow => Ok(()),
            Self::Escapes => Err(ValidationError::PathOutsideWorkspace(path.to_string())),
            Self::Ignored { pattern } => Err(ValidationError::Ignored {
                path: path.to_string(),
                pattern,
            }),
            Self::Oversize { size, limit } => Err(ValidationError::Oversize {
                path: path.to_string(),
                size,
                limit,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// FilePolicy
// ---------------------------------------------------------------------------

/// Evaluates change targets against the workspace boundary, ignore patterns
/// and the size limit.
#[derive(Debug, Clone)]
pub struct FilePolicy {
    /// Maximum allowed file size in bytes. 0 = no limit.
    max_file_size: u64,
    /// Glob patterns to exclude. Matched against the normalized relative path.
    ignore_patterns: Vec<String>,
}

impl FilePolicy {
    pub fn new(max_file_size: u64, ignore_patterns: Vec<String>) -> Self {
        Self {
            max_file_size,
            ignore_patterns,
        }
    }

    /// Evaluate a relative path and a known size.
    pub fn evaluate(&self, rel_path: &str, size: u64) -> FilePolicyDecision {
        let path = normalize_path(rel_path);
        if path == ".." || path.starts_with("../") {
            warn!(path = rel_path, "path escapes the workspace root");
            return FilePolicyDecision::Escapes;
        }

        for pattern in &self.ignore_patterns {
            if glob_match::glob_match(&pattern.replace('\\', "/"), &path) {
                debug!(path = %path, pattern = pattern.as_str(), "path matches ignore pattern");
                return FilePolicyDecision::Ignored {
                    pattern: pattern.clone(),
                };
            }
        }

        if self.max_file_size > 0 && size > self.max_file_size {
            warn!(
                path = %path,
                size,
                limit = self.max_file_size,
                "file exceeds max_file_size, skipping"
            );
            return FilePolicyDecision::Oversize {
                size,
                limit: self.max_file_size,
            };
        }

        FilePolicyDecision::Allow
    }

    /// Evaluate a path on disk under `workspace_root`.
    ///
    /// Symlinks that resolve outside the root are treated as escapes. A file
    /// that cannot be stat'd is allowed so the apply step reports the I/O
    /// error against the change.
    pub fn evaluate_path(&self, workspace_root: &Path, rel_path: &str) -> FilePolicyDecision {
        let decision = self.evaluate(rel_path, 0);
        if decision.is_blocked() {
            return decision;
        }

        let full = workspace_root.join(normalize_path(rel_path));
        if let (Ok(root), Ok(target)) = (workspace_root.canonicalize(), full.canonicalize()) {
            if !target.starts_with(&root) {
                warn!(path = rel_path, "path resolves outside the workspace root");
                return FilePolicyDecision::Escapes;
            }
        }

        match std::fs::metadata(&full) {
            Ok(meta) => self.evaluate(rel_path, meta.len()),
            Err(_) => FilePolicyDecision::Allow,
        }
    }

    /// Shorthand: evaluate on disk and map to a validation result.
    pub fn check(&self, workspace_root: &Path, rel_path: &str) -> Result<(), ValidationError> {
        self.evaluate_path(workspace_root, rel_path)
            .into_result(rel_path)
    }

    /// Whether the policy has any constraints beyond the workspace boundary.
    pub fn has_constraints(&self) -> bool {
        self.max_file_size > 0 || !self.ignore_patterns.is_empty()
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }
}

impl From<&PolicyConfig> for FilePolicy {
    fn from(cfg: &PolicyConfig) -> Self {
        Self::new(cfg.max_file_size, cfg.ignore_patterns.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
