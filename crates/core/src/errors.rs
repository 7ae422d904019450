//! Error types for the reviewapply core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Only [`BatchError::RollbackFailed`] is unrecoverable. Every per-change
//! error is caught inside the application engine and recorded against the
//! change that caused it.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// A change was rejected before any write was attempted.
///
/// Recorded as a skip with the error message as reason; never aborts a batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The path is empty once normalized.
    #[error("change path is empty")]
    EmptyPath,

    /// Line range is empty, reversed, or starts before line 1.
    #[error("invalid line range {start}-{end} for '{path}'")]
    InvalidRange {
        path: String,
        start: usize,
        end: usize,
    },

    /// The path resolves outside the workspace root.
    #[error("path '{0}' escapes the workspace root")]
    PathOutsideWorkspace(String),

    /// The path matches a configured ignore pattern.
    #[error("path '{path}' is ignored by pattern '{pattern}'")]
    Ignored { path: String, pattern: String },

    /// The target file exceeds the configured size limit.
    #[error("file '{path}' is {size} bytes, above the {limit} byte limit")]
    Oversize { path: String, size: u64, limit: u64 },

    /// Replacement content still carries merge-conflict markers.
    #[error("content for '{0}' contains merge conflict markers")]
    ConflictMarkers(String),

    /// Replacement content is not a valid fragment for the target format.
    #[error("invalid {format} fragment for '{path}': {detail}")]
    InvalidContent {
        path: String,
        format: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Apply errors
// ---------------------------------------------------------------------------

/// A single change failed while being written.
///
/// The target file is guaranteed unmodified: the original is only replaced
/// after the temporary file has been fully written and renamed.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The target file does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// The line range lies beyond the end of the file.
    #[error("line range {start}-{end} is out of bounds for '{path}' ({line_count} lines)")]
    RangeOutOfBounds {
        path: String,
        start: usize,
        end: usize,
        line_count: usize,
    },

    /// I/O failure during read, temp write, flush or rename.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The change would leave a structured file unparseable.
    #[error(transparent)]
    Structure(#[from] StructureError),
}

impl ApplyError {
    /// Wrap an [`std::io::Error`] with the path it occurred on.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Structure errors
// ---------------------------------------------------------------------------

/// Structured (key-value) content could not be parsed or merged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StructureError {
    /// The document does not parse in its format.
    #[error("{format} parse error in '{path}': {detail}")]
    Parse {
        path: String,
        format: String,
        detail: String,
    },

    /// A change's line range could not be mapped to logical keys.
    #[error("cannot map lines {start}-{end} of '{path}' to keys: {detail}")]
    Unmappable {
        path: String,
        start: usize,
        end: usize,
        detail: String,
    },

    /// Two merge members claim the same key or the same lines.
    #[error("overlapping keys in merge for '{path}': {detail}")]
    KeyCollision { path: String, detail: String },

    /// A key introduced by a member is missing from the merged document.
    #[error("merged '{path}' is missing key '{key}'")]
    MissingKey { path: String, key: String },

    /// The handler has no structural merge.
    #[error("handler '{0}' does not support structural merge")]
    Unsupported(String),
}

// ---------------------------------------------------------------------------
// Rollback errors
// ---------------------------------------------------------------------------

/// Errors from the checkpoint / rollback subsystem.
#[derive(Debug, Error)]
pub enum RollbackError {
    /// The `git` binary was not found on `$PATH`.
    #[error("git binary not found: {0}")]
    BinaryNotFound(String),

    /// The workspace root is not inside a git working tree.
    #[error("'{0}' is not inside a git working tree")]
    NotAWorkTree(String),

    /// A `git` command exited with a non-zero status.
    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The operation is not allowed in the current state.
    #[error("cannot {operation} from state {state}")]
    InvalidState { state: String, operation: String },

    /// The checkpoint id does not match the active checkpoint.
    #[error("unknown checkpoint: {0}")]
    UnknownCheckpoint(String),

    /// Generic I/O wrapper.
    #[error("rollback I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Batch errors
// ---------------------------------------------------------------------------

/// Batch-level failures. Per-change failures never appear here.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Another batch is already running on this runner.
    #[error("batch already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// The checkpoint could not be created; nothing was written.
    #[error("failed to create checkpoint, batch not started: {0}")]
    Checkpoint(#[source] RollbackError),

    /// Rollback itself failed. The working tree may be partially modified.
    #[error("rollback failed, manual recovery required (checkpoint {checkpoint}): {source}")]
    RollbackFailed {
        checkpoint: String,
        #[source]
        source: RollbackError,
    },
}

impl BatchError {
    /// `true` when the caller must recover the working tree by hand.
    pub fn requires_manual_recovery(&self) -> bool {
        matches!(self, Self::RollbackFailed { .. })
    }
}
