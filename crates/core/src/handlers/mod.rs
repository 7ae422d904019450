//! Per-format file handlers.
//!
//! A [`FileHandler`] knows how to pre-validate replacement content, refine
//! line-level conflicts into key-level ones, and physically apply changes
//! for one file format. The [`HandlerRegistry`] dispatches by path; the
//! plain-text handler is always the final fallback, so the engine and the
//! detector never name a format.

pub mod json_handler;
pub mod lines;
pub mod structured;
pub mod text_handler;
pub mod toml_handler;
pub mod yaml_handler;

use std::path::Path;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{ApplyError, StructureError, ValidationError};
use crate::fsutil::atomic_write;
use crate::models::Change;

pub use json_handler::JsonHandler;
pub use lines::LineBuffer;
pub use text_handler::TextHandler;
pub use toml_handler::TomlHandler;
pub use yaml_handler::YamlHandler;

// ---------------------------------------------------------------------------
// Structural refinement
// ---------------------------------------------------------------------------

/// Key-level view of a conflict group produced by a structured handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralRefinement {
    /// No member's key equals or prefixes another member's key.
    pub disjoint: bool,
    /// Dotted key paths per member, in the order the members were given.
    pub footprints: Vec<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Format-specific behaviour plugged into the engine.
///
/// Implementors provide the pure `render_*` methods; the provided
/// [`apply_change`](FileHandler::apply_change) and
/// [`merge`](FileHandler::merge) read the file, render, and write the result
/// atomically.
pub trait FileHandler: Send + Sync {
    /// Short handler name for logs.
    fn name(&self) -> &'static str;

    fn can_handle(&self, path: &str) -> bool;

    /// Syntactic pre-check of the replacement content alone.
    fn validate_change(
        &self,
        path: &str,
        content: &str,
        start: usize,
        end: usize,
    ) -> Result<(), ValidationError>;

    /// Report whether a conflict group touches disjoint logical keys.
    ///
    /// `None` when the format has no key structure or the file cannot be
    /// mapped.
    fn detect_structural_conflicts(
        &self,
        _path: &Path,
        _changes: &[&Change],
    ) -> Option<StructuralRefinement> {
        None
    }

    /// New file text after replacing `start..=end` with `content`.
    fn render_change(
        &self,
        path: &str,
        original: &str,
        content: &str,
        start: usize,
        end: usize,
    ) -> Result<String, ApplyError>;

    /// New file text after applying a disjoint-keys group in one pass.
    fn render_merge(
        &self,
        _path: &str,
        _original: &str,
        _changes: &[&Change],
    ) -> Result<String, ApplyError> {
        Err(StructureError::Unsupported(self.name().to_string()).into())
    }

    /// Apply one change through the atomic-write discipline.
    fn apply_change(
        &self,
        path: &Path,
        content: &str,
        start: usize,
        end: usize,
    ) -> Result<(), ApplyError> {
        let display = path.display().to_string();
        let original = read_target(path)?;
        let updated = self.render_change(&display, &original, content, start, end)?;
        atomic_write(path, updated.as_bytes())
    }

    /// Apply a disjoint-keys group in a single atomic write.
    fn merge(&self, path: &Path, changes: &[&Change]) -> Result<(), ApplyError> {
        let display = path.display().to_string();
        let original = read_target(path)?;
        let updated = self.render_merge(&display, &original, changes)?;
        atomic_write(path, updated.as_bytes())
    }
}

/// Read a target file, mapping a missing file to [`ApplyError::NotFound`].
pub fn read_target(path: &Path) -> Result<String, ApplyError> {
    std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApplyError::NotFound(path.display().to_string())
        } else {
            ApplyError::io(path.display().to_string(), e)
        }
    })
}

fn conflict_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(<{7}|>{7})( .*)?\r?$|^={7}\r?$")
            .expect("conflict marker pattern is valid")
    })
}

/// Reject content still carrying `<<<<<<<`, `=======` or `>>>>>>>` markers.
pub fn reject_conflict_markers(path: &str, content: &str) -> Result<(), ValidationError> {
    if conflict_marker_re().is_match(content) {
        return Err(ValidationError::ConflictMarkers(path.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Ordered list of handlers tried in sequence, with plain text as fallback.
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn FileHandler>>,
    fallback: TextHandler,
}

impl HandlerRegistry {
    /// A registry with only the plain-text fallback.
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
            fallback: TextHandler,
        }
    }

    /// JSON, YAML and TOML handlers ahead of the plain-text fallback.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(JsonHandler));
        registry.register(Box::new(YamlHandler));
        registry.register(Box::new(TomlHandler));
        registry
    }

    /// Append a handler. Earlier registrations win.
    pub fn register(&mut self, handler: Box<dyn FileHandler>) {
        self.handlers.push(handler);
    }

    /// The first handler accepting `path`, or the plain-text fallback.
    pub fn handler_for(&self, path: &str) -> &dyn FileHandler {
        self.handlers
            .iter()
            .find(|h| h.can_handle(path))
            .map(|h| h.as_ref())
            .unwrap_or(&self.fallback)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers
            .iter()
            .map(|h| h.name())
            .chain(std::iter::once(self.fallback.name()))
            .collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct IniHandler;

    impl FileHandler for IniHandler {
        fn name(&self) -> &'static str {
            "ini"
        }
        fn can_handle(&self, path: &str) -> bool {
            path.ends_with(".ini")
        }
        fn validate_change(
            &self,
            _path: &str,
            _content: &str,
            _start: usize,
            _end: usize,
        ) -> Result<(), ValidationError> {
            Ok(())
        }
        fn render_change(
            &self,
            path: &str,
            original: &str,
            content: &str,
            start: usize,
            end: usize,
        ) -> Result<String, ApplyError> {
            lines::splice_text(path, original, content, start, end)
        }
    }

    #[test]
    fn test_dispatch_by_extension() {
        let registry = HandlerRegistry::with_defaults();
        assert_eq!(registry.handler_for("a/config.json").name(), "json");
        assert_eq!(registry.handler_for("deploy.yml").name(), "yaml");
        assert_eq!(registry.handler_for("Cargo.toml").name(), "toml");
        assert_eq!(registry.handler_for("README.md").name(), "text");
        assert_eq!(registry.handler_for("settings.ini").name(), "text");
    }

    #[test]
    fn test_registered_handler_takes_over() {
        let mut registry = HandlerRegistry::with_defaults();
        registry.register(Box::new(IniHandler));
        assert_eq!(registry.handler_for("settings.ini").name(), "ini");
        assert_eq!(registry.names(), vec!["json", "yaml", "toml", "ini", "text"]);
    }

    #[test]
    fn test_conflict_markers_rejected() {
        let content = "a\n<<<<<<< HEAD\nb\n=======\nc\n>>>>>>> branch\n";
        assert_eq!(
            reject_conflict_markers("f.txt", content),
            Err(ValidationError::ConflictMarkers("f.txt".into()))
        );
        assert!(reject_conflict_markers("f.txt", "a == b\n// =====\n").is_ok());
    }

    #[test]
    fn test_render_merge_unsupported_by_default() {
        let err = IniHandler.render_merge("a.ini", "", &[]).unwrap_err();
        assert!(matches!(
            err,
            ApplyError::Structure(StructureError::Unsupported(_))
        ));
    }

    #[test]
    fn test_apply_change_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = IniHandler
            .apply_change(&dir.path().join("nope.ini"), "x", 1, 1)
            .unwrap_err();
        assert!(matches!(err, ApplyError::NotFound(_)));
    }
}
