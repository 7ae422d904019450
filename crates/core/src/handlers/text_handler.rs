//! Plain-text handler: the registry's fallback for any path.

use crate::errors::{ApplyError, ValidationError};
use crate::handlers::lines::splice_text;
use crate::handlers::{reject_conflict_markers, FileHandler};

/// Literal line splicing with no structural knowledge.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextHandler;

impl FileHandler for TextHandler {
    fn name(&self) -> &'static str {
        "text"
    }

    fn can_handle(&self, _path: &str) -> bool {
        true
    }

    fn validate_change(
        &self,
        path: &str,
        content: &str,
        _start: usize,
        _end: usize,
    ) -> Result<(), ValidationError> {
        reject_conflict_markers(path, content)
    }

    fn render_change(
        &self,
        path: &str,
        original: &str,
        content: &str,
        start: usize,
        end: usize,
    ) -> Result<String, ApplyError> {
        splice_text(path, original, content, start, end)
    }
}
