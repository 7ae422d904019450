//! Line-oriented view of a text file used for range splicing.

use crate::errors::ApplyError;

/// A file split into lines, remembering its line terminator and whether the
/// last line ended with one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineBuffer {
    lines: Vec<String>,
    trailing_newline: bool,
    eol: &'static str,
}

impl LineBuffer {
    pub fn parse(text: &str) -> Self {
        let eol = if text.contains("\r\n") { "\r\n" } else { "\n" };
        Self {
            lines: text.lines().map(str::to_string).collect(),
            trailing_newline: text.is_empty() || text.ends_with('\n'),
            eol,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// 1-based line accessor.
    pub fn line(&self, n: usize) -> Option<&str> {
        n.checked_sub(1)
            .and_then(|i| self.lines.get(i))
            .map(String::as_str)
    }

    /// Verify that `start..=end` can be replaced.
    ///
    /// A range starting one past the last line is an append and may carry any
    /// `end`; every other range must lie within the file.
    pub fn check_range(&self, path: &str, start: usize, end: usize) -> Result<(), ApplyError> {
        let line_count = self.lines.len();
        let append = start == line_count + 1;
        if start == 0 || start > end || (!append && end > line_count) || start > line_count + 1 {
            return Err(ApplyError::RangeOutOfBounds {
                path: path.to_string(),
                start,
                end,
                line_count,
            });
        }
        Ok(())
    }

    /// Replace lines `start..=end` (1-based, inclusive) with `content`.
    pub fn splice(
        &mut self,
        path: &str,
        start: usize,
        end: usize,
        content: &str,
    ) -> Result<(), ApplyError> {
        self.check_range(path, start, end)?;
        let to = end.min(self.lines.len());
        self.replace(start - 1, to, content_lines(content));
        Ok(())
    }

    /// Replace the zero-based half-open range `from..to` with `lines`.
    pub(crate) fn replace(&mut self, from: usize, to: usize, lines: Vec<String>) {
        self.lines.splice(from..to, lines);
    }

    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut out = self.lines.join(self.eol);
        if self.trailing_newline {
            out.push_str(self.eol);
        }
        out
    }
}

/// Split replacement content into lines. Empty content yields no lines, so
/// the replaced range is deleted.
pub fn content_lines(content: &str) -> Vec<String> {
    content.lines().map(str::to_string).collect()
}

/// Replace `start..=end` of `original` with `content`, keeping line endings
/// and the trailing-newline state.
pub fn splice_text(
    path: &str,
    original: &str,
    content: &str,
    start: usize,
    end: usize,
) -> Result<String, ApplyError> {
    let mut buffer = LineBuffer::parse(original);
    buffer.splice(path, start, end, content)?;
    Ok(buffer.render())
}
