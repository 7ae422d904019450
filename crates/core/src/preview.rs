//! Dry-run rendering of a batch.
//!
//! Planned work units run against in-memory copies of the target files
//! through the handlers' pure render methods. Nothing on disk changes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{run_units, ApplyPlan, UnitSink};
use crate::errors::ApplyError;
use crate::handlers::{read_target, FileHandler, HandlerRegistry};
use crate::models::{Change, ChangeOutcome};

/// Predicted effect of a batch on one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePreview {
    pub path: String,
    /// Unified diff from the current content to the predicted content.
    /// Empty when nothing would change.
    pub diff: String,
    /// Predicted outcome per change index targeting this file.
    pub outcomes: Vec<(usize, ChangeOutcome)>,
}

impl FilePreview {
    pub fn is_unchanged(&self) -> bool {
        self.diff.is_empty()
    }
}

struct MemorySink {
    path: String,
    text: String,
}

impl UnitSink for MemorySink {
    fn apply_one(&mut self, handler: &dyn FileHandler, change: &Change) -> Result<(), ApplyError> {
        self.text = handler.render_change(
            &self.path,
            &self.text,
            change.content(),
            change.start_line(),
            change.end_line(),
        )?;
        Ok(())
    }

    fn apply_group(&mut self, handler: &dyn FileHandler, group: &[&Change]) -> Result<(), ApplyError> {
        self.text = handler.render_merge(&self.path, &self.text, group)?;
        Ok(())
    }
}

/// Render every file in `plan` and return one preview per file, ordered by
/// path, plus the predicted slot table.
pub fn render_batch(
    workspace_root: &Path,
    registry: &HandlerRegistry,
    changes: &[Change],
    plan: &ApplyPlan,
    validate: bool,
) -> (Vec<FilePreview>, Vec<Option<ChangeOutcome>>) {
    let mut slots: Vec<Option<ChangeOutcome>> = vec![None; changes.len()];
    let mut previews = Vec::with_capacity(plan.file_count());

    for (path, units) in plan.files() {
        let handler = registry.handler_for(path);
        let outcomes = match read_target(&workspace_root.join(path)) {
            Ok(original) => {
                let mut sink = MemorySink {
                    path: path.to_string(),
                    text: original.clone(),
                };
                let outcomes = run_units(handler, units, changes, validate, &mut sink);
                let diff = if sink.text == original {
                    String::new()
                } else {
                    diffy::create_patch(&original, &sink.text).to_string()
                };
                previews.push(FilePreview {
                    path: path.to_string(),
                    diff,
                    outcomes: outcomes.clone(),
                });
                outcomes
            }
            Err(e) => {
                debug!(path, error = %e, "preview target unreadable");
                let reason = e.to_string();
                let outcomes: Vec<(usize, ChangeOutcome)> = units
                    .iter()
                    .flat_map(|u| u.members())
                    .map(|i| (i, ChangeOutcome::failed(reason.clone())))
                    .collect();
                previews.push(FilePreview {
                    path: path.to_string(),
                    diff: String::new(),
                    outcomes: outcomes.clone(),
                });
                outcomes
            }
        };
        for (i, outcome) in outcomes {
            slots[i] = Some(outcome);
        }
    }

    info!(
        files = previews.len(),
        changed = previews.iter().filter(|p| !p.is_unchanged()).count(),
        "batch preview rendered"
    );
    (previews, slots)
}
