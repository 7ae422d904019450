//! Application engine: ordered, parallel, per-file application of a batch.
//!
//! The surviving changes are partitioned by file. Within a file, work units
//! run bottom-up (start line descending) so earlier edits never shift the
//! lines of later ones. Files are handed to a bounded pool of scoped worker
//! threads; no two workers ever touch the same path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::conflict::Resolution;
use crate::errors::ApplyError;
use crate::handlers::{FileHandler, HandlerRegistry};
use crate::models::{Change, ChangeOutcome};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One unit of sequential work inside a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnit {
    /// A single change applied by line splice.
    Single(usize),
    /// A disjoint-keys group applied through the handler merge.
    Merge(Vec<usize>),
}

impl WorkUnit {
    pub fn members(&self) -> Vec<usize> {
        match self {
            Self::Single(i) => vec![*i],
            Self::Merge(members) => members.clone(),
        }
    }

    /// Smallest start line among the members.
    pub fn anchor(&self, changes: &[Change]) -> usize {
        self.members()
            .iter()
            .map(|&i| changes[i].start_line())
            .min()
            .unwrap_or(0)
    }
}

/// Work units per file, each file's units ordered bottom-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyPlan {
    files: BTreeMap<String, Vec<WorkUnit>>,
}

impl ApplyPlan {
    /// Build the plan from the non-conflicting changes and every
    /// resolution's applied members.
    pub fn build(changes: &[Change], non_conflicting: &[usize], resolutions: &[Resolution]) -> Self {
        let mut files: BTreeMap<String, Vec<WorkUnit>> = BTreeMap::new();
        let mut push = |unit: WorkUnit, path: &str| {
            files.entry(path.to_string()).or_default().push(unit);
        };

        for &i in non_conflicting {
            push(WorkUnit::Single(i), changes[i].path());
        }
        for resolution in resolutions {
            let applied = &resolution.applied_changes;
            let Some(&first) = applied.first() else {
                continue;
            };
            if resolution.merge && applied.len() > 1 {
                push(WorkUnit::Merge(applied.clone()), changes[first].path());
            } else {
                for &i in applied {
                    push(WorkUnit::Single(i), changes[i].path());
                }
            }
        }

        for units in files.values_mut() {
            units.sort_by(|a, b| {
                b.anchor(changes)
                    .cmp(&a.anchor(changes))
                    .then_with(|| a.members().cmp(&b.members()))
            });
        }
        Self { files }
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &[WorkUnit])> {
        self.files.iter().map(|(p, u)| (p.as_str(), u.as_slice()))
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Number of changes scheduled.
    pub fn change_count(&self) -> usize {
        self.files
            .values()
            .flatten()
            .map(|u| u.members().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub max_workers: usize,
    pub validate: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            validate: true,
        }
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            max_workers: cfg.max_workers,
            validate: cfg.validate,
        }
    }
}

/// Executes an [`ApplyPlan`] against the working tree.
pub struct ApplicationEngine<'a> {
    workspace_root: &'a Path,
    registry: &'a HandlerRegistry,
    options: EngineOptions,
}

impl<'a> ApplicationEngine<'a> {
    pub fn new(workspace_root: &'a Path, registry: &'a HandlerRegistry, options: EngineOptions) -> Self {
        Self {
            workspace_root,
            registry,
            options,
        }
    }

    /// Apply the plan and return one slot per change in `changes`.
    ///
    /// Slots of changes not in the plan stay `None`. The slot table is
    /// filled by index, so the order is the submission order regardless of
    /// which worker finished first.
    pub fn execute(&self, changes: &[Change], plan: &ApplyPlan) -> Vec<Option<ChangeOutcome>> {
        let files: Vec<(&str, &[WorkUnit])> = plan.files().collect();
        let workers = self.options.max_workers.max(1).min(files.len());
        info!(
            files = files.len(),
            changes = plan.change_count(),
            workers,
            "applying changes"
        );

        let mut slots: Vec<Option<ChangeOutcome>> = vec![None; changes.len()];
        if files.is_empty() {
            return slots;
        }

        let next = AtomicUsize::new(0);
        let results: Vec<Vec<(usize, ChangeOutcome)>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(|| {
                        let mut done = Vec::new();
                        loop {
                            let task = next.fetch_add(1, Ordering::SeqCst);
                            let Some((path, units)) = files.get(task) else {
                                break;
                            };
                            done.extend(self.run_file(path, units, changes));
                        }
                        done
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| match h.join() {
                    Ok(done) => Some(done),
                    Err(_) => {
                        error!("application worker panicked");
                        None
                    }
                })
                .collect()
        });

        for (idx, outcome) in results.into_iter().flatten() {
            slots[idx] = Some(outcome);
        }
        for (_, units) in &files {
            for idx in units.iter().flat_map(WorkUnit::members) {
                if slots[idx].is_none() {
                    slots[idx] = Some(ChangeOutcome::failed("worker terminated before applying"));
                }
            }
        }
        slots
    }

    /// Run one file's units in order.
    #[instrument(skip_all, fields(path = %path))]
    fn run_file(&self, path: &str, units: &[WorkUnit], changes: &[Change]) -> Vec<(usize, ChangeOutcome)> {
        let handler = self.registry.handler_for(path);
        let mut sink = DiskSink {
            full_path: self.workspace_root.join(path),
        };
        run_units(handler, units, changes, self.options.validate, &mut sink)
    }
}

// ---------------------------------------------------------------------------
// Unit execution
// ---------------------------------------------------------------------------

/// Where rendered edits end up: the file on disk or an in-memory copy.
pub(crate) trait UnitSink {
    fn apply_one(&mut self, handler: &dyn FileHandler, change: &Change) -> Result<(), ApplyError>;
    fn apply_group(&mut self, handler: &dyn FileHandler, group: &[&Change]) -> Result<(), ApplyError>;
}

struct DiskSink {
    full_path: PathBuf,
}

impl UnitSink for DiskSink {
    fn apply_one(&mut self, handler: &dyn FileHandler, change: &Change) -> Result<(), ApplyError> {
        handler.apply_change(&self.full_path, change.content(), change.start_line(), change.end_line())
    }

    fn apply_group(&mut self, handler: &dyn FileHandler, group: &[&Change]) -> Result<(), ApplyError> {
        handler.merge(&self.full_path, group)
    }
}

/// Validate then apply each unit, recording one outcome per member.
///
/// A merge unit whose invalid members drop it to a single survivor falls
/// back to a plain splice of that survivor.
pub(crate) fn run_units(
    handler: &dyn FileHandler,
    units: &[WorkUnit],
    changes: &[Change],
    validate: bool,
    sink: &mut dyn UnitSink,
) -> Vec<(usize, ChangeOutcome)> {
    let mut out = Vec::new();
    for unit in units {
        let mut valid = Vec::new();
        for i in unit.members() {
            match prevalidate(handler, &changes[i], validate) {
                Ok(()) => valid.push(i),
                Err(skip) => out.push((i, skip)),
            }
        }
        match valid.as_slice() {
            [] => {}
            [only] => {
                let change = &changes[*only];
                let outcome = match sink.apply_one(handler, change) {
                    Ok(()) => {
                        debug!(fingerprint = change.fingerprint(), "change applied");
                        ChangeOutcome::Applied
                    }
                    Err(e) => {
                        warn!(fingerprint = change.fingerprint(), error = %e, "change failed");
                        ChangeOutcome::failed(e.to_string())
                    }
                };
                out.push((*only, outcome));
            }
            _ => {
                let group: Vec<&Change> = valid.iter().map(|&i| &changes[i]).collect();
                let outcome = match sink.apply_group(handler, &group) {
                    Ok(()) => {
                        debug!(members = valid.len(), "merge applied");
                        ChangeOutcome::Applied
                    }
                    Err(e) => {
                        warn!(members = valid.len(), error = %e, "merge failed");
                        ChangeOutcome::failed(e.to_string())
                    }
                };
                out.extend(valid.iter().map(|&i| (i, outcome.clone())));
            }
        }
    }
    out
}

fn prevalidate(handler: &dyn FileHandler, change: &Change, enabled: bool) -> Result<(), ChangeOutcome> {
    if !enabled {
        return Ok(());
    }
    handler
        .validate_change(
            change.path(),
            change.content(),
            change.start_line(),
            change.end_line(),
        )
        .map_err(|e| {
            debug!(fingerprint = change.fingerprint(), error = %e, "validation failed");
            ChangeOutcome::skipped(e.to_string())
        })
}
