//! End-to-end batch pipeline.
//!
//! policy → detect → refine → resolve → checkpoint → apply → commit or
//! rollback. One [`BatchRunner`] owns a working tree; a second concurrent
//! [`run`](BatchRunner::run) on the same runner is refused.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::conflict::{Conflict, ConflictDetector, ConflictResolver, Resolution, Strategy};
use crate::engine::{ApplicationEngine, ApplyPlan, EngineOptions};
use crate::errors::{BatchError, RollbackError};
use crate::handlers::HandlerRegistry;
use crate::models::{Change, ChangeOutcome, ChangeRecord, ChangeReport, ResolutionResult};
use crate::policy::FilePolicy;
use crate::preview::{self, FilePreview};
use crate::rollback::{GitSnapshots, RollbackManager, SnapshotBackend};

/// Everything a caller learns about one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub started_at: String,
    pub completed_at: String,
    pub conflicts: Vec<Conflict>,
    pub resolutions: Vec<Resolution>,
    /// One entry per submitted change, in submission order.
    pub outcomes: Vec<ChangeReport>,
    pub result: ResolutionResult,
    /// Checkpoint id, when one was taken.
    pub checkpoint: Option<String>,
    pub rolled_back: bool,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previews: Vec<FilePreview>,
}

impl BatchReport {
    pub fn applied(&self) -> impl Iterator<Item = &ChangeReport> {
        self.outcomes.iter().filter(|r| r.outcome.is_applied())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &ChangeReport> {
        self.outcomes
            .iter()
            .filter(|r| matches!(r.outcome, ChangeOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &ChangeReport> {
        self.outcomes
            .iter()
            .filter(|r| matches!(r.outcome, ChangeOutcome::Failed { .. }))
    }

    /// Map every change index from a filtered batch back to the submitted
    /// one. `positions[i]` is the submitted index of filtered change `i`.
    fn reindex(&mut self, positions: &[usize]) {
        let map = |i: &mut usize| *i = positions[*i];
        for conflict in &mut self.conflicts {
            conflict.changes.iter_mut().for_each(map);
        }
        for resolution in &mut self.resolutions {
            resolution.applied_changes.iter_mut().for_each(map);
            resolution.skipped_changes.iter_mut().for_each(map);
        }
        for report in &mut self.outcomes {
            map(&mut report.index);
        }
        for preview in &mut self.previews {
            for (i, _) in &mut preview.outcomes {
                map(i);
            }
        }
    }
}

/// Records split into valid changes and rejections.
#[derive(Debug, Default)]
pub struct Admission {
    pub changes: Vec<Change>,
    /// Submitted index of each admitted change.
    pub positions: Vec<usize>,
    pub rejected: Vec<ChangeReport>,
}

impl Admission {
    /// Build a change from every record; invalid ones become skips.
    pub fn from_records(records: Vec<ChangeRecord>) -> Self {
        let mut admission = Self::default();
        for (i, record) in records.into_iter().enumerate() {
            match Change::try_from(record.clone()) {
                Ok(change) => {
                    admission.changes.push(change);
                    admission.positions.push(i);
                }
                Err(e) => {
                    warn!(index = i, path = %record.path, error = %e, "rejecting change record");
                    admission
                        .rejected
                        .push(ChangeReport::rejected(i, &record, e.to_string()));
                }
            }
        }
        admission
    }
}

/// Output of the analysis half of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub conflicts: Vec<Conflict>,
    pub resolutions: Vec<Resolution>,
    pub plan: ApplyPlan,
    /// Outcomes decided before application (policy and resolution skips).
    pub decided: Vec<Option<ChangeOutcome>>,
    /// Changes skipped by `skip_all_conflicts`.
    pub policy_skipped: usize,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Runs batches against one working tree.
pub struct BatchRunner {
    config: AppConfig,
    workspace_root: PathBuf,
    registry: HandlerRegistry,
    snapshots: Option<Arc<dyn SnapshotBackend>>,
    /// Atomic flag preventing concurrent batches.
    running: Arc<AtomicBool>,
    current_started: Mutex<Option<DateTime<Utc>>>,
}

impl BatchRunner {
    pub fn new(config: AppConfig, workspace_root: impl Into<PathBuf>) -> Self {
        Self::with_registry(config, workspace_root, HandlerRegistry::with_defaults())
    }

    pub fn with_registry(
        config: AppConfig,
        workspace_root: impl Into<PathBuf>,
        registry: HandlerRegistry,
    ) -> Self {
        let workspace_root = workspace_root.into();
        info!(root = %workspace_root.display(), handlers = ?registry.names(), "initializing batch runner");
        Self {
            config,
            workspace_root,
            registry,
            snapshots: None,
            running: Arc::new(AtomicBool::new(false)),
            current_started: Mutex::new(None),
        }
    }

    /// Use `backend` for checkpoints instead of the enclosing git repository.
    pub fn with_snapshots(mut self, backend: Arc<dyn SnapshotBackend>) -> Self {
        self.snapshots = Some(backend);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(
            self.config.resolver.flags(),
            self.config.resolver.priority.clone(),
        )
    }

    fn rollback_manager(&self) -> Result<RollbackManager, RollbackError> {
        match &self.snapshots {
            Some(backend) => Ok(RollbackManager::new(Box::new(backend.clone()))),
            None => Ok(RollbackManager::new(Box::new(GitSnapshots::new(
                &self.workspace_root,
            )?))),
        }
    }

    // -----------------------------------------------------------------------
    // Analysis
    // -----------------------------------------------------------------------

    /// Policy, detection, refinement and resolution. Touches nothing.
    pub fn analyze(&self, changes: &[Change]) -> Analysis {
        let policy = FilePolicy::from(&self.config.policy);
        if policy.has_constraints() {
            debug!(
                max_file_size = policy.max_file_size(),
                ignore_patterns = self.config.policy.ignore_patterns.len(),
                "file policy active"
            );
        }
        let mut decided: Vec<Option<ChangeOutcome>> = vec![None; changes.len()];
        let mut admitted = Vec::with_capacity(changes.len());
        for (i, change) in changes.iter().enumerate() {
            match policy.check(&self.workspace_root, change.path()) {
                Ok(()) => admitted.push(i),
                Err(e) => decided[i] = Some(ChangeOutcome::skipped(e.to_string())),
            }
        }
        if admitted.len() < changes.len() {
            info!(blocked = changes.len() - admitted.len(), "changes blocked by file policy");
        }

        let detector = ConflictDetector::new(self.config.resolver.partial_threshold);
        let mut detection = detector.detect_subset(changes, admitted);
        detector.refine(&mut detection, changes, &self.registry, &self.workspace_root);

        let resolutions = self.resolver().resolve_all(&detection.conflicts, changes);
        let mut policy_skipped = 0;
        for resolution in &resolutions {
            for &i in &resolution.skipped_changes {
                decided[i] = Some(ChangeOutcome::skipped(resolution.message.clone()));
            }
            if resolution.strategy == Strategy::SkipAll {
                policy_skipped += resolution.skipped_changes.len();
            }
        }

        let plan = ApplyPlan::build(changes, &detection.non_conflicting, &resolutions);
        Analysis {
            conflicts: detection.conflicts,
            resolutions,
            plan,
            decided,
            policy_skipped,
        }
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Run one batch.
    ///
    /// Per-change problems are reported in the [`BatchReport`]. Only a
    /// checkpoint that cannot be created, or a rollback that fails, is an
    /// error. The batch lock is released by a drop guard.
    pub fn run(&self, changes: &[Change], dry_run: bool) -> Result<BatchReport, BatchError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .current_started
                .lock()
                .ok()
                .and_then(|s| *s)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            return Err(BatchError::AlreadyRunning { started_at });
        }
        let _guard = BatchLockGuard(self.running.clone());

        let started = Utc::now();
        if let Ok(mut slot) = self.current_started.lock() {
            *slot = Some(started);
        }
        let batch_id = uuid::Uuid::new_v4().to_string();
        info!(batch_id = %batch_id, changes = changes.len(), dry_run, "batch started");

        let Analysis {
            conflicts,
            resolutions,
            plan,
            mut decided,
            policy_skipped,
        } = self.analyze(changes);

        let mut checkpoint = None;
        let mut rolled_back = false;
        let mut previews = Vec::new();

        if dry_run {
            let (rendered, predicted) = preview::render_batch(
                &self.workspace_root,
                &self.registry,
                changes,
                &plan,
                self.config.engine.validate,
            );
            merge_slots(&mut decided, predicted);
            previews = rendered;
        } else {
            let mut manager = None;
            if self.config.rollback.enabled && !plan.is_empty() {
                let mut mgr = self.rollback_manager().map_err(BatchError::Checkpoint)?;
                checkpoint = Some(mgr.create_checkpoint().map_err(BatchError::Checkpoint)?);
                manager = Some(mgr);
            }

            let engine = ApplicationEngine::new(
                &self.workspace_root,
                &self.registry,
                EngineOptions::from(&self.config.engine),
            );
            merge_slots(&mut decided, engine.execute(changes, &plan));

            if let (Some(mgr), Some(id)) = (manager.as_mut(), checkpoint.as_deref()) {
                let any_failed = decided
                    .iter()
                    .any(|o| matches!(o, Some(ChangeOutcome::Failed { .. })));
                if any_failed && self.config.rollback.rollback_on_failure {
                    warn!(batch_id = %batch_id, checkpoint = id, "changes failed, rolling back");
                    mgr.rollback(id).map_err(|source| {
                        error!(checkpoint = id, error = %source, "rollback failed, manual recovery required");
                        BatchError::RollbackFailed {
                            checkpoint: id.to_string(),
                            source,
                        }
                    })?;
                    rolled_back = true;
                } else if let Err(e) = mgr.commit() {
                    warn!(checkpoint = id, error = %e, "could not drop checkpoint after commit");
                }
            }
        }

        let outcomes: Vec<ChangeOutcome> = decided
            .into_iter()
            .map(|o| o.unwrap_or_else(|| ChangeOutcome::failed("change was never scheduled")))
            .collect();
        let result = ResolutionResult::from_outcomes(&outcomes, conflicts.len(), policy_skipped);
        let outcomes = outcomes
            .into_iter()
            .enumerate()
            .map(|(i, outcome)| ChangeReport::new(i, &changes[i], outcome))
            .collect();

        info!(
            batch_id = %batch_id,
            applied = result.applied_count,
            skipped = result.skipped_count,
            failed = result.failed_count,
            conflicts = result.conflict_count,
            success_rate = result.success_rate,
            rolled_back,
            "batch complete"
        );

        Ok(BatchReport {
            batch_id,
            started_at: started.to_rfc3339(),
            completed_at: Utc::now().to_rfc3339(),
            conflicts,
            resolutions,
            outcomes,
            result,
            checkpoint,
            rolled_back,
            dry_run,
            previews,
        })
    }

    /// Run a batch from wire records.
    ///
    /// A record that does not form a valid change is reported as skipped at
    /// its own index and never aborts the batch.
    pub fn run_records(
        &self,
        records: Vec<ChangeRecord>,
        dry_run: bool,
    ) -> Result<BatchReport, BatchError> {
        let Admission {
            changes,
            positions,
            rejected,
        } = Admission::from_records(records);
        let mut report = self.run(&changes, dry_run)?;
        if rejected.is_empty() {
            return Ok(report);
        }

        report.reindex(&positions);
        report.outcomes.extend(rejected);
        report.outcomes.sort_by_key(|r| r.index);

        let outcomes: Vec<ChangeOutcome> =
            report.outcomes.iter().map(|r| r.outcome.clone()).collect();
        let policy_skipped = report
            .resolutions
            .iter()
            .filter(|r| r.strategy == Strategy::SkipAll)
            .map(|r| r.skipped_changes.len())
            .sum();
        report.result =
            ResolutionResult::from_outcomes(&outcomes, report.conflicts.len(), policy_skipped);
        Ok(report)
    }
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("workspace_root", &self.workspace_root)
            .field("registry", &self.registry)
            .field("running", &self.is_running())
            .finish()
    }
}

fn merge_slots(into: &mut [Option<ChangeOutcome>], from: Vec<Option<ChangeOutcome>>) {
    for (slot, outcome) in into.iter_mut().zip(from) {
        if outcome.is_some() {
            *slot = outcome;
        }
    }
}

// ---------------------------------------------------------------------------
// Batch lock RAII guard
// ---------------------------------------------------------------------------

/// Drop guard that resets the `running` flag, even if a batch panics.
struct BatchLockGuard(Arc<AtomicBool>);

impl Drop for BatchLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
