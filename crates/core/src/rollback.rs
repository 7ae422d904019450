//! Checkpoint / commit / rollback around a batch.
//!
//! [`GitSnapshots`] records the working tree (tracked and untracked,
//! non-ignored files) as a dangling commit without touching `HEAD`, the
//! real index, or any file. The commit is kept alive by a ref under
//! `refs/reviewapply/checkpoints/` until the batch commits or rolls back.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::RollbackError;

const REF_PREFIX: &str = "refs/reviewapply/checkpoints";
const SNAPSHOT_IDENT: &str = "reviewapply";

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Storage for working-tree snapshots.
pub trait SnapshotBackend: Send + Sync {
    /// Record the current tree under `id`.
    fn snapshot(&self, id: &str) -> Result<(), RollbackError>;

    /// Restore the tree recorded under `id`, removing files created since.
    fn restore(&self, id: &str) -> Result<(), RollbackError>;

    /// Forget the snapshot `id`. Content is never touched.
    fn discard(&self, id: &str) -> Result<(), RollbackError>;
}

impl<T: SnapshotBackend + ?Sized> SnapshotBackend for Arc<T> {
    fn snapshot(&self, id: &str) -> Result<(), RollbackError> {
        (**self).snapshot(id)
    }

    fn restore(&self, id: &str) -> Result<(), RollbackError> {
        (**self).restore(id)
    }

    fn discard(&self, id: &str) -> Result<(), RollbackError> {
        (**self).discard(id)
    }
}

// ---------------------------------------------------------------------------
// Git backend
// ---------------------------------------------------------------------------

/// Snapshots stored as commits in the enclosing git repository.
#[derive(Debug, Clone)]
pub struct GitSnapshots {
    workspace_root: PathBuf,
}

impl GitSnapshots {
    /// Bind to the work tree containing `workspace_root`.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Result<Self, RollbackError> {
        let backend = Self {
            workspace_root: workspace_root.into(),
        };
        match backend.run_git(&["rev-parse", "--is-inside-work-tree"], None) {
            Ok(out) if out.trim() == "true" => Ok(backend),
            Ok(_) | Err(RollbackError::CommandFailed { .. }) => Err(RollbackError::NotAWorkTree(
                backend.workspace_root.display().to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn ref_name(id: &str) -> String {
        format!("{REF_PREFIX}/{id}")
    }

    /// Run `git` in the workspace root, optionally against a private index.
    fn run_git(&self, args: &[&str], index: Option<&Path>) -> Result<String, RollbackError> {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.workspace_root)
            .args(args)
            .env("GIT_AUTHOR_NAME", SNAPSHOT_IDENT)
            .env("GIT_AUTHOR_EMAIL", "reviewapply@localhost")
            .env("GIT_COMMITTER_NAME", SNAPSHOT_IDENT)
            .env("GIT_COMMITTER_EMAIL", "reviewapply@localhost")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(index) = index {
            cmd.env("GIT_INDEX_FILE", index);
        }

        debug!(cmd = ?format!("git {}", args.join(" ")), "running git command");
        let output = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RollbackError::BinaryNotFound("git".into())
            } else {
                RollbackError::IoError(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(exit_code, %stderr, "git command failed");
            return Err(RollbackError::CommandFailed {
                command: args.first().copied().unwrap_or_default().to_string(),
                exit_code,
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Remove `rel` and any parent directories it leaves empty.
    fn remove_created(&self, rel: &str) -> Result<(), RollbackError> {
        let path = self.workspace_root.join(rel);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        debug!(path = rel, "removed file created after checkpoint");
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.workspace_root || std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }
}

impl SnapshotBackend for GitSnapshots {
    #[instrument(skip(self), fields(root = %self.workspace_root.display()))]
    fn snapshot(&self, id: &str) -> Result<(), RollbackError> {
        let scratch = tempfile::tempdir()?;
        let index = scratch.path().join("index");

        self.run_git(&["add", "-A", "--", "."], Some(&index))?;
        let tree = self.run_git(&["write-tree"], Some(&index))?;
        let message = format!("reviewapply checkpoint {id}");
        let commit = self.run_git(&["commit-tree", tree.trim(), "-m", &message], Some(&index))?;
        self.run_git(&["update-ref", &Self::ref_name(id), commit.trim()], None)?;

        info!(commit = commit.trim(), "checkpoint recorded");
        Ok(())
    }

    #[instrument(skip(self), fields(root = %self.workspace_root.display()))]
    fn restore(&self, id: &str) -> Result<(), RollbackError> {
        let scratch = tempfile::tempdir()?;
        let index = scratch.path().join("index");
        let reference = Self::ref_name(id);

        self.run_git(&["read-tree", &reference], Some(&index))?;
        self.run_git(&["checkout-index", "-a", "-f"], Some(&index))?;

        let created = self.run_git(
            &["ls-files", "--others", "--exclude-standard", "-z"],
            Some(&index),
        )?;
        let mut removed = 0usize;
        for rel in created.split('\0').filter(|s| !s.is_empty()) {
            self.remove_created(rel)?;
            removed += 1;
        }

        self.run_git(&["update-ref", "-d", &reference], None)?;
        info!(removed, "working tree restored from checkpoint");
        Ok(())
    }

    fn discard(&self, id: &str) -> Result<(), RollbackError> {
        self.run_git(&["update-ref", "-d", &Self::ref_name(id)], None)?;
        debug!(id, "checkpoint discarded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackState {
    Ready,
    Checkpointed,
    Committed,
    RolledBack,
}

impl fmt::Display for RollbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Checkpointed => write!(f, "checkpointed"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Transaction wrapper for one batch.
///
/// `Ready → Checkpointed → {Committed | RolledBack}`. Any other transition
/// is rejected with [`RollbackError::InvalidState`] and has no effect.
pub struct RollbackManager {
    backend: Box<dyn SnapshotBackend>,
    state: RollbackState,
    checkpoint: Option<String>,
}

impl RollbackManager {
    pub fn new(backend: Box<dyn SnapshotBackend>) -> Self {
        Self {
            backend,
            state: RollbackState::Ready,
            checkpoint: None,
        }
    }

    /// Manager backed by the git repository enclosing `workspace_root`.
    pub fn for_workspace(workspace_root: &Path) -> Result<Self, RollbackError> {
        Ok(Self::new(Box::new(GitSnapshots::new(workspace_root)?)))
    }

    pub fn state(&self) -> RollbackState {
        self.state
    }

    pub fn checkpoint_id(&self) -> Option<&str> {
        self.checkpoint.as_deref()
    }

    fn require(&self, expected: RollbackState, operation: &str) -> Result<(), RollbackError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RollbackError::InvalidState {
                state: self.state.to_string(),
                operation: operation.to_string(),
            })
        }
    }

    /// Snapshot the working tree and return the checkpoint id.
    pub fn create_checkpoint(&mut self) -> Result<String, RollbackError> {
        self.require(RollbackState::Ready, "create checkpoint")?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.backend.snapshot(&id)?;
        info!(checkpoint = %id, "checkpoint created");
        self.checkpoint = Some(id.clone());
        self.state = RollbackState::Checkpointed;
        Ok(id)
    }

    /// Keep the applied changes and drop the checkpoint.
    pub fn commit(&mut self) -> Result<(), RollbackError> {
        self.require(RollbackState::Checkpointed, "commit")?;
        let id = self.checkpoint.clone().unwrap_or_default();
        self.backend.discard(&id)?;
        info!(checkpoint = %id, "batch committed");
        self.state = RollbackState::Committed;
        Ok(())
    }

    /// Restore the tree recorded by checkpoint `id`.
    ///
    /// On failure the manager stays checkpointed so the caller may retry.
    pub fn rollback(&mut self, id: &str) -> Result<(), RollbackError> {
        self.require(RollbackState::Checkpointed, "rollback")?;
        if self.checkpoint.as_deref() != Some(id) {
            return Err(RollbackError::UnknownCheckpoint(id.to_string()));
        }
        self.backend.restore(id)?;
        warn!(checkpoint = %id, "batch rolled back");
        self.state = RollbackState::RolledBack;
        Ok(())
    }
}

impl fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackManager")
            .field("state", &self.state)
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        fail_restore: bool,
    }

    impl SnapshotBackend for Recorder {
        fn snapshot(&self, id: &str) -> Result<(), RollbackError> {
            self.calls.lock().unwrap().push(format!("snapshot {id}"));
            Ok(())
        }
        fn restore(&self, id: &str) -> Result<(), RollbackError> {
            if self.fail_restore {
                return Err(RollbackError::CommandFailed {
                    command: "checkout-index".into(),
                    exit_code: 128,
                    stderr: "boom".into(),
                });
            }
            self.calls.lock().unwrap().push(format!("restore {id}"));
            Ok(())
        }
        fn discard(&self, id: &str) -> Result<(), RollbackError> {
            self.calls.lock().unwrap().push(format!("discard {id}"));
            Ok(())
        }
    }

    #[test]
    fn test_state_machine_commit() {
        let rec = Recorder::default();
        let mut mgr = RollbackManager::new(Box::new(rec.clone()));
        assert!(matches!(
            mgr.commit(),
            Err(RollbackError::InvalidState { .. })
        ));

        let id = mgr.create_checkpoint().unwrap();
        assert_eq!(mgr.state(), RollbackState::Checkpointed);
        mgr.commit().unwrap();
        assert_eq!(mgr.state(), RollbackState::Committed);

        assert!(matches!(
            mgr.rollback(&id),
            Err(RollbackError::InvalidState { .. })
        ));
        assert!(matches!(
            mgr.create_checkpoint(),
            Err(RollbackError::InvalidState { .. })
        ));
        let calls = rec.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![format!("snapshot {id}"), format!("discard {id}")]);
    }

    #[test]
    fn test_rollback_checks_id_and_keeps_state_on_failure() {
        let mut mgr = RollbackManager::new(Box::new(Recorder {
            fail_restore: true,
            ..Default::default()
        }));
        let id = mgr.create_checkpoint().unwrap();
        assert!(matches!(
            mgr.rollback("nope"),
            Err(RollbackError::UnknownCheckpoint(_))
        ));
        assert!(mgr.rollback(&id).is_err());
        assert_eq!(mgr.state(), RollbackState::Checkpointed);
    }

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn init_repo(dir: &Path) {
        let repo = git2::Repository::init(dir).unwrap();
        std::fs::write(dir.join(".gitignore"), "*.log\n").unwrap();
        std::fs::write(dir.join("a.txt"), "alpha\n").unwrap();
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("sub/b.txt"), "beta\n").unwrap();

        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("Test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
    }

    #[test]
    fn test_git_snapshot_round_trip() {
        if !git_available() {
            eprintln!("Skipping: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        init_repo(root);
        std::fs::write(root.join("untracked.txt"), "keep me\n").unwrap();

        let mut mgr = RollbackManager::for_workspace(root).unwrap();
        let id = mgr.create_checkpoint().unwrap();

        std::fs::write(root.join("a.txt"), "changed\n").unwrap();
        std::fs::write(root.join("untracked.txt"), "changed too\n").unwrap();
        std::fs::remove_file(root.join("sub/b.txt")).unwrap();
        std::fs::create_dir_all(root.join("new/deep")).unwrap();
        std::fs::write(root.join("new/deep/c.txt"), "created\n").unwrap();
        std::fs::write(root.join("debug.log"), "ignored\n").unwrap();

        mgr.rollback(&id).unwrap();
        assert_eq!(mgr.state(), RollbackState::RolledBack);

        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "alpha\n");
        assert_eq!(
            std::fs::read_to_string(root.join("untracked.txt")).unwrap(),
            "keep me\n"
        );
        assert_eq!(std::fs::read_to_string(root.join("sub/b.txt")).unwrap(), "beta\n");
        assert!(!root.join("new").exists());
        assert!(root.join("debug.log").exists());

        // HEAD and the real index are untouched; the ref is gone.
        let repo = git2::Repository::open(root).unwrap();
        assert!(repo
            .find_reference(&format!("{REF_PREFIX}/{id}"))
            .is_err());
        let statuses = repo.statuses(None).unwrap();
        let dirty: Vec<String> = statuses
            .iter()
            .filter(|s| !s.status().is_ignored())
            .filter_map(|s| s.path().map(str::to_string))
            .collect();
        assert_eq!(dirty, vec!["untracked.txt".to_string()]);
    }

    #[test]
    fn test_git_commit_drops_ref_and_keeps_content() {
        if !git_available() {
            eprintln!("Skipping: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let mut mgr = RollbackManager::for_workspace(dir.path()).unwrap();
        let id = mgr.create_checkpoint().unwrap();
        std::fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        mgr.commit().unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "changed\n"
        );
        let repo = git2::Repository::open(dir.path()).unwrap();
        assert!(repo.find_reference(&format!("{REF_PREFIX}/{id}")).is_err());
    }

    #[test]
    fn test_not_a_work_tree() {
        if !git_available() {
            eprintln!("Skipping: git not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let err = GitSnapshots::new(dir.path()).unwrap_err();
        assert!(matches!(err, RollbackError::NotAWorkTree(_)));
    }
}
