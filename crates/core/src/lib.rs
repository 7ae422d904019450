//! reviewapply core library.
//!
//! This crate applies a batch of independently proposed edits to a working
//! tree: fingerprinting, conflict detection and classification, priority
//! and structure-aware resolution, ordered parallel application with atomic
//! writes, and git-backed checkpoint/rollback around the whole batch.

pub mod batch;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod fsutil;
pub mod handlers;
pub mod models;
pub mod policy;
pub mod preview;
pub mod rollback;

// Re-exports for convenience.
pub use batch::{BatchReport, BatchRunner};
pub use config::AppConfig;
pub use conflict::{ConflictDetector, ConflictResolver, ResolutionPreset};
pub use engine::{ApplicationEngine, ApplyPlan};
pub use handlers::{FileHandler, HandlerRegistry};
pub use models::{Change, ChangeOutcome, ResolutionResult};
pub use rollback::{GitSnapshots, RollbackManager};
