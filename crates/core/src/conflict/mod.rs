//! Conflict detection and resolution.
//!
//! 1. **Detection**: grouping changes whose line ranges overlap and
//!    classifying each group, with structural refinement for key-value files.
//! 2. **Resolution**: turning each group into an applied/skipped split.

pub mod detector;
pub mod resolver;

pub use detector::{Conflict, ConflictDetector, ConflictType, Detection, Severity};
pub use resolver::{
    ConflictResolver, PriorityRules, Resolution, ResolutionPreset, ResolverFlags, Strategy,
};
