//! Conflict resolution strategies.
//!
//! The [`ConflictResolver`] turns every [`Conflict`] into exactly one
//! [`Resolution`]: an applied/skipped split of its members. Decisions are
//! deterministic; ties always fall to the lexicographically smallest
//! fingerprint.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conflict::detector::{Conflict, ConflictType};
use crate::models::{Change, ChangeCategory};

// ---------------------------------------------------------------------------
// Priority rules
// ---------------------------------------------------------------------------

/// Score per change category. Higher wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRules {
    #[serde(default = "default_user_selection")]
    pub user_selection: u32,
    #[serde(default = "default_security_fix")]
    pub security_fix: u32,
    #[serde(default = "default_syntax_error")]
    pub syntax_error: u32,
    #[serde(default = "default_regular_suggestion")]
    pub regular_suggestion: u32,
    #[serde(default = "default_formatting")]
    pub formatting: u32,
}

fn default_user_selection() -> u32 {
    100
}
fn default_security_fix() -> u32 {
    90
}
fn default_syntax_error() -> u32 {
    80
}
fn default_regular_suggestion() -> u32 {
    50
}
fn default_formatting() -> u32 {
    10
}

impl Default for PriorityRules {
    fn default() -> Self {
        Self {
            user_selection: default_user_selection(),
            security_fix: default_security_fix(),
            syntax_error: default_syntax_error(),
            regular_suggestion: default_regular_suggestion(),
            formatting: default_formatting(),
        }
    }
}

impl PriorityRules {
    pub fn score(&self, category: ChangeCategory) -> u32 {
        match category {
            ChangeCategory::UserSelection => self.user_selection,
            ChangeCategory::SecurityFix => self.security_fix,
            ChangeCategory::SyntaxError => self.syntax_error,
            ChangeCategory::RegularSuggestion => self.regular_suggestion,
            ChangeCategory::Formatting => self.formatting,
        }
    }
}

// ---------------------------------------------------------------------------
// Presets & flags
// ---------------------------------------------------------------------------

/// Mode flags steering resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverFlags {
    /// Skip every member of every conflict for manual review.
    pub skip_all_conflicts: bool,
    /// Merge disjoint-keys groups through the handler.
    pub semantic_merging: bool,
    /// A user selection beats any score.
    pub user_selections_always_win: bool,
    /// Arbitrate by score; when off, non-mergeable groups go to review.
    pub priority_enabled: bool,
    /// Only resolve conflicts in structured files.
    pub structured_only: bool,
}

/// Named combinations of [`ResolverFlags`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPreset {
    /// Skip all conflicts.
    Conservative,
    /// Priority arbitration plus semantic merging.
    #[default]
    Balanced,
    /// Balanced, and user selections always win.
    Aggressive,
    /// Semantic merging of structured files only, no arbitration.
    Semantic,
}

impl ResolutionPreset {
    pub fn flags(&self) -> ResolverFlags {
        let balanced = ResolverFlags {
            skip_all_conflicts: false,
            semantic_merging: true,
            user_selections_always_win: false,
            priority_enabled: true,
            structured_only: false,
        };
        match self {
            Self::Conservative => ResolverFlags {
                skip_all_conflicts: true,
                semantic_merging: false,
                ..balanced
            },
            Self::Balanced => balanced,
            Self::Aggressive => ResolverFlags {
                user_selections_always_win: true,
                ..balanced
            },
            Self::Semantic => ResolverFlags {
                priority_enabled: false,
                structured_only: true,
                ..balanced
            },
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "conservative" => Some(Self::Conservative),
            "balanced" => Some(Self::Balanced),
            "aggressive" => Some(Self::Aggressive),
            "semantic" => Some(Self::Semantic),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResolutionPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => write!(f, "conservative"),
            Self::Balanced => write!(f, "balanced"),
            Self::Aggressive => write!(f, "aggressive"),
            Self::Semantic => write!(f, "semantic"),
        }
    }
}

impl std::str::FromStr for ResolutionPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| {
            format!("unknown preset '{s}' (expected conservative, balanced, aggressive or semantic)")
        })
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// How a conflict was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    SkipAll,
    SemanticMerge,
    Deduplicate,
    ManualReview,
    UserSelection,
    Priority,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SkipAll => write!(f, "skip_all"),
            Self::SemanticMerge => write!(f, "semantic_merge"),
            Self::Deduplicate => write!(f, "deduplicate"),
            Self::ManualReview => write!(f, "manual_review"),
            Self::UserSelection => write!(f, "user_selection"),
            Self::Priority => write!(f, "priority"),
        }
    }
}

/// The decision for one conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Index of the resolved conflict in the detection's list.
    pub conflict: usize,
    pub strategy: Strategy,
    pub applied_changes: Vec<usize>,
    pub skipped_changes: Vec<usize>,
    pub success: bool,
    pub message: String,
    /// Applied members must go through the handler's structural merge.
    pub merge: bool,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Stateless strategy selector.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    flags: ResolverFlags,
    rules: PriorityRules,
}

impl ConflictResolver {
    pub fn new(flags: ResolverFlags, rules: PriorityRules) -> Self {
        Self { flags, rules }
    }

    pub fn from_preset(preset: ResolutionPreset) -> Self {
        Self::new(preset.flags(), PriorityRules::default())
    }

    pub fn flags(&self) -> ResolverFlags {
        self.flags
    }

    /// Resolve every conflict, in order.
    pub fn resolve_all(&self, conflicts: &[Conflict], changes: &[Change]) -> Vec<Resolution> {
        let resolutions: Vec<Resolution> = conflicts
            .iter()
            .enumerate()
            .map(|(i, c)| self.resolve(i, c, changes))
            .collect();
        info!(
            conflicts = conflicts.len(),
            applied = resolutions.iter().map(|r| r.applied_changes.len()).sum::<usize>(),
            skipped = resolutions.iter().map(|r| r.skipped_changes.len()).sum::<usize>(),
            "conflicts resolved"
        );
        resolutions
    }

    /// Decide one conflict.
    pub fn resolve(&self, index: usize, conflict: &Conflict, changes: &[Change]) -> Resolution {
        let members = &conflict.changes;
        let resolution = if self.flags.skip_all_conflicts {
            Resolution {
                conflict: index,
                strategy: Strategy::SkipAll,
                applied_changes: Vec::new(),
                skipped_changes: members.clone(),
                success: true,
                message: "conflict skipped, manual review required".into(),
                merge: false,
            }
        } else if conflict.conflict_type == ConflictType::DisjointKeys && self.flags.semantic_merging {
            Resolution {
                conflict: index,
                strategy: Strategy::SemanticMerge,
                applied_changes: members.clone(),
                skipped_changes: Vec::new(),
                success: true,
                message: format!("{} changes touch disjoint keys, merging", members.len()),
                merge: true,
            }
        } else if conflict.conflict_type == ConflictType::SemanticDuplicate {
            let keep = smallest_fingerprint(members.iter().copied(), changes);
            self.single_winner(index, members, keep, Strategy::Deduplicate, "kept one of equivalent duplicates")
        } else if !self.flags.priority_enabled
            || (self.flags.structured_only && !changes[members[0]].file_type().is_structured())
        {
            Resolution {
                conflict: index,
                strategy: Strategy::ManualReview,
                applied_changes: Vec::new(),
                skipped_changes: members.clone(),
                success: false,
                message: format!("{} conflict left for manual review", conflict.conflict_type),
                merge: false,
            }
        } else {
            self.arbitrate(index, members, changes)
        };

        debug!(
            path = %conflict.file_path,
            strategy = %resolution.strategy,
            applied = ?resolution.applied_changes,
            skipped = ?resolution.skipped_changes,
            "conflict resolution"
        );
        resolution
    }

    fn arbitrate(&self, index: usize, members: &[usize], changes: &[Change]) -> Resolution {
        if self.flags.user_selections_always_win {
            let selections = members
                .iter()
                .copied()
                .filter(|&i| changes[i].category() == ChangeCategory::UserSelection);
            if let Some(winner) = smallest_fingerprint(selections, changes) {
                return self.single_winner(
                    index,
                    members,
                    Some(winner),
                    Strategy::UserSelection,
                    "user selection wins",
                );
            }
        }

        let best = members
            .iter()
            .map(|&i| self.rules.score(changes[i].category()))
            .max()
            .unwrap_or(0);
        let top = members
            .iter()
            .copied()
            .filter(|&i| self.rules.score(changes[i].category()) == best);
        let winner = smallest_fingerprint(top, changes);
        self.single_winner(
            index,
            members,
            winner,
            Strategy::Priority,
            &format!("highest priority (score {best}) wins"),
        )
    }

    fn single_winner(
        &self,
        index: usize,
        members: &[usize],
        winner: Option<usize>,
        strategy: Strategy,
        message: &str,
    ) -> Resolution {
        let (applied, skipped): (Vec<usize>, Vec<usize>) =
            members.iter().copied().partition(|&i| Some(i) == winner);
        Resolution {
            conflict: index,
            strategy,
            applied_changes: applied,
            skipped_changes: skipped,
            success: winner.is_some(),
            message: message.to_string(),
            merge: false,
        }
    }
}

fn smallest_fingerprint(candidates: impl Iterator<Item = usize>, changes: &[Change]) -> Option<usize> {
    candidates.min_by(|&a, &b| {
        changes[a]
            .fingerprint()
            .cmp(changes[b].fingerprint())
            .then(a.cmp(&b))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::detector::ConflictDetector;
    use crate::models::CATEGORY_KEY;
    use std::collections::BTreeMap;

    fn change(path: &str, start: usize, end: usize, content: &str, category: &str) -> Change {
        let mut meta = BTreeMap::new();
        meta.insert(CATEGORY_KEY.to_string(), category.to_string());
        Change::with_metadata(path, start, end, content, meta).unwrap()
    }

    fn resolve_one(resolver: &ConflictResolver, changes: &[Change]) -> Resolution {
        let detection = ConflictDetector::default().detect(changes);
        assert_eq!(detection.conflicts.len(), 1);
        resolver.resolve(0, &detection.conflicts[0], changes)
    }

    #[test]
    fn test_priority_winner() {
        let changes = vec![
            change("config.json", 10, 12, "{\"a\": 1}", "formatting"),
            change("config.json", 10, 12, "{\"a\": 2}", "security-fix"),
        ];
        let r = resolve_one(&ConflictResolver::from_preset(ResolutionPreset::Balanced), &changes);
        assert_eq!(r.strategy, Strategy::Priority);
        assert_eq!(r.applied_changes, vec![1]);
        assert_eq!(r.skipped_changes, vec![0]);
        assert!(r.success);
        assert!(!r.merge);
    }

    #[test]
    fn test_tie_broken_by_smallest_fingerprint() {
        let changes = vec![
            change("f.txt", 1, 2, "alpha", "suggestion"),
            change("f.txt", 1, 2, "beta", "suggestion"),
            change("f.txt", 2, 3, "gamma", "suggestion"),
        ];
        let expected = (0..3)
            .min_by_key(|&i| changes[i].fingerprint().to_string())
            .unwrap();
        let resolver = ConflictResolver::from_preset(ResolutionPreset::Balanced);
        let first = resolve_one(&resolver, &changes);
        assert_eq!(first.applied_changes, vec![expected]);

        // Same decision regardless of submission order.
        let reversed: Vec<Change> = changes.iter().rev().cloned().collect();
        let second = resolve_one(&resolver, &reversed);
        assert_eq!(
            reversed[second.applied_changes[0]].fingerprint(),
            changes[expected].fingerprint()
        );
    }

    #[test]
    fn test_conservative_skips_all() {
        let changes = vec![
            change("f.txt", 1, 2, "a", "security"),
            change("f.txt", 2, 3, "b", "format"),
        ];
        let r = resolve_one(&ConflictResolver::from_preset(ResolutionPreset::Conservative), &changes);
        assert_eq!(r.strategy, Strategy::SkipAll);
        assert!(r.applied_changes.is_empty());
        assert_eq!(r.skipped_changes.len(), 2);
        assert!(r.message.contains("manual review"));
    }

    #[test]
    fn test_aggressive_user_selection_beats_score() {
        let mut rules = PriorityRules::default();
        rules.user_selection = 1;
        let changes = vec![
            change("f.txt", 1, 2, "a", "security-fix"),
            change("f.txt", 1, 2, "b", "user-selection"),
        ];

        let aggressive = ConflictResolver::new(ResolutionPreset::Aggressive.flags(), rules.clone());
        let r = resolve_one(&aggressive, &changes);
        assert_eq!(r.strategy, Strategy::UserSelection);
        assert_eq!(r.applied_changes, vec![1]);

        let balanced = ConflictResolver::new(ResolutionPreset::Balanced.flags(), rules);
        let r = resolve_one(&balanced, &changes);
        assert_eq!(r.strategy, Strategy::Priority);
        assert_eq!(r.applied_changes, vec![0]);
    }

    #[test]
    fn test_duplicate_keeps_one() {
        let changes = vec![
            change("f.txt", 4, 4, "same  ", "suggestion"),
            change("f.txt", 4, 4, "same", "suggestion"),
        ];
        let r = resolve_one(&ConflictResolver::from_preset(ResolutionPreset::Balanced), &changes);
        assert_eq!(r.strategy, Strategy::Deduplicate);
        assert_eq!(r.applied_changes.len(), 1);
        assert_eq!(r.skipped_changes.len(), 1);
        let kept = r.applied_changes[0];
        assert!(changes[kept].fingerprint() < changes[r.skipped_changes[0]].fingerprint());
    }

    #[test]
    fn test_semantic_preset_reviews_plain_text() {
        let changes = vec![
            change("notes.md", 1, 3, "a", "security"),
            change("notes.md", 2, 4, "b", "format"),
        ];
        let r = resolve_one(&ConflictResolver::from_preset(ResolutionPreset::Semantic), &changes);
        assert_eq!(r.strategy, Strategy::ManualReview);
        assert!(r.applied_changes.is_empty());
        assert!(!r.success);
    }

    #[test]
    fn test_disjoint_keys_merge() {
        let changes = vec![
            change("a.json", 3, 4, "x", "suggestion"),
            change("a.json", 4, 5, "y", "suggestion"),
        ];
        let mut detection = ConflictDetector::default().detect(&changes);
        detection.conflicts[0].conflict_type = ConflictType::DisjointKeys;

        let r = ConflictResolver::from_preset(ResolutionPreset::Balanced)
            .resolve(0, &detection.conflicts[0], &changes);
        assert_eq!(r.strategy, Strategy::SemanticMerge);
        assert!(r.merge);
        assert_eq!(r.applied_changes, vec![0, 1]);

        let mut flags = ResolutionPreset::Balanced.flags();
        flags.semantic_merging = false;
        let r = ConflictResolver::new(flags, PriorityRules::default())
            .resolve(0, &detection.conflicts[0], &changes);
        assert_eq!(r.strategy, Strategy::Priority);
        assert_eq!(r.applied_changes.len(), 1);
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("Semantic".parse::<ResolutionPreset>(), Ok(ResolutionPreset::Semantic));
        assert!("reckless".parse::<ResolutionPreset>().is_err());
        assert!(ResolutionPreset::Conservative.flags().skip_all_conflicts);
        assert!(!ResolutionPreset::Semantic.flags().priority_enabled);
    }
}
