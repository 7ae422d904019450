//! TOML-based configuration system for reviewapply.
//!
//! Every section is optional and falls back to the defaults below, so an
//! empty file is a valid configuration. A handful of settings can be
//! overridden from the environment via
//! [`AppConfig::resolve_env_overrides`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conflict::resolver::{PriorityRules, ResolutionPreset, ResolverFlags};
use crate::errors::ConfigError;

/// Environment variable overriding `resolver.preset`.
pub const ENV_PRESET: &str = "REVIEWAPPLY_PRESET";
/// Environment variable overriding `engine.max_workers`.
pub const ENV_MAX_WORKERS: &str = "REVIEWAPPLY_MAX_WORKERS";
/// Environment variable overriding `logging.log_level`.
pub const ENV_LOG_LEVEL: &str = "REVIEWAPPLY_LOG_LEVEL";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Conflict resolution settings.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Application engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Checkpoint / rollback settings.
    #[serde(default)]
    pub rollback: RollbackConfig,

    /// Upstream path / size checks.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolution strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Named preset composing the mode flags (default `balanced`).
    #[serde(default)]
    pub preset: ResolutionPreset,

    /// Overlap percentage below which a partial conflict is `minor`.
    #[serde(default = "default_partial_threshold")]
    pub partial_threshold: f64,

    /// Category scores used for priority arbitration.
    #[serde(default)]
    pub priority: PriorityRules,

    /// Override the preset's `skip_all_conflicts` flag.
    #[serde(default)]
    pub skip_all_conflicts: Option<bool>,

    /// Override the preset's `semantic_merging` flag.
    #[serde(default)]
    pub semantic_merging: Option<bool>,

    /// Override the preset's `user_selections_always_win` flag.
    #[serde(default)]
    pub user_selections_always_win: Option<bool>,
}

fn default_partial_threshold() -> f64 {
    10.0
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            preset: ResolutionPreset::default(),
            partial_threshold: default_partial_threshold(),
            priority: PriorityRules::default(),
            skip_all_conflicts: None,
            semantic_merging: None,
            user_selections_always_win: None,
        }
    }
}

impl ResolverConfig {
    /// Flags of the preset with any explicit overrides applied.
    pub fn flags(&self) -> ResolverFlags {
        let mut flags = self.preset.flags();
        if let Some(v) = self.skip_all_conflicts {
            flags.skip_all_conflicts = v;
        }
        if let Some(v) = self.semantic_merging {
            flags.semantic_merging = v;
        }
        if let Some(v) = self.user_selections_always_win {
            flags.user_selections_always_win = v;
        }
        flags
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Application engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the per-file worker pool (default 4).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Run each handler's `validate_change` before applying.
    #[serde(default = "default_true")]
    pub validate: bool,
}

fn default_max_workers() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            validate: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Checkpoint / rollback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Take a git checkpoint around every batch.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Roll the whole batch back if any change failed.
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rollback_on_failure: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// File policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Maximum target file size in bytes. 0 = no limit.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Glob patterns (relative to the workspace root) never edited.
    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_ignore_patterns() -> Vec<String> {
    vec![".git/**".into()]
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            ignore_patterns: default_ignore_patterns(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level or filter directive (default `info`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Apply `REVIEWAPPLY_*` environment overrides.
    ///
    /// Invalid values log a warning and leave the file value in place.
    pub fn resolve_env_overrides(&mut self) {
        if let Some(val) = read_env(ENV_PRESET) {
            match ResolutionPreset::from_name(&val) {
                Some(preset) => {
                    debug!(env_name = ENV_PRESET, %preset, "preset overridden from env");
                    self.resolver.preset = preset;
                }
                None => warn!(env_name = ENV_PRESET, value = %val, "unknown preset, ignoring"),
            }
        }

        if let Some(val) = read_env(ENV_MAX_WORKERS) {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => {
                    debug!(env_name = ENV_MAX_WORKERS, n, "max_workers overridden from env");
                    self.engine.max_workers = n;
                }
                _ => warn!(env_name = ENV_MAX_WORKERS, value = %val, "invalid worker count, ignoring"),
            }
        }

        if let Some(val) = read_env(ENV_LOG_LEVEL) {
            self.logging.log_level = val;
        }
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_workers".into(),
                detail: "worker pool size must be > 0".into(),
            });
        }
        let threshold = self.resolver.partial_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(ConfigError::InvalidValue {
                field: "resolver.partial_threshold".into(),
                detail: format!("threshold must be within 0..=100, got {threshold}"),
            });
        }
        if self.logging.log_level.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "logging.log_level".into(),
                detail: "log level must not be empty".into(),
            });
        }
        for pattern in &self.policy.ignore_patterns {
            if pattern.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "policy.ignore_patterns".into(),
                    detail: "ignore patterns must not be empty".into(),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Read a non-empty environment variable.
fn read_env(env_name: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.trim().is_empty() => Some(val.trim().to_string()),
        Ok(_) => {
            warn!(env_name, "env var is set but empty");
            None
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[resolver]
preset = "aggressive"
partial_threshold = 25.0
semantic_merging = false

[resolver.priority]
user_selection = 200
security_fix = 150
syntax_error = 80
regular_suggestion = 40
formatting = 5

[engine]
max_workers = 8
validate = false

[rollback]
enabled = false
rollback_on_failure = false

[policy]
max_file_size = 2048
ignore_patterns = ["vendor/**", "*.lock"]

[logging]
log_level = "debug"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.resolver.preset, ResolutionPreset::Aggressive);
        assert_eq!(config.resolver.partial_threshold, 25.0);
        assert_eq!(config.resolver.priority.user_selection, 200);
        assert_eq!(config.engine.max_workers, 8);
        assert!(!config.engine.validate);
        assert!(!config.rollback.enabled);
        assert_eq!(config.policy.ignore_patterns, vec!["vendor/**", "*.lock"]);
        assert_eq!(config.logging.log_level, "debug");
    }

    #[test]
    fn test_flag_overrides_apply_after_preset() {
        let config: AppConfig = toml::from_str(sample_toml()).unwrap();
        let flags = config.resolver.flags();
        assert!(flags.user_selections_always_win);
        assert!(!flags.semantic_merging);
        assert!(!flags.skip_all_conflicts);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reviewapply.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.policy.max_file_size, 2048);
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/reviewapply.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[engine\nmax_workers = ").unwrap();
        assert!(matches!(
            AppConfig::load_from_file(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = AppConfig::default();
        config.engine.max_workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "engine.max_workers"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = AppConfig::default();
        config.resolver.partial_threshold = 120.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "resolver.partial_threshold"
        ));
    }

    #[test]
    fn test_resolve_env_overrides() {
        std::env::set_var(ENV_PRESET, "conservative");
        std::env::set_var(ENV_MAX_WORKERS, "not-a-number");

        let mut config = AppConfig::default();
        config.resolve_env_overrides();

        assert_eq!(config.resolver.preset, ResolutionPreset::Conservative);
        assert_eq!(config.engine.max_workers, 4);

        std::env::remove_var(ENV_PRESET);
        std::env::remove_var(ENV_MAX_WORKERS);
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.resolver.preset, ResolutionPreset::Balanced);
        assert_eq!(config.resolver.partial_threshold, 10.0);
        assert_eq!(config.resolver.priority.security_fix, 90);
        assert_eq!(config.engine.max_workers, 4);
        assert!(config.engine.validate);
        assert!(config.rollback.enabled);
        assert!(config.rollback.rollback_on_failure);
        assert_eq!(config.policy.ignore_patterns, vec![".git/**"]);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }
}
