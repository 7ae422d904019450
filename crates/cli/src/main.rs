//! reviewapply command-line tool.
//!
//! Applies an already-extracted list of proposed changes to a working tree,
//! analyzes conflicts without touching anything, and generates / validates
//! configuration files.

mod report;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use reviewapply_core::batch::Admission;
use reviewapply_core::config::AppConfig;
use reviewapply_core::models::ChangeRecord;
use reviewapply_core::{BatchRunner, ResolutionPreset};

/// Exit status when a rollback failed and the tree needs manual recovery.
const EXIT_MANUAL_RECOVERY: u8 = 2;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// reviewapply command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "reviewapply",
    version,
    about = "Apply batches of review suggestions with conflict resolution and rollback"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Working tree the changes target.
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Log level filter (overrides the configuration file).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect, resolve and apply a batch of changes.
    Apply {
        /// JSON file holding the change list.
        #[arg(long)]
        changes: PathBuf,

        /// Resolution preset: conservative, balanced, aggressive, semantic.
        #[arg(long)]
        preset: Option<ResolutionPreset>,

        /// Worker threads for application.
        #[arg(long)]
        workers: Option<usize>,

        /// Render diffs instead of writing files.
        #[arg(long)]
        dry_run: bool,

        /// Do not take a checkpoint around the batch.
        #[arg(long)]
        no_rollback: bool,

        /// Print the batch report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show conflicts and planned resolutions without applying anything.
    Analyze {
        /// JSON file holding the change list.
        #[arg(long)]
        changes: PathBuf,

        /// Resolution preset: conservative, balanced, aggressive, semantic.
        #[arg(long)]
        preset: Option<ResolutionPreset>,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./reviewapply.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Init { output } => {
            init_logging(cli.log_level.as_deref(), None);
            cmd_init(&output).map(|()| ExitCode::SUCCESS)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref(), None);
            let path = config_path(cli.config.as_deref())
                .context("no configuration file found to validate")?;
            cmd_validate(&path).map(|()| ExitCode::SUCCESS)
        }
        Commands::Apply {
            changes,
            preset,
            workers,
            dry_run,
            no_rollback,
            json,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            init_logging(cli.log_level.as_deref(), Some(&config.logging.log_level));
            if let Some(preset) = preset {
                config.resolver.preset = preset;
            }
            if let Some(workers) = workers {
                anyhow::ensure!(workers > 0, "--workers must be greater than zero");
                config.engine.max_workers = workers;
            }
            if no_rollback {
                config.rollback.enabled = false;
            }
            cmd_apply(config, &cli.workspace, &changes, dry_run, json)
        }
        Commands::Analyze { changes, preset } => {
            let mut config = load_config(cli.config.as_deref())?;
            init_logging(cli.log_level.as_deref(), Some(&config.logging.log_level));
            if let Some(preset) = preset {
                config.resolver.preset = preset;
            }
            cmd_analyze(config, &cli.workspace, &changes).map(|()| ExitCode::SUCCESS)
        }
    }
}

fn init_logging(cli_level: Option<&str>, config_level: Option<&str>) {
    let level = cli_level.or(config_level).unwrap_or("warn");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// Explicit path, else `./reviewapply.toml`, else the user config directory.
fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from("reviewapply.toml");
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|d| d.join("reviewapply").join("config.toml"))
        .filter(|p| p.exists())
}

fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    match config_path(explicit) {
        Some(path) => AppConfig::load_and_resolve(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => {
            let mut config = AppConfig::default();
            config.resolve_env_overrides();
            config
                .validate()
                .context("invalid configuration from environment")?;
            Ok(config)
        }
    }
}

/// Load the change list as raw records. Range and path checks happen per
/// record later, so one bad entry does not reject the file.
fn read_changes(path: &Path) -> Result<Vec<ChangeRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read change list {}", path.display()))?;
    let records: Vec<ChangeRecord> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse change list {}", path.display()))?;
    debug!(count = records.len(), "change list loaded");
    Ok(records)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_apply(
    config: AppConfig,
    workspace: &Path,
    changes_path: &Path,
    dry_run: bool,
    json: bool,
) -> Result<ExitCode> {
    let records = read_changes(changes_path)?;
    let runner = BatchRunner::new(config, workspace);

    let report = match runner.run_records(records, dry_run) {
        Ok(report) => report,
        Err(e) if e.requires_manual_recovery() => {
            eprintln!("{}", style::error(&e.to_string()));
            eprintln!(
                "{}",
                style::warn("The working tree may be partially modified. Inspect it before retrying.")
            );
            return Ok(ExitCode::from(EXIT_MANUAL_RECOVERY));
        }
        Err(e) => return Err(e).context("batch failed"),
    };

    if json {
        let out = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        println!("{out}");
    } else {
        report::print_report(&report);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_analyze(config: AppConfig, workspace: &Path, changes_path: &Path) -> Result<()> {
    let admission = Admission::from_records(read_changes(changes_path)?);
    let preset = config.resolver.preset;
    let runner = BatchRunner::new(config, workspace);
    let analysis = runner.analyze(&admission.changes);
    let submitted = admission.changes.len() + admission.rejected.len();

    println!();
    println!(
        "{}",
        style::header(&format!("Analysis of {submitted} change(s), preset {preset}"))
    );
    println!();
    if !admission.rejected.is_empty() {
        println!("{}", style::warn("Rejected records"));
        report::print_outcomes(&admission.rejected);
        println!();
    }
    report::print_conflicts(&analysis.conflicts);
    report::print_resolutions(&analysis.resolutions);

    let decided = analysis.decided.iter().filter(|o| o.is_some()).count();
    println!();
    println!(
        "  {} change(s) scheduled across {} file(s), {} skipped before application",
        analysis.plan.change_count(),
        analysis.plan.file_count(),
        decided
    );
    println!();
    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# reviewapply configuration
# Every section is optional; the values below are the defaults.

[resolver]
# conservative | balanced | aggressive | semantic
preset = "balanced"
partial_threshold = 10.0
# Flags applied on top of the preset:
# skip_all_conflicts = false
# semantic_merging = true
# user_selections_always_win = false

[resolver.priority]
user_selection = 100
security_fix = 90
syntax_error = 80
regular_suggestion = 50
formatting = 10

[engine]
max_workers = 4
validate = true

[rollback]
enabled = true
rollback_on_failure = true

[policy]
# Bytes; 0 disables the limit.
max_file_size = 10485760
ignore_patterns = [".git/**"]

[logging]
log_level = "info"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!("Default configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!("  1. Pick a resolution preset and adjust priorities");
    println!(
        "  2. Validate with: reviewapply validate --config {}",
        output.display()
    );
    println!(
        "  3. Preview a batch: reviewapply apply --changes changes.json --dry-run --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config.resolve_env_overrides();
    println!("  [OK] Environment overrides processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All values are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    let flags = config.resolver.flags();
    println!();
    println!("Configuration summary:");
    println!("  Preset            : {}", config.resolver.preset);
    println!("  Skip all conflicts: {}", flags.skip_all_conflicts);
    println!("  Semantic merging  : {}", flags.semantic_merging);
    println!("  Selections win    : {}", flags.user_selections_always_win);
    println!("  Partial threshold : {}%", config.resolver.partial_threshold);
    println!("  Workers           : {}", config.engine.max_workers);
    println!(
        "  Checkpoints       : {}",
        if config.rollback.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  Max file size     : {}",
        if config.policy.max_file_size == 0 {
            "unlimited".to_string()
        } else {
            format!("{} bytes", config.policy.max_file_size)
        }
    );
    println!("  Ignore patterns   : {}", config.policy.ignore_patterns.join(", "));
    println!();
    println!("{}", style::success("Configuration is valid."));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_arguments_parse() {
        let cli = Cli::try_parse_from([
            "reviewapply",
            "--workspace",
            "/tmp/tree",
            "apply",
            "--changes",
            "changes.json",
            "--preset",
            "aggressive",
            "--workers",
            "2",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Apply {
                preset,
                workers,
                dry_run,
                no_rollback,
                ..
            } => {
                assert_eq!(preset, Some(ResolutionPreset::Aggressive));
                assert_eq!(workers, Some(2));
                assert!(dry_run);
                assert!(!no_rollback);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_read_changes_keeps_invalid_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changes.json");
        std::fs::write(
            &path,
            r#"[{"path": "./a.txt", "start_line": 1, "end_line": 2, "content": "x",
                 "metadata": {"category": "security"}},
                {"path": "a.txt", "start_line": 5, "end_line": 2, "content": "y"}]"#,
        )
        .unwrap();
        let records = read_changes(&path).unwrap();
        assert_eq!(records.len(), 2);

        let admission = Admission::from_records(records);
        assert_eq!(admission.changes[0].path(), "a.txt");
        assert_eq!(admission.changes[0].fingerprint().len(), 16);
        assert_eq!(admission.rejected[0].index, 1);
    }

    #[test]
    fn test_apply_skips_invalid_record_and_applies_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let changes = dir.path().join("changes.json");
        std::fs::write(
            &changes,
            r#"[{"path": "a.txt", "start_line": 1, "end_line": 1, "content": "ONE"},
                {"path": "a.txt", "start_line": 3, "end_line": 2, "content": "bad"},
                {"path": "a.txt", "start_line": 3, "end_line": 3, "content": "THREE"}]"#,
        )
        .unwrap();
        let mut config = AppConfig::default();
        config.rollback.enabled = false;

        let code = cmd_apply(config, dir.path(), &changes, false, true).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "ONE\ntwo\nTHREE\n"
        );
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reviewapply.toml");
        cmd_init(&out).unwrap();
        assert!(AppConfig::load_and_resolve(&out).is_ok());
        assert!(cmd_init(&out).is_err());
    }
}
