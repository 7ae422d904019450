//! Table rendering for batch reports and analyses.

use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use reviewapply_core::batch::BatchReport;
use reviewapply_core::conflict::{Conflict, Resolution, Severity};
use reviewapply_core::models::{ChangeOutcome, ChangeReport, ResolutionResult};
use reviewapply_core::preview::FilePreview;

use crate::style;

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

fn members(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| format!("#{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn print_conflicts(conflicts: &[Conflict]) {
    if conflicts.is_empty() {
        println!("{}", style::success("No conflicts detected."));
        return;
    }

    println!("{}", style::header("Conflicts"));
    let mut table = new_table(vec!["#", "File", "Lines", "Type", "Severity", "Overlap", "Changes"]);
    for (i, c) in conflicts.iter().enumerate() {
        let severity = match c.severity {
            Severity::High => Cell::new("high").fg(Color::Red),
            Severity::Medium => Cell::new("medium").fg(Color::Yellow),
            Severity::Low => Cell::new("low").fg(Color::Green),
        };
        table.add_row(vec![
            Cell::new(i),
            Cell::new(&c.file_path),
            Cell::new(format!("{}-{}", c.line_range.0, c.line_range.1)),
            Cell::new(c.conflict_type),
            severity,
            Cell::new(format!("{:.1}%", c.overlap_percentage)),
            Cell::new(members(&c.changes)),
        ]);
    }
    println!("{table}");
}

pub fn print_resolutions(resolutions: &[Resolution]) {
    if resolutions.is_empty() {
        return;
    }

    println!("{}", style::header("Resolutions"));
    let mut table = new_table(vec!["Conflict", "Strategy", "Applied", "Skipped", "Message"]);
    for r in resolutions {
        table.add_row(vec![
            Cell::new(r.conflict),
            Cell::new(r.strategy),
            Cell::new(members(&r.applied_changes)),
            Cell::new(members(&r.skipped_changes)),
            Cell::new(&r.message),
        ]);
    }
    println!("{table}");
}

pub fn print_outcomes(outcomes: &[ChangeReport]) {
    if outcomes.is_empty() {
        return;
    }

    println!("{}", style::header("Changes"));
    let mut table = new_table(vec!["#", "File", "Lines", "Fingerprint", "Outcome", "Reason"]);
    for r in outcomes {
        let outcome = match &r.outcome {
            ChangeOutcome::Applied => Cell::new("✓ applied").fg(Color::Green),
            ChangeOutcome::Skipped { .. } => Cell::new("⧗ skipped").fg(Color::Yellow),
            ChangeOutcome::Failed { .. } => Cell::new("✗ failed").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(r.index),
            Cell::new(&r.path),
            Cell::new(format!("{}-{}", r.start_line, r.end_line)),
            Cell::new(&r.fingerprint),
            outcome,
            Cell::new(r.outcome.reason().unwrap_or("-")),
        ]);
    }
    println!("{table}");
}

pub fn print_previews(previews: &[FilePreview]) {
    for preview in previews {
        if preview.is_unchanged() {
            println!("{}", style::dim(&format!("{}: no change", preview.path)));
            continue;
        }
        for line in preview.diff.lines() {
            println!("{}", style::diff_line(line));
        }
    }
}

pub fn print_summary(result: &ResolutionResult) {
    println!(
        "  Applied {}  Skipped {}  Failed {}  Conflicts {}  Success rate {:.1}%",
        result.applied_count,
        result.skipped_count,
        result.failed_count,
        result.conflict_count,
        result.success_rate
    );
}

/// Full human-readable rendering of a batch.
pub fn print_report(report: &BatchReport) {
    println!();
    let title = if report.dry_run {
        format!("Batch {} (dry run)", report.batch_id)
    } else {
        format!("Batch {}", report.batch_id)
    };
    println!("{}", style::header(&title));
    println!("{}", style::dim(&format!("{} → {}", report.started_at, report.completed_at)));
    println!();

    print_conflicts(&report.conflicts);
    print_resolutions(&report.resolutions);
    print_outcomes(&report.outcomes);
    if report.dry_run {
        println!();
        print_previews(&report.previews);
    }

    println!();
    print_summary(&report.result);
    if report.rolled_back {
        println!(
            "{}",
            style::warn("Changes failed: working tree rolled back to the checkpoint.")
        );
    } else if report.result.failed_count > 0 {
        println!("{}", style::error("Some changes failed."));
    } else if let Some(id) = &report.checkpoint {
        println!("{}", style::success(&format!("Batch committed (checkpoint {id} released).")));
    }
    println!();
}
