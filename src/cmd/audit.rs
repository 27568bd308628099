//! Consistency reports: `quill audit`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use quill::audit::AuditLogger;
use quill::consistency::{AuditReport, Severity};
use quill::ui::icons::{CHECK, WARN};
use quill::work::{ItemStatus, WorkId};

use super::super::Cli;
use super::services::{Services, open_project};

pub async fn cmd_audit(project_dir: &Path, cli: &Cli, work_id: &str, run: bool) -> Result<()> {
    let project = open_project(project_dir, cli)?;
    let config = &project.config;
    let logger = AuditLogger::new(&config.audit_dir);
    let work_id = WorkId::new(work_id);

    if !run {
        match logger.latest_report(&work_id)? {
            Some(report) => print_report(&report),
            None => println!(
                "No audit reports for '{}' yet. Run `quill audit --work {} --run`.",
                work_id, work_id
            ),
        }
        return Ok(());
    }

    let services = Services::open(config);
    let work = services.works.load(&work_id)?;
    let through = match work
        .items
        .iter()
        .filter(|i| i.status == ItemStatus::Accepted)
        .map(|i| i.sequence)
        .max()
    {
        Some(sequence) => sequence,
        None => services
            .memory
            .latest_chapter(&work.id)
            .await
            .context("Failed to read memory")?
            .ok_or_else(|| anyhow::anyhow!("Work '{}' has no accepted chapters to audit", work.id))?,
    };

    let report = services
        .auditor
        .audit(&work.id, through)
        .await
        .context("Consistency audit failed")?;
    let path = logger.save_report(&report)?;
    print_report(&report);
    println!("{}", style(format!("Saved to {}", path.display())).dim());
    Ok(())
}

fn print_report(report: &AuditReport) {
    println!();
    println!(
        "Audit of '{}' through chapter {} ({})",
        report.work_id,
        report.through_chapter,
        report.generated_at.format("%Y-%m-%d %H:%M")
    );
    println!();

    if report.is_clean() {
        println!("{}No inconsistencies or stale threads found.", CHECK);
    }

    if !report.inconsistencies.is_empty() {
        println!("{}", style("Inconsistencies").bold());
        for issue in &report.inconsistencies {
            let severity = match issue.severity {
                Severity::Critical => style(issue.severity.to_string()).red().bold(),
                Severity::Major => style(issue.severity.to_string()).red(),
                Severity::Minor => style(issue.severity.to_string()).yellow(),
            };
            let chapters = issue
                .chapters
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(" vs ");
            let subject = issue
                .subject
                .as_deref()
                .map(|s| format!(" {s}"))
                .unwrap_or_default();
            println!(
                "  [{}] {}{} (chapters {}): {}",
                severity, issue.kind, subject, chapters, issue.explanation
            );
        }
        println!();
    }

    if !report.stale_threads.is_empty() {
        println!("{}", style("Stale plot threads").bold());
        for thread in &report.stale_threads {
            println!(
                "  {}chapter {} ({} chapters open, {}): {}",
                WARN, thread.chapter, thread.age, thread.importance, thread.description
            );
        }
        println!();
    }

    println!(
        "{}",
        style(format!(
            "{} pairs compared, {} skipped",
            report.pairs_compared, report.pairs_skipped
        ))
        .dim()
    );
}
