//! Work and chapter status: `quill status`.

use anyhow::Result;
use console::style;
use std::path::Path;

use quill::audit::AuditLogger;
use quill::work::{ItemStatus, Work, WorkId, WorkStore};
use quill::workflow::StateJournal;

use super::super::Cli;
use super::services::open_project;

pub fn cmd_status(project_dir: &Path, cli: &Cli, work: Option<&str>) -> Result<()> {
    let project = open_project(project_dir, cli)?;
    let config = &project.config;
    let store = WorkStore::new(config.works_dir.clone());

    let Some(work_id) = work else {
        let works = store.list()?;
        if works.is_empty() {
            println!("No works yet. Create one with `quill create-work --outline <file>`.");
            return Ok(());
        }
        println!();
        for work in &works {
            print_work_line(work);
        }
        println!();
        return Ok(());
    };

    let work = store.load(&WorkId::new(work_id))?;
    let journal = StateJournal::new(config.state_file.clone());
    let entries = journal.entries_for(&work.id)?;

    println!();
    println!("{} ({})", style(&work.title).bold(), work.id);
    if !work.genre.is_empty() {
        println!("Genre: {}", work.genre);
    }
    println!();
    println!(
        "  {:>4}  {:<10} {:>4} {:>4}  {:<19}  {}",
        "#", "status", "rev", "att", "updated", "title"
    );
    for item in &work.items {
        let updated = entries
            .iter()
            .rev()
            .find(|e| e.chapter == item.sequence)
            .map(|e| e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>4}  {:<10} {:>4} {:>4}  {:<19}  {}",
            item.sequence,
            styled_status(item.status),
            item.revisions,
            item.attempts,
            updated,
            item.display_title()
        );
    }
    println!();

    let audit = AuditLogger::new(&config.audit_dir);
    match audit.latest_report(&work.id)? {
        Some(report) => println!("Last audit: {}", report.summary()),
        None => println!("Last audit: none"),
    }
    println!();
    Ok(())
}

fn print_work_line(work: &Work) {
    let counts = work
        .status_counts()
        .into_iter()
        .map(|(status, n)| format!("{n} {status}"))
        .collect::<Vec<_>>()
        .join(", ");
    println!(
        "  {:<24} {} [{}]",
        style(&work.id).cyan(),
        work.title,
        counts
    );
}

fn styled_status(status: ItemStatus) -> String {
    let padded = format!("{:<10}", status.to_string());
    match status {
        ItemStatus::Accepted => style(padded).green().to_string(),
        ItemStatus::Failed => style(padded).red().to_string(),
        ItemStatus::Pending => style(padded).dim().to_string(),
        _ => style(padded).yellow().to_string(),
    }
}
