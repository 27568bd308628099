//! Chapter production: `quill write`.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use console::style;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use quill::audit::{AuditLogger, RunSettings};
use quill::errors::WorkflowError;
use quill::ui::ProductionUI;
use quill::work::{ItemStatus, WorkId};
use quill::workflow::{EngineOptions, EventSink, WorkScheduler};

use super::super::Cli;
use super::Selection;
use super::services::{Services, open_project};

pub async fn cmd_write(project_dir: &Path, cli: &Cli, work_id: &str, selection: Selection) -> Result<()> {
    let project = open_project(project_dir, cli)?;
    let config = &project.config;
    let services = Services::open(config);

    let work = services.works.load(&WorkId::new(work_id))?;
    let selection = selection.resolve(&work);
    let planned = work
        .select(selection.as_deref())
        .iter()
        .filter(|i| i.status != ItemStatus::Accepted)
        .count();
    if planned == 0 {
        println!("Nothing to write: every selected chapter is already accepted.");
        return Ok(());
    }

    let mut audit_log = AuditLogger::new(&config.audit_dir);
    if audit_log.load_current()? {
        let path = audit_log.finish_run()?;
        println!(
            "{}",
            style(format!(
                "Closed an interrupted run from a previous session: {}",
                path.display()
            ))
            .dim()
        );
    }
    let options = EngineOptions::from_settings(&config.settings);
    audit_log.start_run(
        work.id.clone(),
        RunSettings {
            max_revisions: options.max_revisions,
            max_attempts: options.retry.max_attempts,
            audit_interval: options.audit_interval,
            selection: selection.clone().unwrap_or_default(),
        },
    )?;

    let (tx, mut rx) = mpsc::channel(256);
    let engine = Arc::new(services.engine(EventSink::new(tx)));
    let token = CancellationToken::new();
    let mut scheduler = WorkScheduler::with_token(engine, token.clone());
    scheduler.spawn(work, selection)?;

    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let ui = if cli.yes {
        ProductionUI::hidden(planned as u64)
    } else {
        ProductionUI::new(planned as u64, cli.verbose)
    };
    // The channel closes once the scheduler and its tasks drop the engine.
    let consume = async {
        while let Some(event) = rx.recv().await {
            ui.handle(&event);
            if let Err(e) = audit_log.record(&event) {
                warn!(error = %e, "Failed to update run log");
            }
        }
    };
    let (runs, ()) = tokio::join!(scheduler.join_all(), consume);

    let mut failure = None;
    for run in runs {
        let (report, aborted) = match run.result {
            Ok(report) => (report, None),
            Err(aborted) => (aborted.report, Some(aborted.source)),
        };
        // audits finished before an abort are kept too
        for audit in &report.audits {
            audit_log.save_report(audit)?;
        }

        match aborted {
            None => {
                let failed = report.failed().map(|(seq, f)| (seq, f.clone()));
                ui.finish(report.accepted(), usize::from(failed.is_some()));
                if !report.skipped.is_empty() {
                    println!(
                        "Skipped {} already accepted chapter(s)",
                        report.skipped.len()
                    );
                }
                if let Some((sequence, chapter_failure)) = failed {
                    println!();
                    println!(
                        "{} Chapter {} failed after {} revision(s): {}",
                        style("✗").red().bold(),
                        sequence,
                        chapter_failure.revisions,
                        chapter_failure.cause
                    );
                    if let Some(verdict) = &chapter_failure.last_verdict {
                        println!("  Last review scored {:.1}:", verdict.aggregate);
                        for line in verdict.feedback_lines() {
                            println!("    {}", line);
                        }
                    }
                    failure = Some(sequence);
                }
            }
            Some(WorkflowError::Cancelled { sequence }) => {
                ui.finish(report.accepted(), 0);
                println!(
                    "{}",
                    style(format!(
                        "Interrupted. Chapter {sequence} will restart from pending on the next run."
                    ))
                    .yellow()
                );
            }
            Some(e) => {
                ui.finish(report.accepted(), 1);
                audit_log.finish_run()?;
                return Err(e.into());
            }
        }
    }

    let run_file = audit_log.finish_run()?;
    println!("Run log: {}", run_file.display());

    if let Some(sequence) = failure {
        anyhow::bail!(
            "Chapter {} did not pass review. Adjust its outline or raise --max-revisions, then rerun.",
            sequence
        );
    }
    Ok(())
}
