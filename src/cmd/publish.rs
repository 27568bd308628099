//! Publishing accepted chapters: `quill publish`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;

use quill::publish::{ChapterPublishResult, HttpPublishClient, PublishLedger, PublishSequencer};
use quill::quill_config::PublishMode;
use quill::ui::icons::{CHECK, CROSS};
use quill::work::{ChapterArchive, ItemStatus, WorkId, WorkStore};

use super::super::Cli;
use super::Selection;
use super::services::open_project;

pub async fn cmd_publish(
    project_dir: &Path,
    cli: &Cli,
    work_id: &str,
    selection: Selection,
    mode: Option<PublishMode>,
) -> Result<()> {
    use dialoguer::Confirm;

    let project = open_project(project_dir, cli)?;
    let config = &project.config;
    let publish = &config.settings.publish;
    let mode = mode.unwrap_or(publish.mode);

    let book_id = publish
        .book_id
        .clone()
        .context("publish.book_id is not set in quill.toml")?;
    let client = HttpPublishClient::new(publish);
    if !client.has_cookie() {
        anyhow::bail!(
            "No session cookie found. Set {} to your author backend cookie.",
            publish.cookie_env
        );
    }

    let store = WorkStore::new(config.works_dir.clone());
    let work = store.load(&WorkId::new(work_id))?;
    let selection = selection.resolve(&work);
    let mut chapters = Vec::new();
    for item in work.select(selection.as_deref()) {
        if item.status != ItemStatus::Accepted {
            continue;
        }
        match store.chapter(&work.id, item.sequence)? {
            Some(chapter) => chapters.push(chapter),
            None => println!(
                "{}",
                style(format!(
                    "Chapter {} is marked accepted but its text is missing; skipping",
                    item.sequence
                ))
                .yellow()
            ),
        }
    }
    if chapters.is_empty() {
        println!("No accepted chapters in the selection.");
        return Ok(());
    }

    if !cli.yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Send {} chapter(s) of '{}' to book {} as {}?",
                chapters.len(),
                work.title,
                book_id,
                mode
            ))
            .default(mode == PublishMode::Draft)
            .interact()
            .unwrap_or(false);
        if !confirm {
            println!("Publish cancelled");
            return Ok(());
        }
    }

    let ledger = PublishLedger::load(&config.publish_ledger)?;
    let mut sequencer = PublishSequencer::new(Arc::new(client), ledger, book_id, publish);
    let report = sequencer
        .publish_chapters(&work.id, &chapters, mode)
        .await?;

    println!();
    for (sequence, result) in &report.results {
        match result {
            ChapterPublishResult::Skipped { reason } => {
                println!("  {} chapter {}: {}", style("-").dim(), sequence, style(reason).dim())
            }
            ChapterPublishResult::Drafted(progress) => println!(
                "  {}chapter {}: draft saved (item {})",
                CHECK,
                sequence,
                progress.item_id.as_deref().unwrap_or("?")
            ),
            ChapterPublishResult::Published(progress) => println!(
                "  {}chapter {}: published (item {})",
                CHECK,
                sequence,
                progress.item_id.as_deref().unwrap_or("?")
            ),
            ChapterPublishResult::Failed(e) => {
                println!("  {}{}", CROSS, style(e).red());
                if let Some(item_id) = &e.progress.item_id {
                    println!(
                        "      draft {} is saved; rerun to retry from the {} step",
                        item_id, e.step
                    );
                }
            }
        }
    }
    println!();

    let failed = report.failures().count();
    if failed > 0 {
        anyhow::bail!("{} chapter(s) failed to publish", failed);
    }
    Ok(())
}
