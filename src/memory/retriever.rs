use std::sync::Arc;

use tracing::{debug, instrument};

use super::{MemoryRecord, MemoryStore, Query, RecordKind, RecordPayload};
use crate::errors::MemoryError;
use crate::quill_config::MemoryConfig;
use crate::stages::text::truncate_chars;
use crate::work::{WorkId, WorkItem};

/// Sections shorter than this are dropped instead of truncated.
const MIN_PARTIAL_SECTION: usize = 50;

/// The context block handed to the producer for one chapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
    pub text: String,
    pub summaries: usize,
    pub characters: usize,
    pub threads: usize,
    pub world: usize,
    /// The budget cut something off
    pub truncated: bool,
}

impl RetrievedContext {
    /// No memory was available; the producer works from the outline alone.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Picks which memory the producer sees for chapter `k`:
/// summaries of the `k-1` most relevant earlier chapters, the latest state
/// of each character in the outline, unresolved plot threads, and world
/// facts, in that priority order, cut to the configured budget.
pub struct ContextRetriever {
    store: Arc<MemoryStore>,
    config: MemoryConfig,
}

impl ContextRetriever {
    pub fn new(store: Arc<MemoryStore>, config: MemoryConfig) -> Self {
        Self { store, config }
    }

    #[instrument(skip(self, item), fields(chapter = item.sequence))]
    pub async fn retrieve(
        &self,
        work: &WorkId,
        item: &WorkItem,
    ) -> Result<RetrievedContext, MemoryError> {
        let k = item.sequence;

        let mut summaries: Vec<MemoryRecord> = self
            .store
            .search(
                work,
                &Query::new(&item.outline, k.saturating_sub(1) as usize)
                    .kinds(&[RecordKind::ChapterSummary])
                    .before_chapter(k),
            )
            .await?
            .into_iter()
            .map(|s| s.record)
            .collect();
        summaries.sort_by_key(|r| r.chapter);

        let characters = self.character_states(work, item).await?;

        let mut threads: Vec<MemoryRecord> = self
            .store
            .search(
                work,
                &Query::new(&item.outline, self.config.thread_limit)
                    .kinds(&[RecordKind::PlotEvent])
                    .unresolved_only()
                    .before_chapter(k),
            )
            .await?
            .into_iter()
            .map(|s| s.record)
            .collect();
        threads.sort_by(|a, b| importance(b).cmp(&importance(a)).then(a.chapter.cmp(&b.chapter)));

        let world: Vec<MemoryRecord> = self
            .store
            .search(
                work,
                &Query::new(&item.outline, self.config.world_limit)
                    .kinds(&[RecordKind::WorldFact])
                    .before_chapter(k),
            )
            .await?
            .into_iter()
            .map(|s| s.record)
            .collect();

        let sections = [
            render_section("Previous chapters", &summaries, |r| {
                format!("- Chapter {}: {}", r.chapter, r.text())
            }),
            render_section("Characters", &characters, |r| {
                format!("- {} (as of chapter {})", r.text(), r.chapter)
            }),
            render_section("Open threads", &threads, render_thread),
            render_section("World", &world, |r| format!("- {}", r.text())),
        ];
        let (text, truncated) = assemble(
            sections.into_iter().flatten().collect(),
            self.config.context_max_chars,
        );

        let context = RetrievedContext {
            text,
            summaries: summaries.len(),
            characters: characters.len(),
            threads: threads.len(),
            world: world.len(),
            truncated,
        };
        debug!(
            summaries = context.summaries,
            characters = context.characters,
            threads = context.threads,
            truncated = context.truncated,
            "Context assembled"
        );
        Ok(context)
    }

    /// Latest state of each character the outline names, either through the
    /// item's character list or by mention in the outline text.
    async fn character_states(
        &self,
        work: &WorkId,
        item: &WorkItem,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let known = self
            .store
            .search(
                work,
                &Query::new("", usize::MAX)
                    .kinds(&[RecordKind::CharacterState])
                    .before_chapter(item.sequence),
            )
            .await?;

        let mut names: Vec<String> = item.characters.clone();
        for scored in &known {
            if let Some(name) = scored.record.payload.subject()
                && item.outline.contains(name)
                && !names.iter().any(|n| n == name)
            {
                names.push(name.to_string());
            }
        }

        let mut states = Vec::new();
        for name in &names {
            let latest = known
                .iter()
                .map(|s| &s.record)
                .filter(|r| r.payload.subject() == Some(name.as_str()))
                .max_by_key(|r| (r.chapter, r.created_at));
            if let Some(record) = latest {
                states.push(record.clone());
            }
        }
        Ok(states)
    }
}

fn importance(record: &MemoryRecord) -> super::Importance {
    match &record.payload {
        RecordPayload::PlotEvent { importance, .. } => *importance,
        _ => super::Importance::Normal,
    }
}

fn render_thread(record: &MemoryRecord) -> String {
    match &record.payload {
        RecordPayload::PlotEvent {
            description,
            event_type,
            importance,
            ..
        } => format!(
            "- [{importance}/{event_type}] {description} (since chapter {})",
            record.chapter
        ),
        _ => format!("- {}", record.text()),
    }
}

fn render_section(
    heading: &str,
    records: &[MemoryRecord],
    line: impl Fn(&MemoryRecord) -> String,
) -> Option<String> {
    if records.is_empty() {
        return None;
    }
    let body: Vec<String> = records.iter().map(line).collect();
    Some(format!("## {heading}\n{}", body.join("\n")))
}

/// Join sections in priority order within `budget` characters. Whole
/// sections are kept while they fit; the first one that doesn't is cut
/// with "..." if enough room remains, and everything after it is dropped.
fn assemble(sections: Vec<String>, budget: usize) -> (String, bool) {
    let mut parts: Vec<String> = Vec::new();
    let mut used = 0;
    let mut truncated = false;

    for section in sections {
        let separator = if parts.is_empty() { 0 } else { 2 };
        let len = section.chars().count();
        if used + separator + len <= budget {
            used += separator + len;
            parts.push(section);
            continue;
        }
        truncated = true;
        let remaining = budget.saturating_sub(used + separator);
        if remaining > MIN_PARTIAL_SECTION {
            parts.push(truncate_chars(&section, remaining));
        }
        break;
    }

    (parts.join("\n\n"), truncated)
}
