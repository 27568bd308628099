use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, instrument};

use super::ChapterState;
use super::text::{section, sections, truncate_chars};
use crate::errors::StageError;
use crate::generation::{GenerationRequest, Generator, Role, with_timeout};
use crate::memory::{
    EventType, Importance, MemoryRecord, MemoryStore, Query, RecordId, RecordKind, RecordPayload,
};
use crate::work::WorkId;

/// Summary used when the model returns none.
const FALLBACK_SUMMARY_CHARS: usize = 300;

/// `Name: state`, with either colon width.
static CHARACTER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:：]+)[:：]\s*(.+)$").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEvent {
    pub event_type: EventType,
    pub importance: Importance,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFact {
    pub category: String,
    pub name: String,
    pub description: String,
}

/// Structured facts pulled out of an accepted chapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub summary: String,
    /// (character, state after this chapter)
    pub characters: Vec<(String, String)>,
    pub events: Vec<ExtractedEvent>,
    pub world: Vec<ExtractedFact>,
    pub key_characters: Vec<String>,
    pub key_events: Vec<String>,
    pub tone: Option<String>,
}

enum Planned {
    New(MemoryRecord),
    Version { old: RecordId, record: MemoryRecord },
}

/// Turns an accepted chapter into memory records. Runs before the chapter
/// is reported accepted, so the next chapter's retrieval sees its records.
pub struct MemoryUpdateStage {
    generator: Arc<dyn Generator>,
    store: Arc<MemoryStore>,
    timeout: Duration,
    resolution_similarity: f32,
}

impl MemoryUpdateStage {
    pub fn new(
        generator: Arc<dyn Generator>,
        store: Arc<MemoryStore>,
        timeout: Duration,
        resolution_similarity: f32,
    ) -> Self {
        Self {
            generator,
            store,
            timeout,
            resolution_similarity,
        }
    }

    #[instrument(skip_all, fields(chapter = state.item.sequence))]
    pub async fn run(&self, state: &ChapterState) -> Result<ChapterState, StageError> {
        let draft = state.require_draft("memory")?;
        let request = GenerationRequest::new(
            Role::Memory,
            "You maintain the continuity bible of a serialized novel. Extract facts only; \
             never invent.",
            EXTRACTION_INSTRUCTION,
        )
        .with_context(draft.text.clone());

        let output = with_timeout(self.timeout, self.generator.generate(&request)).await?;
        let mut extraction = parse_extraction(&output);
        if extraction.summary.is_empty() {
            extraction.summary = truncate_chars(draft.text.trim(), FALLBACK_SUMMARY_CHARS);
        }

        let plan = self
            .plan(&state.work_id, state.item.sequence, extraction)
            .await?;
        let mut record_ids = Vec::with_capacity(plan.len());
        for planned in plan {
            let id = match planned {
                Planned::New(record) => self.store.write(record).await?,
                Planned::Version { old, record } => self.store.write_version(old, record).await?,
            };
            record_ids.push(id);
        }
        info!(records = record_ids.len(), "Memory updated");

        let mut next = state.clone();
        next.record_ids = record_ids;
        Ok(next)
    }

    /// Resolve every lookup and embedding before anything is written.
    async fn plan(
        &self,
        work: &WorkId,
        chapter: u32,
        extraction: Extraction,
    ) -> Result<Vec<Planned>, StageError> {
        let mut plan = Vec::new();

        let summary = RecordPayload::ChapterSummary {
            summary: extraction.summary,
            key_characters: extraction.key_characters,
            key_events: extraction.key_events,
            tone: extraction.tone,
        };
        plan.push(Planned::New(self.record(work, chapter, summary).await?));

        // two lines about one subject would both version the same record
        let characters = last_per_subject(extraction.characters, |(name, _)| name.as_str());
        for (character, state) in characters {
            let previous = self
                .store
                .latest(work, RecordKind::CharacterState, &character)
                .await?;
            let payload = RecordPayload::CharacterState { character, state };
            let record = self.record(work, chapter, payload).await?;
            plan.push(match previous {
                Some(old) => Planned::Version { old: old.id, record },
                None => Planned::New(record),
            });
        }

        let mut claimed: HashSet<RecordId> = HashSet::new();
        for event in extraction.events {
            if event.event_type == EventType::Resolution
                && let Some(open) = self
                    .open_thread_for(work, chapter, &event.description, &claimed)
                    .await?
            {
                claimed.insert(open.id);
                if let RecordPayload::PlotEvent {
                    description,
                    event_type,
                    importance,
                    ..
                } = open.payload
                {
                    debug!(thread = %open.id, "Resolution closes open thread");
                    let payload = RecordPayload::PlotEvent {
                        description,
                        event_type,
                        importance,
                        resolved: true,
                        resolution: Some(event.description),
                    };
                    let record = self.record(work, chapter, payload).await?;
                    plan.push(Planned::Version {
                        old: open.id,
                        record,
                    });
                }
                continue;
            }

            let payload = RecordPayload::PlotEvent {
                resolved: event.event_type == EventType::Resolution,
                description: event.description,
                event_type: event.event_type,
                importance: event.importance,
                resolution: None,
            };
            plan.push(Planned::New(self.record(work, chapter, payload).await?));
        }

        for fact in last_per_subject(extraction.world, |f| f.name.as_str()) {
            let previous = self
                .store
                .latest(work, RecordKind::WorldFact, &fact.name)
                .await?;
            if let Some(old) = &previous
                && matches!(&old.payload, RecordPayload::WorldFact { description, .. } if *description == fact.description)
            {
                continue;
            }
            let payload = RecordPayload::WorldFact {
                category: fact.category,
                name: fact.name,
                description: fact.description,
            };
            let record = self.record(work, chapter, payload).await?;
            plan.push(match previous {
                Some(old) => Planned::Version { old: old.id, record },
                None => Planned::New(record),
            });
        }

        Ok(plan)
    }

    async fn record(
        &self,
        work: &WorkId,
        chapter: u32,
        payload: RecordPayload,
    ) -> Result<MemoryRecord, StageError> {
        let embedding = self.store.embed(&payload.text()).await?;
        Ok(MemoryRecord::new(work.clone(), chapter, payload, embedding))
    }

    /// Most similar unresolved thread from an earlier chapter, if close enough.
    async fn open_thread_for(
        &self,
        work: &WorkId,
        chapter: u32,
        resolution: &str,
        claimed: &HashSet<RecordId>,
    ) -> Result<Option<MemoryRecord>, StageError> {
        let candidates = self
            .store
            .search(
                work,
                &Query::new(resolution, 5)
                    .kinds(&[RecordKind::PlotEvent])
                    .unresolved_only()
                    .before_chapter(chapter),
            )
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|c| c.score >= self.resolution_similarity && !claimed.contains(&c.record.id))
            .map(|c| c.record)
            .next())
    }
}

const EXTRACTION_INSTRUCTION: &str = "\
Extract continuity facts from the chapter above. Use exactly these sections:
[SUMMARY]
One paragraph of what happened.
[CHARACTERS]
Name: state after this chapter (location, injuries, knowledge, relationships)
[EVENTS]
type|importance|description
(type: foreshadow, setup, climax, reveal, twist, resolution; importance: critical, major, normal, minor)
[WORLD]
category|name|description
[KEY CHARACTERS]
Comma-separated names
[KEY EVENTS]
One per line
[TONE]
One or two words";

/// Keep one entry per subject. A later entry replaces an earlier one in place.
fn last_per_subject<T>(items: Vec<T>, subject: impl Fn(&T) -> &str) -> Vec<T> {
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        match kept.iter().position(|k| subject(k) == subject(&item)) {
            Some(i) => kept[i] = item,
            None => kept.push(item),
        }
    }
    kept
}

fn list_lines(body: Option<&str>) -> Vec<String> {
    body.unwrap_or_default()
        .lines()
        .map(|l| l.trim().trim_start_matches(['-', '*', '•']).trim())
        .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("none"))
        .map(str::to_string)
        .collect()
}

pub fn parse_extraction(output: &str) -> Extraction {
    let parsed = sections(output);

    let characters = list_lines(section(&parsed, "CHARACTERS"))
        .into_iter()
        .filter_map(|line| {
            let cap = CHARACTER_LINE.captures(&line)?;
            let (name, state) = (cap[1].trim(), cap[2].trim());
            (!name.is_empty() && !state.is_empty()).then(|| (name.to_string(), state.to_string()))
        })
        .collect();

    let events = list_lines(section(&parsed, "EVENTS"))
        .into_iter()
        .map(|line| {
            let parts: Vec<&str> = line.splitn(3, '|').map(str::trim).collect();
            match parts.as_slice() {
                [kind, importance, description] => ExtractedEvent {
                    event_type: EventType::parse_lenient(kind),
                    importance: Importance::parse_lenient(importance),
                    description: description.to_string(),
                },
                _ => ExtractedEvent {
                    event_type: EventType::Setup,
                    importance: Importance::Normal,
                    description: line.clone(),
                },
            }
        })
        .filter(|e| !e.description.is_empty())
        .collect();

    let world = list_lines(section(&parsed, "WORLD"))
        .into_iter()
        .filter_map(|line| {
            let parts: Vec<&str> = line.splitn(3, '|').map(str::trim).collect();
            match parts.as_slice() {
                [category, name, description] => Some(ExtractedFact {
                    category: category.to_string(),
                    name: name.to_string(),
                    description: description.to_string(),
                }),
                [name, description] => Some(ExtractedFact {
                    category: "general".to_string(),
                    name: name.to_string(),
                    description: description.to_string(),
                }),
                _ => None,
            }
        })
        .filter(|f| !f.name.is_empty())
        .collect();

    let key_characters = section(&parsed, "KEY CHARACTERS")
        .unwrap_or_default()
        .split([',', '，', '、'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    Extraction {
        summary: section(&parsed, "SUMMARY").unwrap_or_default().to_string(),
        characters,
        events,
        world,
        key_characters,
        key_events: list_lines(section(&parsed, "KEY EVENTS")),
        tone: section(&parsed, "TONE")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    }
}
