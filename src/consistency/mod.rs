//! Periodic continuity audit over everything a work has remembered.
//!
//! The audit only reads memory and flags stale threads. It never edits
//! chapter text and never holds up production; a comparison that fails is
//! logged and skipped.

pub mod comparator;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use comparator::{Comparator, GeneratorComparator, Judgement, Severity};

use crate::errors::MemoryError;
use crate::memory::{Importance, MemoryRecord, MemoryStore, RecordId, RecordKind, RecordPayload, Similarity};
use crate::quill_config::AuditConfig;
use crate::work::WorkId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inconsistency {
    /// Chapters of the two records, ascending
    pub chapters: Vec<u32>,
    pub record_ids: Vec<RecordId>,
    pub severity: Severity,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleThread {
    pub record_id: RecordId,
    pub chapter: u32,
    pub description: String,
    pub importance: Importance,
    /// Chapters since the thread was opened
    pub age: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub work_id: WorkId,
    pub through_chapter: u32,
    pub generated_at: DateTime<Utc>,
    pub inconsistencies: Vec<Inconsistency>,
    pub stale_threads: Vec<StaleThread>,
    pub pairs_compared: usize,
    pub pairs_skipped: usize,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.inconsistencies.is_empty() && self.stale_threads.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "through chapter {}: {} inconsistencies, {} stale threads ({} pairs compared, {} skipped)",
            self.through_chapter,
            self.inconsistencies.len(),
            self.stale_threads.len(),
            self.pairs_compared,
            self.pairs_skipped
        )
    }
}

/// Comparisons in flight at once during an audit.
const COMPARE_CONCURRENCY: usize = 4;

pub struct ConsistencyAuditor {
    store: Arc<MemoryStore>,
    comparator: Arc<dyn Comparator>,
    similarity: Arc<dyn Similarity>,
    config: AuditConfig,
}

impl ConsistencyAuditor {
    pub fn new(
        store: Arc<MemoryStore>,
        comparator: Arc<dyn Comparator>,
        similarity: Arc<dyn Similarity>,
        config: AuditConfig,
    ) -> Self {
        Self {
            store,
            comparator,
            similarity,
            config,
        }
    }

    /// Audit every record from chapters up to `through_chapter`.
    #[instrument(skip(self, work), fields(work = %work))]
    pub async fn audit(&self, work: &WorkId, through_chapter: u32) -> Result<AuditReport, MemoryError> {
        let records: Vec<MemoryRecord> = self
            .store
            .records(work)
            .await?
            .into_iter()
            .filter(|r| r.chapter <= through_chapter)
            .collect();

        let pairs = self.candidate_pairs(&records);
        let comparator = &self.comparator;
        let comparisons: Vec<_> = pairs
            .iter()
            .map(|&(earlier, later)| {
                async move { (earlier, later, comparator.compare(earlier, later).await) }.boxed()
            })
            .collect();
        let judgements: Vec<_> = stream::iter(comparisons)
            .buffered(COMPARE_CONCURRENCY)
            .collect()
            .await;

        let mut inconsistencies = Vec::new();
        let mut pairs_skipped = 0;
        for (earlier, later, judgement) in judgements {
            match judgement {
                Ok(judgement) if judgement.contradictory => {
                    debug!(
                        earlier = earlier.chapter,
                        later = later.chapter,
                        "Contradiction found"
                    );
                    inconsistencies.push(Inconsistency {
                        chapters: vec![earlier.chapter, later.chapter],
                        record_ids: vec![earlier.id, later.id],
                        severity: judgement.severity,
                        kind: earlier.kind(),
                        subject: earlier.payload.subject().map(str::to_string),
                        explanation: judgement.explanation,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, earlier = %earlier.id, later = %later.id, "Comparison failed; pair skipped");
                    pairs_skipped += 1;
                }
            }
        }
        inconsistencies.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.chapters.cmp(&b.chapters))
        });

        let stale_threads = stale_threads(&records, through_chapter, self.config.stale_window);
        let ids: Vec<RecordId> = stale_threads.iter().map(|t| t.record_id).collect();
        let newly_flagged = self.store.flag_stale(work, &ids).await?;

        let report = AuditReport {
            work_id: work.clone(),
            through_chapter,
            generated_at: Utc::now(),
            inconsistencies,
            stale_threads,
            pairs_compared: pairs.len() - pairs_skipped,
            pairs_skipped,
        };
        info!(newly_flagged, "Audit {}", report.summary());
        Ok(report)
    }

    /// Successive character states across chapters, plus similar plot
    /// events from different chapters.
    fn candidate_pairs<'a>(&self, records: &'a [MemoryRecord]) -> Vec<(&'a MemoryRecord, &'a MemoryRecord)> {
        let limit = self.config.max_pairs_per_subject;
        let mut pairs = Vec::new();

        let mut by_character: BTreeMap<&str, Vec<&MemoryRecord>> = BTreeMap::new();
        for record in records {
            if let RecordPayload::CharacterState { character, .. } = &record.payload {
                by_character.entry(character.as_str()).or_default().push(record);
            }
        }
        for versions in by_character.values_mut() {
            versions.sort_by_key(|r| (r.chapter, r.created_at));
            let successive: Vec<_> = versions
                .windows(2)
                .filter(|w| w[0].chapter != w[1].chapter)
                .map(|w| (w[0], w[1]))
                .collect();
            // the most recent transitions matter most
            let skip = successive.len().saturating_sub(limit);
            pairs.extend(successive.into_iter().skip(skip));
        }

        let mut events: Vec<&MemoryRecord> = records
            .iter()
            .filter(|r| r.kind() == RecordKind::PlotEvent && r.is_current())
            .collect();
        events.sort_by_key(|r| (r.chapter, r.created_at));
        for (i, earlier) in events.iter().enumerate() {
            let mut partners: Vec<(f32, &MemoryRecord)> = events[i + 1..]
                .iter()
                .filter(|later| later.chapter != earlier.chapter)
                .map(|later| (self.similarity.score(&earlier.embedding, &later.embedding), *later))
                .filter(|(score, _)| *score >= self.config.event_similarity)
                .collect();
            partners.sort_by(|a, b| b.0.total_cmp(&a.0));
            pairs.extend(partners.into_iter().take(limit).map(|(_, later)| (*earlier, later)));
        }

        pairs
    }
}

/// Current unresolved plot events opened more than `window` chapters before
/// `through_chapter`, most important first.
pub fn stale_threads(records: &[MemoryRecord], through_chapter: u32, window: u32) -> Vec<StaleThread> {
    let mut stale: Vec<StaleThread> = records
        .iter()
        .filter(|r| r.is_current() && r.is_unresolved_event())
        .filter(|r| r.chapter + window < through_chapter)
        .filter_map(|r| match &r.payload {
            RecordPayload::PlotEvent {
                description,
                importance,
                ..
            } => Some(StaleThread {
                record_id: r.id,
                chapter: r.chapter,
                description: description.clone(),
                importance: *importance,
                age: through_chapter - r.chapter,
            }),
            _ => None,
        })
        .collect();
    stale.sort_by(|a, b| b.importance.cmp(&a.importance).then_with(|| a.chapter.cmp(&b.chapter)));
    stale
}
