//! Pushing accepted chapters to the serial-fiction backend.
//!
//! Publishing is four ordered steps: volume lookup, draft submission,
//! publish and history snapshot. Submitting a draft is repeatable. Publishing
//! is not, so the ledger remembers every step that succeeded and a rerun
//! picks up at the first one that did not.

pub mod http;
pub mod ledger;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

pub use http::HttpPublishClient;
pub use ledger::{LedgerEntry, PublishLedger, content_hash};

use crate::errors::{PublishError, PublishSequenceError};
use crate::quill_config::{PublishConfig, PublishMode};
use crate::work::{AcceptedChapter, WorkId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStep {
    VolumeLookup,
    SubmitDraft,
    Publish,
    RecordHistory,
}

impl std::fmt::Display for PublishStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishStep::VolumeLookup => write!(f, "volume lookup"),
            PublishStep::SubmitDraft => write!(f, "draft submission"),
            PublishStep::Publish => write!(f, "publish"),
            PublishStep::RecordHistory => write!(f, "history snapshot"),
        }
    }
}

/// What a sequence obtained before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishProgress {
    pub volume_id: Option<String>,
    pub item_id: Option<String>,
    pub version: Option<String>,
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftSubmission {
    pub book_id: String,
    pub volume: Volume,
    /// Existing backend item to overwrite
    pub item_id: Option<String>,
    pub title: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftReceipt {
    pub item_id: String,
    pub version: String,
}

#[async_trait]
pub trait PublishClient: Send + Sync {
    async fn volumes(&self, book_id: &str) -> Result<Vec<Volume>, PublishError>;

    async fn submit_draft(&self, draft: &DraftSubmission) -> Result<DraftReceipt, PublishError>;

    async fn publish(&self, book_id: &str, draft: &DraftSubmission, item_id: &str) -> Result<(), PublishError>;

    async fn record_history(&self, book_id: &str, item_id: &str, version: &str) -> Result<(), PublishError>;
}

#[derive(Debug)]
pub enum ChapterPublishResult {
    Skipped { reason: String },
    Drafted(PublishProgress),
    Published(PublishProgress),
    Failed(PublishSequenceError),
}

#[derive(Debug, Default)]
pub struct PublishReport {
    pub results: Vec<(u32, ChapterPublishResult)>,
}

impl PublishReport {
    pub fn failures(&self) -> impl Iterator<Item = &PublishSequenceError> {
        self.results.iter().filter_map(|(_, r)| match r {
            ChapterPublishResult::Failed(e) => Some(e),
            _ => None,
        })
    }

    pub fn count(&self, f: impl Fn(&ChapterPublishResult) -> bool) -> usize {
        self.results.iter().filter(|(_, r)| f(r)).count()
    }
}

/// Wrap each non-empty line in a paragraph tag.
pub fn text_to_html(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| format!("<p>{l}</p>"))
        .collect()
}

/// Chapter title as the backend shows it, cut to `max_chars`.
pub fn format_title(template: &str, sequence: u32, title: &str, max_chars: usize) -> String {
    let formatted = template
        .replace("{n}", &sequence.to_string())
        .replace("{title}", title.trim());
    formatted.trim().chars().take(max_chars).collect()
}

pub struct PublishSequencer {
    client: Arc<dyn PublishClient>,
    ledger: PublishLedger,
    book_id: String,
    title_template: String,
    title_max_chars: usize,
}

impl PublishSequencer {
    pub fn new(
        client: Arc<dyn PublishClient>,
        ledger: PublishLedger,
        book_id: impl Into<String>,
        config: &PublishConfig,
    ) -> Self {
        Self {
            client,
            ledger,
            book_id: book_id.into(),
            title_template: config.title_template.clone(),
            title_max_chars: config.title_max_chars,
        }
    }

    /// Publish `chapters` in order. A chapter that fails part-way is
    /// reported with its progress and the remaining chapters still run.
    /// Only a failed volume lookup stops the whole batch.
    #[instrument(skip_all, fields(work = %work, mode = %mode, chapters = chapters.len()))]
    pub async fn publish_chapters(
        &mut self,
        work: &WorkId,
        chapters: &[AcceptedChapter],
        mode: PublishMode,
    ) -> Result<PublishReport, PublishSequenceError> {
        let mut report = PublishReport::default();
        let Some(first) = chapters.first() else {
            return Ok(report);
        };

        let volume = self.volume().await.map_err(|source| PublishSequenceError {
            chapter: first.sequence,
            step: PublishStep::VolumeLookup,
            progress: PublishProgress::default(),
            source,
        })?;

        for chapter in chapters {
            let result = match self.publish_chapter(work, chapter, &volume, mode).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(chapter = chapter.sequence, step = %e.step, error = %e.source, "Publishing stopped");
                    ChapterPublishResult::Failed(e)
                }
            };
            report.results.push((chapter.sequence, result));
        }
        Ok(report)
    }

    async fn volume(&self) -> Result<Volume, PublishError> {
        self.client
            .volumes(&self.book_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PublishError::MissingVolume {
                book_id: self.book_id.clone(),
            })
    }

    async fn publish_chapter(
        &mut self,
        work: &WorkId,
        chapter: &AcceptedChapter,
        volume: &Volume,
        mode: PublishMode,
    ) -> Result<ChapterPublishResult, PublishSequenceError> {
        let sequence = chapter.sequence;
        let hash = content_hash(&chapter.title, &chapter.text);
        let entry = self
            .ledger
            .get(work, sequence)
            .filter(|e| e.content_hash == hash)
            .cloned();

        if let Some(entry) = &entry {
            if entry.published && (entry.history_recorded || mode == PublishMode::Draft) {
                return Ok(ChapterPublishResult::Skipped {
                    reason: "unchanged since it was published".to_string(),
                });
            }
            if mode == PublishMode::Draft {
                return Ok(ChapterPublishResult::Skipped {
                    reason: "draft already submitted".to_string(),
                });
            }
        }

        let mut progress = PublishProgress {
            volume_id: Some(volume.id.clone()),
            ..Default::default()
        };
        let fail = |step: PublishStep, progress: &PublishProgress, source: PublishError| PublishSequenceError {
            chapter: sequence,
            step,
            progress: progress.clone(),
            source,
        };

        let draft = DraftSubmission {
            book_id: self.book_id.clone(),
            volume: volume.clone(),
            // changed content overwrites the draft already on the backend
            item_id: self.ledger.get(work, sequence).map(|e| e.item_id.clone()),
            title: format_title(&self.title_template, sequence, &chapter.title, self.title_max_chars),
            html: text_to_html(&chapter.text),
        };

        let (item_id, version, already_published) = match entry {
            Some(entry) => (entry.item_id, entry.version, entry.published),
            None => {
                let receipt = self
                    .client
                    .submit_draft(&draft)
                    .await
                    .map_err(|e| fail(PublishStep::SubmitDraft, &progress, e))?;
                self.ledger
                    .record_draft(work, sequence, &receipt.item_id, &receipt.version, &hash)
                    .map_err(|e| fail(PublishStep::SubmitDraft, &progress, PublishError::Ledger(e)))?;
                info!(chapter = sequence, item_id = %receipt.item_id, "Draft submitted");
                (receipt.item_id, receipt.version, false)
            }
        };
        progress.item_id = Some(item_id.clone());
        progress.version = Some(version.clone());

        if mode == PublishMode::Draft {
            return Ok(ChapterPublishResult::Drafted(progress));
        }

        if !already_published {
            self.client
                .publish(&self.book_id, &draft, &item_id)
                .await
                .map_err(|e| fail(PublishStep::Publish, &progress, e))?;
            self.ledger
                .mark_published(work, sequence)
                .map_err(|e| fail(PublishStep::Publish, &progress, PublishError::Ledger(e)))?;
            info!(chapter = sequence, item_id = %item_id, "Chapter published");
        }
        progress.published = true;

        self.client
            .record_history(&self.book_id, &item_id, &version)
            .await
            .map_err(|e| fail(PublishStep::RecordHistory, &progress, e))?;
        self.ledger
            .mark_history_recorded(work, sequence)
            .map_err(|e| fail(PublishStep::RecordHistory, &progress, PublishError::Ledger(e)))?;

        Ok(ChapterPublishResult::Published(progress))
    }
}
