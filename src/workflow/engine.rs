use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::events::{EventSink, WorkflowEvent};
use super::state::StateJournal;
use crate::consistency::{AuditReport, ConsistencyAuditor};
use crate::errors::{StageError, WorkflowError};
use crate::generation::RetryPolicy;
use crate::memory::RecordId;
use crate::quill_config::QuillToml;
use crate::stages::text::tail_chars;
use crate::stages::{ChapterState, ReviewVerdict, Stages, WorkBrief};
use crate::work::{AcceptedChapter, ChapterArchive, ItemStatus, Work, WorkId, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOptions {
    /// Re-edits allowed after a failed review before the item fails
    pub max_revisions: u32,
    /// Audit after every chapter whose number is a multiple of this; 0 disables
    pub audit_interval: u32,
    /// Characters of the previous chapter's ending handed to the producer
    pub ending_chars: usize,
    /// Attempt ceiling for generation and malformed-output failures
    pub retry: RetryPolicy,
}

impl EngineOptions {
    pub fn from_settings(settings: &QuillToml) -> Self {
        Self {
            max_revisions: settings.chapter.max_revisions,
            audit_interval: settings.audit.interval,
            ending_chars: settings.memory.ending_chars,
            retry: RetryPolicy::new(
                settings.generation.max_attempts,
                Duration::from_secs(settings.generation.timeout_secs),
                Duration::from_millis(settings.generation.backoff_ms),
            ),
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_settings(&QuillToml::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// The reviewer still rejected the draft after the last allowed revision
    QualityGate,
    GenerationExhausted { message: String },
    MalformedOutput { message: String },
    /// A failure that retrying cannot fix, such as a rejected API key
    Fatal { message: String },
}

impl FailureCause {
    fn from_error(err: &StageError, retryable: bool) -> Self {
        let message = err.to_string();
        match err {
            _ if !retryable => FailureCause::Fatal { message },
            StageError::MalformedOutput { .. } => FailureCause::MalformedOutput { message },
            _ => FailureCause::GenerationExhausted { message },
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::QualityGate => write!(f, "rejected by review after the last revision"),
            FailureCause::GenerationExhausted { message } => {
                write!(f, "attempt ceiling reached: {message}")
            }
            FailureCause::MalformedOutput { message } => {
                write!(f, "attempt ceiling reached on malformed output: {message}")
            }
            FailureCause::Fatal { message } => write!(f, "{message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChapterFailure {
    pub last_verdict: Option<ReviewVerdict>,
    pub attempts: u32,
    pub revisions: u32,
    pub cause: FailureCause,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChapterOutcome {
    Accepted {
        title: String,
        text: String,
        record_ids: Vec<RecordId>,
        revisions: u32,
        attempts: u32,
    },
    Failed(ChapterFailure),
}

impl ChapterOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ChapterOutcome::Accepted { .. })
    }
}

#[derive(Debug, Default)]
pub struct RangeReport {
    pub outcomes: Vec<(u32, ChapterOutcome)>,
    /// Already accepted before this run
    pub skipped: Vec<u32>,
    pub audits: Vec<AuditReport>,
    /// A chapter failed and later chapters were not attempted
    pub stopped_early: bool,
}

/// A range run cut short by a [`WorkflowError`]. `report` keeps the chapters
/// and audits that finished before the abort.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct RangeAborted {
    pub report: RangeReport,
    #[source]
    pub source: WorkflowError,
}

impl From<WorkflowError> for RangeAborted {
    fn from(source: WorkflowError) -> Self {
        Self {
            report: RangeReport::default(),
            source,
        }
    }
}

impl RangeReport {
    pub fn accepted(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_accepted()).count()
    }

    pub fn failed(&self) -> Option<(u32, &ChapterFailure)> {
        self.outcomes.iter().find_map(|(seq, o)| match o {
            ChapterOutcome::Failed(failure) => Some((*seq, failure)),
            ChapterOutcome::Accepted { .. } => None,
        })
    }
}

/// Where a failed review sends the item.
pub fn route_after_review(pass: bool, revision: u32, max_revisions: u32) -> ItemStatus {
    if pass {
        ItemStatus::Accepted
    } else if revision < max_revisions {
        ItemStatus::Editing
    } else {
        ItemStatus::Failed
    }
}

pub fn audit_due(sequence: u32, interval: u32) -> bool {
    interval > 0 && sequence % interval == 0
}

/// Drives one chapter at a time through its stages.
///
/// The engine owns no per-work state between calls. Everything a run needs
/// arrives as arguments, and everything it produces is written to the
/// archive and memory before the call returns.
pub struct WorkflowEngine {
    stages: Stages,
    archive: Arc<dyn ChapterArchive>,
    auditor: Arc<ConsistencyAuditor>,
    journal: Option<Arc<StateJournal>>,
    events: EventSink,
    options: EngineOptions,
}

impl WorkflowEngine {
    pub fn new(
        stages: Stages,
        archive: Arc<dyn ChapterArchive>,
        auditor: Arc<ConsistencyAuditor>,
        options: EngineOptions,
    ) -> Self {
        Self {
            stages,
            archive,
            auditor,
            journal: None,
            events: EventSink::none(),
            options,
        }
    }

    pub fn with_journal(mut self, journal: Arc<StateJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Produce one chapter from pending to a terminal state.
    ///
    /// Returns `Ok(Failed(..))` when the chapter ends in `Failed`. An `Err`
    /// means the run was aborted: cancelled, or accepted text whose memory
    /// update could not be written. Either way the item is left resumable.
    #[instrument(skip_all, fields(work = %work_id, chapter = item.sequence))]
    pub async fn produce_chapter(
        &self,
        work_id: &WorkId,
        brief: Arc<WorkBrief>,
        item: WorkItem,
        cancel: &CancellationToken,
    ) -> Result<ChapterOutcome, WorkflowError> {
        let sequence = item.sequence;
        let mut state = ChapterState::new(work_id.clone(), brief, item);
        self.events
            .emit(WorkflowEvent::ChapterStarted {
                work_id: work_id.clone(),
                sequence,
                title: state.item.display_title(),
            })
            .await;

        state.previous_ending = self.previous_ending(work_id, sequence)?;
        let mut attempts = 0u32;
        let mut memory_attempts = 0u32;
        state.status = ItemStatus::Drafting;
        self.checkpoint(&state, attempts)?;

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(&state, attempts);
            }
            let status = state.status;
            let stage = self
                .stages
                .for_status(status)
                .ok_or(WorkflowError::InvalidState { sequence, status })?;
            self.events
                .emit(WorkflowEvent::StageStarted {
                    work_id: work_id.clone(),
                    sequence,
                    stage: stage.name().to_string(),
                    revision: state.revision,
                })
                .await;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(&state, attempts),
                result = stage.run(&state) => result,
            };

            let next = match result {
                Ok(next) => next,
                Err(err) if status == ItemStatus::Accepted => {
                    memory_attempts += 1;
                    let retry = err.counts_against_ceiling()
                        && !self.options.retry.exhausted(memory_attempts);
                    self.stage_failed(&state, stage.name(), memory_attempts, &err, retry)
                        .await;
                    if !retry {
                        return Err(WorkflowError::MemoryUpdate {
                            sequence,
                            attempts: memory_attempts,
                            source: err,
                        });
                    }
                    self.backoff(memory_attempts, cancel, &state, attempts).await?;
                    continue;
                }
                Err(err) => {
                    let counted = err.counts_against_ceiling();
                    if counted {
                        attempts += 1;
                    }
                    let retry = counted && !self.options.retry.exhausted(attempts);
                    self.stage_failed(&state, stage.name(), attempts, &err, retry)
                        .await;
                    if !retry {
                        let cause = FailureCause::from_error(&err, counted);
                        return self.fail(state, attempts, cause).await;
                    }
                    self.backoff(attempts, cancel, &state, attempts).await?;
                    continue;
                }
            };

            match status {
                ItemStatus::Drafting | ItemStatus::Editing => {
                    state = next;
                    self.checkpoint(&state, attempts)?;
                }
                ItemStatus::Reviewing => {
                    state = next;
                    let verdict = state
                        .verdict
                        .as_ref()
                        .ok_or(WorkflowError::InvalidState { sequence, status })?;
                    self.events
                        .emit(WorkflowEvent::Reviewed {
                            work_id: work_id.clone(),
                            sequence,
                            revision: state.revision,
                            aggregate: verdict.aggregate,
                            pass: verdict.pass,
                            failing: verdict
                                .failing_dimensions()
                                .into_iter()
                                .map(str::to_string)
                                .collect(),
                        })
                        .await;

                    match route_after_review(verdict.pass, state.revision, self.options.max_revisions) {
                        // not checkpointed until memory holds the chapter
                        ItemStatus::Accepted => state.status = ItemStatus::Accepted,
                        ItemStatus::Editing => {
                            state.revision += 1;
                            state.status = ItemStatus::Editing;
                            debug!(revision = state.revision, "Review failed; re-editing");
                            self.checkpoint(&state, attempts)?;
                        }
                        _ => return self.fail(state, attempts, FailureCause::QualityGate).await,
                    }
                }
                ItemStatus::Accepted => return self.accept(next, attempts).await,
                ItemStatus::Pending | ItemStatus::Failed => {
                    return Err(WorkflowError::InvalidState { sequence, status });
                }
            }
        }
    }

    /// Produce the selected items in ascending order, auditing whenever a
    /// chapter number hits the audit interval. Already accepted items are
    /// skipped and the run stops at the first failed chapter.
    ///
    /// An abort hands back the partial report so audits already run are not
    /// lost.
    #[instrument(skip_all, fields(work = %work.id))]
    pub async fn produce_chapter_range(
        &self,
        work: &Work,
        selection: Option<&[u32]>,
        cancel: &CancellationToken,
    ) -> Result<RangeReport, RangeAborted> {
        if let Some(missing) = selection
            .unwrap_or_default()
            .iter()
            .find(|seq| work.item(**seq).is_none())
        {
            return Err(WorkflowError::UnknownItem {
                work: work.id.to_string(),
                sequence: *missing,
            }
            .into());
        }

        let brief = Arc::new(WorkBrief::from(work));
        let mut report = RangeReport::default();
        for item in work.select(selection) {
            let sequence = item.sequence;
            if item.status == ItemStatus::Accepted {
                debug!(chapter = sequence, "Already accepted; skipping");
                report.skipped.push(sequence);
                continue;
            }

            let outcome = match self
                .produce_chapter(&work.id, brief.clone(), item, cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(source) => {
                    warn!(chapter = sequence, error = %source, "Range aborted");
                    return Err(RangeAborted { report, source });
                }
            };
            let failed = !outcome.is_accepted();
            report.outcomes.push((sequence, outcome));
            if failed {
                warn!(chapter = sequence, "Chapter failed; stopping the range");
                report.stopped_early = true;
                break;
            }

            if audit_due(sequence, self.options.audit_interval) {
                match self.audit(&work.id, sequence).await {
                    Ok(audit) => report.audits.push(audit),
                    Err(e) => warn!(chapter = sequence, error = %e, "Consistency audit failed; continuing"),
                }
            }
        }
        info!(
            accepted = report.accepted(),
            skipped = report.skipped.len(),
            audits = report.audits.len(),
            "Range finished"
        );
        Ok(report)
    }

    /// Run the consistency audit over memory up to `through_chapter`.
    pub async fn audit(&self, work: &WorkId, through_chapter: u32) -> Result<AuditReport, WorkflowError> {
        let report = self
            .auditor
            .audit(work, through_chapter)
            .await
            .map_err(WorkflowError::Audit)?;
        self.events
            .emit(WorkflowEvent::AuditCompleted {
                work_id: work.clone(),
                through_chapter,
                inconsistencies: report.inconsistencies.len(),
                stale_threads: report.stale_threads.len(),
            })
            .await;
        Ok(report)
    }

    fn previous_ending(&self, work: &WorkId, sequence: u32) -> Result<Option<String>, WorkflowError> {
        if sequence <= 1 || self.options.ending_chars == 0 {
            return Ok(None);
        }
        let previous = self
            .archive
            .chapter(work, sequence - 1)
            .map_err(WorkflowError::Archive)?;
        Ok(previous.map(|c| tail_chars(c.text.trim_end(), self.options.ending_chars)))
    }

    /// Persist the state's status to the journal and the archive.
    fn checkpoint(&self, state: &ChapterState, attempts: u32) -> Result<(), WorkflowError> {
        if let Some(journal) = &self.journal {
            journal
                .record(&state.work_id, state.item.sequence, state.revision, state.status)
                .map_err(WorkflowError::Archive)?;
        }
        self.archive
            .set_status(
                &state.work_id,
                state.item.sequence,
                state.status,
                state.revision,
                attempts,
            )
            .map_err(WorkflowError::Archive)
    }

    async fn accept(&self, state: ChapterState, attempts: u32) -> Result<ChapterOutcome, WorkflowError> {
        let sequence = state.item.sequence;
        let draft = state.draft.clone().ok_or(WorkflowError::InvalidState {
            sequence,
            status: ItemStatus::Accepted,
        })?;
        self.archive
            .save_accepted(
                &state.work_id,
                &AcceptedChapter {
                    sequence,
                    title: draft.title.clone(),
                    text: draft.text.clone(),
                },
            )
            .map_err(WorkflowError::Archive)?;
        self.checkpoint(&state, attempts)?;

        info!(
            revisions = state.revision,
            attempts,
            records = state.record_ids.len(),
            "Chapter accepted"
        );
        self.events
            .emit(WorkflowEvent::ChapterAccepted {
                work_id: state.work_id.clone(),
                sequence,
                revisions: state.revision,
                attempts,
                records: state.record_ids.len(),
            })
            .await;

        Ok(ChapterOutcome::Accepted {
            title: draft.title,
            text: draft.text,
            record_ids: state.record_ids,
            revisions: state.revision,
            attempts,
        })
    }

    async fn fail(
        &self,
        mut state: ChapterState,
        attempts: u32,
        cause: FailureCause,
    ) -> Result<ChapterOutcome, WorkflowError> {
        state.status = ItemStatus::Failed;
        self.checkpoint(&state, attempts)?;
        warn!(revisions = state.revision, attempts, cause = %cause, "Chapter failed");
        self.events
            .emit(WorkflowEvent::ChapterFailed {
                work_id: state.work_id.clone(),
                sequence: state.item.sequence,
                revisions: state.revision,
                attempts,
                reason: cause.to_string(),
            })
            .await;

        Ok(ChapterOutcome::Failed(ChapterFailure {
            last_verdict: state.verdict,
            attempts,
            revisions: state.revision,
            cause,
        }))
    }

    /// Reset the item to pending and abort.
    ///
    /// Only reachable before `accept` has saved the text, so an item whose
    /// in-memory status already reads `Accepted` is still mid-flight here.
    fn cancelled(&self, state: &ChapterState, attempts: u32) -> Result<ChapterOutcome, WorkflowError> {
        let mut resumable = state.clone();
        resumable.status = ItemStatus::Pending;
        resumable.revision = 0;
        self.checkpoint(&resumable, attempts)?;
        info!(at = %state.status, "Chapter cancelled");
        Err(WorkflowError::Cancelled {
            sequence: state.item.sequence,
        })
    }

    async fn stage_failed(
        &self,
        state: &ChapterState,
        stage: &str,
        attempt: u32,
        err: &StageError,
        will_retry: bool,
    ) {
        warn!(stage, attempt, will_retry, error = %err, "Stage failed");
        self.events
            .emit(WorkflowEvent::StageFailed {
                work_id: state.work_id.clone(),
                sequence: state.item.sequence,
                stage: stage.to_string(),
                attempt,
                message: err.to_string(),
                will_retry,
            })
            .await;
    }

    async fn backoff(
        &self,
        failed: u32,
        cancel: &CancellationToken,
        state: &ChapterState,
        attempts: u32,
    ) -> Result<(), WorkflowError> {
        let delay = self.options.retry.delay_after(failed);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => self.cancelled(state, attempts).map(|_| ()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_after_review() {
        assert_eq!(route_after_review(true, 0, 3), ItemStatus::Accepted);
        assert_eq!(route_after_review(true, 3, 3), ItemStatus::Accepted);
        assert_eq!(route_after_review(false, 0, 3), ItemStatus::Editing);
        assert_eq!(route_after_review(false, 2, 3), ItemStatus::Editing);
        assert_eq!(route_after_review(false, 3, 3), ItemStatus::Failed);
    }

    #[test]
    fn test_route_with_zero_revisions_fails_immediately() {
        assert_eq!(route_after_review(false, 0, 0), ItemStatus::Failed);
    }

    #[test]
    fn test_audit_due() {
        let due: Vec<u32> = (1..=12).filter(|s| audit_due(*s, 5)).collect();
        assert_eq!(due, vec![5, 10]);
        assert!(!audit_due(5, 0));
    }

    #[test]
    fn test_failure_cause_classification() {
        let malformed = StageError::MalformedOutput {
            stage: "editor",
            message: "empty".into(),
        };
        assert!(matches!(
            FailureCause::from_error(&malformed, true),
            FailureCause::MalformedOutput { .. }
        ));
        assert!(matches!(
            FailureCause::from_error(&malformed, false),
            FailureCause::Fatal { .. }
        ));
        let timeout = StageError::Generation(crate::errors::GenerationError::Timeout {
            after: Duration::from_secs(1),
        });
        assert!(matches!(
            FailureCause::from_error(&timeout, true),
            FailureCause::GenerationExhausted { .. }
        ));
    }

    #[test]
    fn test_engine_options_from_settings() {
        let mut settings = QuillToml::default();
        settings.chapter.max_revisions = 2;
        settings.audit.interval = 4;
        let options = EngineOptions::from_settings(&settings);
        assert_eq!(options.max_revisions, 2);
        assert_eq!(options.audit_interval, 4);
        assert_eq!(options.retry.max_attempts, settings.generation.max_attempts);
    }
}
