use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::work::WorkId;
use crate::workflow::WorkflowEvent;

/// One `quill write` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRun {
    pub run_id: Uuid,
    pub work_id: WorkId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub settings: RunSettings,
    pub chapters: Vec<ChapterRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audits: Vec<AuditSummary>,
}

impl WriteRun {
    pub fn new(work_id: WorkId, settings: RunSettings) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            work_id,
            started_at: Utc::now(),
            ended_at: None,
            settings,
            chapters: Vec::new(),
            audits: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
        for chapter in &mut self.chapters {
            if chapter.outcome == ChapterRunOutcome::InProgress {
                chapter.outcome = ChapterRunOutcome::Interrupted;
                chapter.ended_at = self.ended_at;
            }
        }
    }

    fn chapter_mut(&mut self, sequence: u32) -> Option<&mut ChapterRecord> {
        self.chapters.iter_mut().rev().find(|c| c.sequence == sequence)
    }

    /// Fold a workflow event into the run record.
    pub fn apply(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::ChapterStarted { sequence, .. } => {
                self.chapters.push(ChapterRecord::new(*sequence));
            }
            WorkflowEvent::StageStarted { .. } => {}
            WorkflowEvent::StageFailed {
                sequence,
                stage,
                message,
                ..
            } => {
                if let Some(chapter) = self.chapter_mut(*sequence) {
                    chapter.failures.push(format!("{stage}: {message}"));
                }
            }
            WorkflowEvent::Reviewed {
                sequence,
                revision,
                aggregate,
                pass,
                failing,
                ..
            } => {
                if let Some(chapter) = self.chapter_mut(*sequence) {
                    chapter.verdicts.push(VerdictRecord {
                        revision: *revision,
                        aggregate: *aggregate,
                        pass: *pass,
                        failing: failing.clone(),
                    });
                }
            }
            WorkflowEvent::ChapterAccepted {
                sequence,
                revisions,
                attempts,
                records,
                ..
            } => {
                if let Some(chapter) = self.chapter_mut(*sequence) {
                    chapter.finish(*revisions, *attempts, ChapterRunOutcome::Accepted { records: *records });
                }
            }
            WorkflowEvent::ChapterFailed {
                sequence,
                revisions,
                attempts,
                reason,
                ..
            } => {
                if let Some(chapter) = self.chapter_mut(*sequence) {
                    chapter.finish(
                        *revisions,
                        *attempts,
                        ChapterRunOutcome::Failed {
                            reason: reason.clone(),
                        },
                    );
                }
            }
            WorkflowEvent::AuditCompleted {
                through_chapter,
                inconsistencies,
                stale_threads,
                ..
            } => self.audits.push(AuditSummary {
                through_chapter: *through_chapter,
                inconsistencies: *inconsistencies,
                stale_threads: *stale_threads,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub max_revisions: u32,
    pub max_attempts: u32,
    pub audit_interval: u32,
    /// Explicit chapter selection; empty means the whole outline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selection: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub sequence: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub revisions: u32,
    pub attempts: u32,
    pub verdicts: Vec<VerdictRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
    pub outcome: ChapterRunOutcome,
}

impl ChapterRecord {
    pub fn new(sequence: u32) -> Self {
        Self {
            sequence,
            started_at: Utc::now(),
            ended_at: None,
            revisions: 0,
            attempts: 0,
            verdicts: Vec::new(),
            failures: Vec::new(),
            outcome: ChapterRunOutcome::InProgress,
        }
    }

    fn finish(&mut self, revisions: u32, attempts: u32, outcome: ChapterRunOutcome) {
        self.ended_at = Some(Utc::now());
        self.revisions = revisions;
        self.attempts = attempts;
        self.outcome = outcome;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub revision: u32,
    pub aggregate: f32,
    pub pass: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub through_chapter: u32,
    pub inconsistencies: usize,
    pub stale_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChapterRunOutcome {
    InProgress,
    Accepted { records: usize },
    Failed { reason: String },
    /// The run ended (cancelled or aborted) before the chapter finished
    Interrupted,
}

pub mod logger;
pub use logger::AuditLogger;

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RunSettings {
        RunSettings {
            max_revisions: 3,
            max_attempts: 3,
            audit_interval: 5,
            selection: Vec::new(),
        }
    }

    #[test]
    fn test_write_run_new() {
        let run = WriteRun::new(WorkId::new("w"), settings());
        assert!(run.ended_at.is_none());
        assert!(run.chapters.is_empty());
    }

    #[test]
    fn test_events_fold_into_chapter_record() {
        let work_id = WorkId::new("w");
        let mut run = WriteRun::new(work_id.clone(), settings());
        run.apply(&WorkflowEvent::ChapterStarted {
            work_id: work_id.clone(),
            sequence: 1,
            title: "Chapter 1".into(),
        });
        run.apply(&WorkflowEvent::Reviewed {
            work_id: work_id.clone(),
            sequence: 1,
            revision: 0,
            aggregate: 5.5,
            pass: false,
            failing: vec!["length".into()],
        });
        run.apply(&WorkflowEvent::ChapterAccepted {
            work_id,
            sequence: 1,
            revisions: 1,
            attempts: 0,
            records: 4,
        });

        let chapter = &run.chapters[0];
        assert_eq!(chapter.verdicts.len(), 1);
        assert_eq!(chapter.revisions, 1);
        assert_eq!(chapter.outcome, ChapterRunOutcome::Accepted { records: 4 });
    }

    #[test]
    fn test_finish_marks_unfinished_chapters_interrupted() {
        let work_id = WorkId::new("w");
        let mut run = WriteRun::new(work_id.clone(), settings());
        run.apply(&WorkflowEvent::ChapterStarted {
            work_id,
            sequence: 2,
            title: "Chapter 2".into(),
        });
        run.finish();
        assert_eq!(run.chapters[0].outcome, ChapterRunOutcome::Interrupted);
    }
}
