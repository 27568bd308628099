use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::work::WorkId;

/// Progress notifications emitted while chapters are produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ChapterStarted {
        work_id: WorkId,
        sequence: u32,
        title: String,
    },
    StageStarted {
        work_id: WorkId,
        sequence: u32,
        stage: String,
        revision: u32,
    },
    StageFailed {
        work_id: WorkId,
        sequence: u32,
        stage: String,
        attempt: u32,
        message: String,
        will_retry: bool,
    },
    Reviewed {
        work_id: WorkId,
        sequence: u32,
        revision: u32,
        aggregate: f32,
        pass: bool,
        failing: Vec<String>,
    },
    ChapterAccepted {
        work_id: WorkId,
        sequence: u32,
        revisions: u32,
        attempts: u32,
        records: usize,
    },
    ChapterFailed {
        work_id: WorkId,
        sequence: u32,
        revisions: u32,
        attempts: u32,
        reason: String,
    },
    AuditCompleted {
        work_id: WorkId,
        through_chapter: u32,
        inconsistencies: usize,
        stale_threads: usize,
    },
}

impl WorkflowEvent {
    pub fn work_id(&self) -> &WorkId {
        match self {
            WorkflowEvent::ChapterStarted { work_id, .. }
            | WorkflowEvent::StageStarted { work_id, .. }
            | WorkflowEvent::StageFailed { work_id, .. }
            | WorkflowEvent::Reviewed { work_id, .. }
            | WorkflowEvent::ChapterAccepted { work_id, .. }
            | WorkflowEvent::ChapterFailed { work_id, .. }
            | WorkflowEvent::AuditCompleted { work_id, .. } => work_id,
        }
    }
}

/// Optional event sink. Sending never fails the workflow: a closed
/// receiver just means nobody is watching.
#[derive(Clone, Default)]
pub struct EventSink(Option<mpsc::Sender<WorkflowEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::Sender<WorkflowEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub async fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = WorkflowEvent::AuditCompleted {
            work_id: WorkId::new("river"),
            through_chapter: 5,
            inconsistencies: 1,
            stale_threads: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "audit_completed");
        assert_eq!(json["work_id"], "river");
    }

    #[tokio::test]
    async fn test_sink_survives_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = EventSink::new(tx);
        sink.emit(WorkflowEvent::ChapterStarted {
            work_id: WorkId::new("w"),
            sequence: 1,
            title: "One".into(),
        })
        .await;
    }
}
