//! The four stages a chapter passes through.
//!
//! Stages form a closed set dispatched through [`Stage::run`], which takes
//! the current [`ChapterState`] and returns the next one. A failed run leaves
//! the input state untouched, so the engine can retry the same transition.

pub mod editor;
pub mod memory_update;
pub mod producer;
pub mod review;
pub mod text;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::StageError;
use crate::memory::{RecordId, RetrievedContext};
use crate::work::{ItemStatus, Work, WorkId, WorkItem};

pub use editor::EditorStage;
pub use memory_update::MemoryUpdateStage;
pub use producer::ProducerStage;
pub use review::{DimensionScore, ReviewStage, ReviewVerdict};

/// Work-level information every stage prompt needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkBrief {
    pub title: String,
    pub genre: String,
    pub synopsis: String,
    pub style_guide: String,
}

impl From<&Work> for WorkBrief {
    fn from(work: &Work) -> Self {
        Self {
            title: work.title.clone(),
            genre: work.genre.clone(),
            synopsis: work.synopsis.clone(),
            style_guide: work.style_guide.clone(),
        }
    }
}

/// The single draft in flight for an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub title: String,
    pub text: String,
    /// Revision this text was produced under
    pub revision: u32,
}

/// Everything one chapter run carries between stages.
#[derive(Debug, Clone)]
pub struct ChapterState {
    pub work_id: WorkId,
    pub brief: Arc<WorkBrief>,
    pub item: WorkItem,
    pub status: ItemStatus,
    pub previous_ending: Option<String>,
    pub context: Option<RetrievedContext>,
    pub draft: Option<Draft>,
    pub verdict: Option<ReviewVerdict>,
    /// Times the draft was sent back to the editor after a failed review
    pub revision: u32,
    pub record_ids: Vec<RecordId>,
}

impl ChapterState {
    pub fn new(work_id: WorkId, brief: Arc<WorkBrief>, item: WorkItem) -> Self {
        Self {
            work_id,
            brief,
            item,
            status: ItemStatus::Pending,
            previous_ending: None,
            context: None,
            draft: None,
            verdict: None,
            revision: 0,
            record_ids: Vec::new(),
        }
    }

    pub(crate) fn require_draft(&self, stage: &'static str) -> Result<&Draft, StageError> {
        self.draft.as_ref().ok_or(StageError::MalformedOutput {
            stage,
            message: "no draft to work on".to_string(),
        })
    }
}

pub enum Stage {
    Produce(ProducerStage),
    Edit(EditorStage),
    Review(ReviewStage),
    Remember(MemoryUpdateStage),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Produce(_) => "producer",
            Stage::Edit(_) => "editor",
            Stage::Review(_) => "review",
            Stage::Remember(_) => "memory",
        }
    }

    pub async fn run(&self, state: &ChapterState) -> Result<ChapterState, StageError> {
        match self {
            Stage::Produce(stage) => stage.run(state).await,
            Stage::Edit(stage) => stage.run(state).await,
            Stage::Review(stage) => stage.run(state).await,
            Stage::Remember(stage) => stage.run(state).await,
        }
    }
}

/// The full set of stages an engine runs, one per status.
pub struct Stages {
    pub produce: Stage,
    pub edit: Stage,
    pub review: Stage,
    pub remember: Stage,
}

impl Stages {
    pub fn new(
        producer: ProducerStage,
        editor: EditorStage,
        reviewer: ReviewStage,
        memory: MemoryUpdateStage,
    ) -> Self {
        Self {
            produce: Stage::Produce(producer),
            edit: Stage::Edit(editor),
            review: Stage::Review(reviewer),
            remember: Stage::Remember(memory),
        }
    }

    /// Stage that advances an item out of `status`, if any.
    pub fn for_status(&self, status: ItemStatus) -> Option<&Stage> {
        match status {
            ItemStatus::Drafting => Some(&self.produce),
            ItemStatus::Editing => Some(&self.edit),
            ItemStatus::Reviewing => Some(&self.review),
            ItemStatus::Accepted => Some(&self.remember),
            ItemStatus::Pending | ItemStatus::Failed => None,
        }
    }
}
