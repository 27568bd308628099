//! Chapter production: the per-item state machine, the range driver with
//! its periodic audits, and the scheduler that runs works side by side.

pub mod engine;
pub mod events;
pub mod scheduler;
pub mod state;

pub use engine::{
    ChapterFailure, ChapterOutcome, EngineOptions, FailureCause, RangeAborted, RangeReport,
    WorkflowEngine, audit_due, route_after_review,
};
pub use events::{EventSink, WorkflowEvent};
pub use scheduler::{WorkRun, WorkScheduler};
pub use state::{JournalEntry, StateJournal};
