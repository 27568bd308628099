//! Typed error hierarchy for quill.
//!
//! One enum per subsystem:
//! - `GenerationError`: generation / embedding collaborator failures
//! - `MemoryError`: memory store persistence and embedding
//! - `StageError`: a single stage attempt inside the chapter workflow
//! - `WorkflowError`: conditions that abort a chapter or a range run
//! - `PublishError` / `PublishSequenceError`: publishing backend and sequencing

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::publish::PublishProgress;
use crate::publish::PublishStep;
use crate::work::ItemStatus;

/// Failures reported by the generation or embedding collaborator.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generation timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited by generation backend")]
    RateLimited,

    #[error("Generation backend returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Generation backend returned an empty response")]
    EmptyResponse,

    #[error("Could not decode generation response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout { .. }
            | GenerationError::Transport(_)
            | GenerationError::RateLimited
            | GenerationError::EmptyResponse => true,
            GenerationError::Api { status, .. } => *status >= 500 || *status == 408,
            GenerationError::InvalidResponse(_) => false,
        }
    }
}

/// Errors from the memory store.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Embedding failed: {0}")]
    Embedding(#[source] GenerationError),

    #[error("Failed to persist memory partition at {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load memory partition at {path}: {message}")]
    Load { path: PathBuf, message: String },

    #[error("Record {id} not found in work {work}")]
    UnknownRecord { work: String, id: String },

    #[error("Record {id} was already superseded")]
    AlreadySuperseded { id: String },
}

/// Failure of one stage attempt.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("{stage} produced malformed output: {message}")]
    MalformedOutput { stage: &'static str, message: String },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl StageError {
    /// Whether this failure consumes one unit of the attempt ceiling and the
    /// transition may be retried. Non-retryable generation errors end the item.
    pub fn counts_against_ceiling(&self) -> bool {
        match self {
            StageError::Generation(e) => e.is_retryable(),
            StageError::MalformedOutput { .. } => true,
            StageError::Memory(MemoryError::Embedding(e)) => e.is_retryable(),
            StageError::Memory(_) => false,
        }
    }
}

/// Errors that abort a chapter run rather than ending it in `Failed`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Chapter {sequence} was cancelled; it will restart from pending")]
    Cancelled { sequence: u32 },

    #[error("Memory update for chapter {sequence} failed after {attempts} attempts: {source}")]
    MemoryUpdate {
        sequence: u32,
        attempts: u32,
        #[source]
        source: StageError,
    },

    #[error("Chapter {sequence} is not part of work {work}")]
    UnknownItem { work: String, sequence: u32 },

    #[error("Chapter {sequence} reached {status} with no stage to run")]
    InvalidState { sequence: u32, status: ItemStatus },

    #[error("Canonical storage error: {0}")]
    Archive(#[source] anyhow::Error),

    #[error("Consistency audit failed: {0}")]
    Audit(#[source] MemoryError),

    #[error("Task for work {work} ended abnormally: {message}")]
    TaskFailed { work: String, message: String },
}

/// Errors from a publishing backend call.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Publishing backend rejected the request (code {code}): {message}")]
    Api { code: i64, message: String },

    #[error("No volume available for book {book_id}")]
    MissingVolume { book_id: String },

    #[error("Backend response did not contain an item id")]
    MissingItemId,

    #[error("Publish ledger error: {0}")]
    Ledger(#[source] anyhow::Error),
}

/// A publishing sequence that stopped part-way, with whatever it had already
/// obtained so the caller can resume at the failing step.
#[derive(Debug, Error)]
#[error("Publishing chapter {chapter} failed at {step}: {source}")]
pub struct PublishSequenceError {
    pub chapter: u32,
    pub step: PublishStep,
    pub progress: PublishProgress,
    #[source]
    pub source: PublishError,
}
