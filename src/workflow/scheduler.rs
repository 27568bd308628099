use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::engine::{RangeAborted, RangeReport, WorkflowEngine};
use crate::errors::WorkflowError;
use crate::work::{Work, WorkId};

/// Result of one work's range run.
#[derive(Debug)]
pub struct WorkRun {
    pub work_id: WorkId,
    pub result: Result<RangeReport, RangeAborted>,
}

/// Runs independent works concurrently, one task per work.
///
/// Chapters of one work stay strictly sequential inside their task. Each
/// work gets a child token of the scheduler's token, so cancelling one work
/// leaves the others running while `cancel_all` stops everything.
pub struct WorkScheduler {
    engine: Arc<WorkflowEngine>,
    root: CancellationToken,
    tasks: JoinSet<WorkRun>,
    tokens: HashMap<WorkId, CancellationToken>,
    task_ids: HashMap<Id, WorkId>,
}

impl WorkScheduler {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self::with_token(engine, CancellationToken::new())
    }

    pub fn with_token(engine: Arc<WorkflowEngine>, root: CancellationToken) -> Self {
        Self {
            engine,
            root,
            tasks: JoinSet::new(),
            tokens: HashMap::new(),
            task_ids: HashMap::new(),
        }
    }

    /// Start producing `selection` of `work` (all items when `None`).
    pub fn spawn(&mut self, work: Work, selection: Option<Vec<u32>>) -> Result<()> {
        if self.tokens.contains_key(&work.id) {
            anyhow::bail!("Work '{}' is already scheduled", work.id);
        }
        let token = self.root.child_token();
        self.tokens.insert(work.id.clone(), token.clone());

        let engine = self.engine.clone();
        let work_id = work.id.clone();
        let handle = self.tasks.spawn(async move {
            let result = engine
                .produce_chapter_range(&work, selection.as_deref(), &token)
                .await;
            WorkRun {
                work_id: work.id,
                result,
            }
        });
        self.task_ids.insert(handle.id(), work_id.clone());
        info!(work = %work_id, "Work scheduled");
        Ok(())
    }

    /// Cancel one work. Returns false when it is not scheduled.
    pub fn cancel(&self, work: &WorkId) -> bool {
        match self.tokens.get(work) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next work to finish.
    pub async fn join_next(&mut self) -> Option<WorkRun> {
        let joined = self.tasks.join_next_with_id().await?;
        let run = match joined {
            Ok((id, run)) => {
                self.task_ids.remove(&id);
                run
            }
            Err(e) => {
                let work_id = self
                    .task_ids
                    .remove(&e.id())
                    .unwrap_or_else(|| WorkId::new("unknown"));
                warn!(work = %work_id, error = %e, "Work task ended abnormally");
                WorkRun {
                    result: Err(WorkflowError::TaskFailed {
                        work: work_id.to_string(),
                        message: e.to_string(),
                    }
                    .into()),
                    work_id,
                }
            }
        };
        self.tokens.remove(&run.work_id);
        Some(run)
    }

    /// Wait for every scheduled work, in completion order.
    pub async fn join_all(mut self) -> Vec<WorkRun> {
        let mut runs = Vec::with_capacity(self.tasks.len());
        while let Some(run) = self.join_next().await {
            runs.push(run);
        }
        runs
    }
}
