use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::{MemoryRecord, RecordId, RecordKind, RecordPayload, Similarity};
use crate::errors::MemoryError;
use crate::generation::Embedder;
use crate::work::WorkId;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Partition {
    records: Vec<MemoryRecord>,
}

/// Search parameters beyond the basic `query`.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub kinds: Vec<RecordKind>,
    pub top_k: usize,
    pub include_superseded: bool,
    pub unresolved_only: bool,
    /// Only records from chapters strictly before this one
    pub before_chapter: Option<u32>,
    pub subject: Option<String>,
}

impl Query {
    pub fn new(text: &str, top_k: usize) -> Self {
        Self {
            text: text.to_string(),
            kinds: Vec::new(),
            top_k,
            include_superseded: false,
            unresolved_only: false,
            before_chapter: None,
            subject: None,
        }
    }

    pub fn kinds(mut self, kinds: &[RecordKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn unresolved_only(mut self) -> Self {
        self.unresolved_only = true;
        self
    }

    pub fn before_chapter(mut self, chapter: u32) -> Self {
        self.before_chapter = Some(chapter);
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_history(mut self) -> Self {
        self.include_superseded = true;
        self
    }

    fn accepts(&self, record: &MemoryRecord) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&record.kind()))
            && (self.include_superseded || record.is_current())
            && (!self.unresolved_only || record.is_unresolved_event())
            && self.before_chapter.is_none_or(|c| record.chapter < c)
            && self
                .subject
                .as_deref()
                .is_none_or(|s| record.payload.subject() == Some(s))
    }
}

#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub score: f32,
}

/// Semantic memory partitioned by work.
///
/// Each work has its own lock: reads of one work run concurrently, writes
/// to one work are serialized, and works never contend with each other.
/// A write returns only after the partition is persisted, so anything
/// written is visible to every later query.
pub struct MemoryStore {
    partitions: RwLock<HashMap<WorkId, Arc<RwLock<Partition>>>>,
    embedder: Arc<dyn Embedder>,
    similarity: Arc<dyn Similarity>,
    dir: Option<PathBuf>,
}

impl MemoryStore {
    pub fn in_memory(embedder: Arc<dyn Embedder>, similarity: Arc<dyn Similarity>) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            embedder,
            similarity,
            dir: None,
        }
    }

    /// Store that keeps one JSON file per work under `dir`.
    pub fn persistent(
        dir: PathBuf,
        embedder: Arc<dyn Embedder>,
        similarity: Arc<dyn Similarity>,
    ) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            embedder,
            similarity,
            dir: Some(dir),
        }
    }

    fn partition_file(&self, work: &WorkId) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("{}.json", work.as_str())))
    }

    async fn partition(&self, work: &WorkId) -> Result<Arc<RwLock<Partition>>, MemoryError> {
        if let Some(partition) = self.partitions.read().await.get(work) {
            return Ok(partition.clone());
        }

        let mut partitions = self.partitions.write().await;
        if let Some(partition) = partitions.get(work) {
            return Ok(partition.clone());
        }
        let loaded = match self.partition_file(work) {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path).map_err(|e| MemoryError::Load {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                serde_json::from_str(&content).map_err(|e| MemoryError::Load {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            }
            _ => Partition::default(),
        };
        let partition = Arc::new(RwLock::new(loaded));
        partitions.insert(work.clone(), partition.clone());
        Ok(partition)
    }

    fn persist(&self, work: &WorkId, partition: &Partition) -> Result<(), MemoryError> {
        let Some(path) = self.partition_file(work) else {
            return Ok(());
        };
        let io_err = |source| MemoryError::Persist {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string(partition)
            .map_err(|e| io_err(std::io::Error::other(e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(io_err)?;
        std::fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        self.embedder
            .embed(text)
            .await
            .map_err(MemoryError::Embedding)
    }

    /// Append a fully formed record.
    pub async fn write(&self, record: MemoryRecord) -> Result<RecordId, MemoryError> {
        let work = record.work_id.clone();
        let id = record.id;
        let partition = self.partition(&work).await?;
        let mut guard = partition.write().await;
        guard.records.push(record);
        self.persist(&work, &guard)?;
        debug!(work = %work, record = %id, "Memory record written");
        Ok(id)
    }

    /// Embed the payload text and append it as a new record.
    pub async fn remember(
        &self,
        work: &WorkId,
        chapter: u32,
        payload: RecordPayload,
    ) -> Result<RecordId, MemoryError> {
        let embedding = self.embed(&payload.text()).await?;
        self.write(MemoryRecord::new(work.clone(), chapter, payload, embedding))
            .await
    }

    /// Write a new version of `old`. The old record stays queryable through
    /// history; only its `superseded_by` link changes.
    pub async fn supersede(
        &self,
        work: &WorkId,
        old: RecordId,
        chapter: u32,
        payload: RecordPayload,
    ) -> Result<RecordId, MemoryError> {
        let embedding = self.embed(&payload.text()).await?;
        self.write_version(old, MemoryRecord::new(work.clone(), chapter, payload, embedding))
            .await
    }

    /// [`supersede`](Self::supersede) for a record that is already embedded.
    pub async fn write_version(
        &self,
        old: RecordId,
        mut record: MemoryRecord,
    ) -> Result<RecordId, MemoryError> {
        let work = record.work_id.clone();
        record.supersedes = Some(old);
        let new_id = record.id;

        let partition = self.partition(&work).await?;
        let mut guard = partition.write().await;
        let previous = guard
            .records
            .iter_mut()
            .find(|r| r.id == old)
            .ok_or_else(|| MemoryError::UnknownRecord {
                work: work.to_string(),
                id: old.to_string(),
            })?;
        if previous.superseded_by.is_some() {
            return Err(MemoryError::AlreadySuperseded { id: old.to_string() });
        }
        previous.superseded_by = Some(new_id);
        guard.records.push(record);
        self.persist(&work, &guard)?;
        debug!(work = %work, old = %old, new = %new_id, "Memory record superseded");
        Ok(new_id)
    }

    /// Current records of the given kinds, most similar to `text` first.
    /// An empty `kinds` slice means every kind.
    pub async fn query(
        &self,
        work: &WorkId,
        text: &str,
        kinds: &[RecordKind],
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        self.search(work, &Query::new(text, top_k).kinds(kinds))
            .await
    }

    /// Ties are broken by newer chapter, then record id, so identical
    /// queries over unchanged memory return identical order.
    pub async fn search(
        &self,
        work: &WorkId,
        query: &Query,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        if query.top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = if query.text.trim().is_empty() {
            None
        } else {
            Some(self.embed(&query.text).await?)
        };

        let partition = self.partition(work).await?;
        let guard = partition.read().await;
        let mut scored: Vec<ScoredRecord> = guard
            .records
            .iter()
            .filter(|r| query.accepts(r))
            .map(|r| ScoredRecord {
                score: query_vector
                    .as_ref()
                    .map(|q| self.similarity.score(q, &r.embedding))
                    .unwrap_or(0.0),
                record: r.clone(),
            })
            .collect();
        drop(guard);

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.record.chapter.cmp(&a.record.chapter))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        scored.truncate(query.top_k);
        Ok(scored)
    }

    /// Newest current record of `kind` for `subject`.
    pub async fn latest(
        &self,
        work: &WorkId,
        kind: RecordKind,
        subject: &str,
    ) -> Result<Option<MemoryRecord>, MemoryError> {
        let partition = self.partition(work).await?;
        let guard = partition.read().await;
        Ok(guard
            .records
            .iter()
            .filter(|r| r.kind() == kind && r.is_current() && r.payload.subject() == Some(subject))
            .max_by(|a, b| {
                a.chapter
                    .cmp(&b.chapter)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .cloned())
    }

    /// Snapshot of every record of a work, superseded versions included,
    /// in write order.
    pub async fn records(&self, work: &WorkId) -> Result<Vec<MemoryRecord>, MemoryError> {
        let partition = self.partition(work).await?;
        let guard = partition.read().await;
        Ok(guard.records.clone())
    }

    pub async fn get(&self, work: &WorkId, id: RecordId) -> Result<Option<MemoryRecord>, MemoryError> {
        let partition = self.partition(work).await?;
        let guard = partition.read().await;
        Ok(guard.records.iter().find(|r| r.id == id).cloned())
    }

    /// Every version recorded for `subject`, oldest chapter first.
    pub async fn history(
        &self,
        work: &WorkId,
        kind: RecordKind,
        subject: &str,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let mut versions: Vec<MemoryRecord> = self
            .records(work)
            .await?
            .into_iter()
            .filter(|r| r.kind() == kind && r.payload.subject() == Some(subject))
            .collect();
        versions.sort_by_key(|r| (r.chapter, r.created_at));
        Ok(versions)
    }

    /// Mark records stale. Returns how many were newly flagged.
    pub async fn flag_stale(&self, work: &WorkId, ids: &[RecordId]) -> Result<usize, MemoryError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let partition = self.partition(work).await?;
        let mut guard = partition.write().await;
        let mut flagged = 0;
        for record in guard.records.iter_mut() {
            if ids.contains(&record.id) && !record.stale {
                record.stale = true;
                flagged += 1;
            }
        }
        if flagged > 0 {
            self.persist(work, &guard)?;
        }
        Ok(flagged)
    }

    pub async fn count(&self, work: &WorkId) -> Result<usize, MemoryError> {
        let partition = self.partition(work).await?;
        let guard = partition.read().await;
        Ok(guard.records.len())
    }

    /// Highest chapter that has produced any record.
    pub async fn latest_chapter(&self, work: &WorkId) -> Result<Option<u32>, MemoryError> {
        let partition = self.partition(work).await?;
        let guard = partition.read().await;
        Ok(guard.records.iter().map(|r| r.chapter).max())
    }
}
