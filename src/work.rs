//! Works, their chapter items, and the file-backed canonical store.
//!
//! This module provides:
//! - `Work` / `WorkItem` / `ItemStatus`: the outline and per-chapter status
//! - `OutlineFile`: the TOML format accepted by `quill create-work`
//! - `ChapterArchive`: what the workflow needs from canonical storage
//! - `WorkStore`: the `.quill/works/<id>/` implementation of it

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::quill_config::ChapterConfig;

/// Identifier of a work. Also the name of its storage directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(String);

impl WorkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an id from a title: lowercase ascii alphanumerics joined by '-'.
    /// Titles without any ascii letters fall back to a short random id.
    pub fn from_title(title: &str) -> Self {
        let slug = title
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        if slug.is_empty() {
            let short = uuid::Uuid::new_v4().to_string();
            Self(format!("work-{}", &short[..8]))
        } else {
            Self(slug)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one chapter item. Only the workflow engine moves items
/// between states; items are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Drafting,
    Editing,
    Reviewing,
    Accepted,
    Failed,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Drafting => "drafting",
            ItemStatus::Editing => "editing",
            ItemStatus::Reviewing => "reviewing",
            ItemStatus::Accepted => "accepted",
            ItemStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "drafting" => Ok(ItemStatus::Drafting),
            "editing" => Ok(ItemStatus::Editing),
            "reviewing" => Ok(ItemStatus::Reviewing),
            "accepted" => Ok(ItemStatus::Accepted),
            "failed" => Ok(ItemStatus::Failed),
            _ => anyhow::bail!("Unknown item status '{}'", s),
        }
    }
}

/// Inclusive target length for a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LengthRange {
    pub min: usize,
    pub max: usize,
}

impl LengthRange {
    pub fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, length: usize) -> bool {
        (self.min..=self.max).contains(&length)
    }
}

impl std::fmt::Display for LengthRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// One chapter to be written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    /// Unique, increasing within the work (1-based)
    pub sequence: u32,
    #[serde(default)]
    pub title: Option<String>,
    pub outline: String,
    pub length: LengthRange,
    /// Characters expected to appear in this chapter
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub tone: Option<String>,
    /// How the chapter should end (cliffhanger, reveal, quiet...)
    #[serde(default)]
    pub hook: Option<String>,
    #[serde(default)]
    pub status: ItemStatus,
    /// Revisions used by the last run
    #[serde(default)]
    pub revisions: u32,
    /// Failed attempts consumed by the last run
    #[serde(default)]
    pub attempts: u32,
}

impl WorkItem {
    pub fn new(sequence: u32, outline: &str, length: LengthRange) -> Self {
        Self {
            sequence,
            title: None,
            outline: outline.to_string(),
            length,
            characters: Vec::new(),
            tone: None,
            hook: None,
            status: ItemStatus::Pending,
            revisions: 0,
            attempts: 0,
        }
    }

    pub fn with_characters(mut self, characters: &[&str]) -> Self {
        self.characters = characters.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn display_title(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| format!("Chapter {}", self.sequence))
    }
}

/// A work and its full outline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    pub title: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub synopsis: String,
    /// House style handed to the producer and editor
    #[serde(default)]
    pub style_guide: String,
    pub created_at: DateTime<Utc>,
    pub items: Vec<WorkItem>,
}

impl Work {
    pub fn item(&self, sequence: u32) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.sequence == sequence)
    }

    pub fn item_mut(&mut self, sequence: u32) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|i| i.sequence == sequence)
    }

    /// Items sorted by sequence, filtered to `selection` when given.
    pub fn select(&self, selection: Option<&[u32]>) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self
            .items
            .iter()
            .filter(|i| selection.is_none_or(|s| s.contains(&i.sequence)))
            .cloned()
            .collect();
        items.sort_by_key(|i| i.sequence);
        items
    }

    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            anyhow::bail!("Work '{}' has no chapters", self.id);
        }
        let mut previous = 0;
        for item in &self.items {
            if item.sequence <= previous {
                anyhow::bail!(
                    "Chapter numbers must be unique and increasing (found {} after {})",
                    item.sequence,
                    previous
                );
            }
            if item.length.min >= item.length.max {
                anyhow::bail!(
                    "Chapter {} has an empty length range {}",
                    item.sequence,
                    item.length
                );
            }
            if item.outline.trim().is_empty() {
                anyhow::bail!("Chapter {} has an empty outline", item.sequence);
            }
            previous = item.sequence;
        }
        Ok(())
    }

    /// Count of items per status, in lifecycle order.
    pub fn status_counts(&self) -> Vec<(ItemStatus, usize)> {
        [
            ItemStatus::Pending,
            ItemStatus::Drafting,
            ItemStatus::Editing,
            ItemStatus::Reviewing,
            ItemStatus::Accepted,
            ItemStatus::Failed,
        ]
        .into_iter()
        .map(|s| (s, self.items.iter().filter(|i| i.status == s).count()))
        .filter(|(_, n)| *n > 0)
        .collect()
    }
}

/// TOML outline accepted by `quill create-work`.
#[derive(Debug, Clone, Deserialize)]
pub struct OutlineFile {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub style_guide: String,
    pub chapters: Vec<OutlineChapter>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutlineChapter {
    pub sequence: u32,
    #[serde(default)]
    pub title: Option<String>,
    pub outline: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub min_chars: Option<usize>,
    #[serde(default)]
    pub max_chars: Option<usize>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub hook: Option<String>,
}

impl OutlineFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read outline: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse outline: {}", path.display()))
    }

    /// Build a work, filling missing lengths from chapter defaults.
    pub fn into_work(self, defaults: &ChapterConfig) -> Result<Work> {
        let id = match self.id {
            Some(id) => WorkId::new(id),
            None => WorkId::from_title(&self.title),
        };
        let mut items: Vec<WorkItem> = self
            .chapters
            .into_iter()
            .map(|c| WorkItem {
                sequence: c.sequence,
                title: c.title,
                outline: c.outline,
                length: LengthRange::new(
                    c.min_chars.unwrap_or(defaults.min_chars),
                    c.max_chars.unwrap_or(defaults.max_chars),
                ),
                characters: c.characters,
                tone: c.tone,
                hook: c.hook,
                status: ItemStatus::Pending,
                revisions: 0,
                attempts: 0,
            })
            .collect();
        items.sort_by_key(|i| i.sequence);

        let work = Work {
            id,
            title: self.title,
            genre: self.genre,
            synopsis: self.synopsis,
            style_guide: self.style_guide,
            created_at: Utc::now(),
            items,
        };
        work.validate()?;
        Ok(work)
    }
}

/// An accepted chapter as stored canonically.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedChapter {
    pub sequence: u32,
    pub title: String,
    pub text: String,
}

/// Canonical storage as seen by the workflow: it reads prior chapter text
/// and records accepted text and item status.
pub trait ChapterArchive: Send + Sync {
    fn chapter(&self, work: &WorkId, sequence: u32) -> Result<Option<AcceptedChapter>>;

    fn save_accepted(&self, work: &WorkId, chapter: &AcceptedChapter) -> Result<()>;

    fn set_status(
        &self,
        work: &WorkId,
        sequence: u32,
        status: ItemStatus,
        revisions: u32,
        attempts: u32,
    ) -> Result<()>;
}

/// File-backed store rooted at `.quill/works`.
pub struct WorkStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl WorkStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    fn work_dir(&self, id: &WorkId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn work_file(&self, id: &WorkId) -> PathBuf {
        self.work_dir(id).join("work.json")
    }

    fn chapter_file(&self, id: &WorkId, sequence: u32) -> PathBuf {
        self.work_dir(id)
            .join("chapters")
            .join(format!("{sequence:04}.md"))
    }

    pub fn exists(&self, id: &WorkId) -> bool {
        self.work_file(id).exists()
    }

    pub fn create(&self, work: &Work) -> Result<()> {
        if self.exists(&work.id) {
            anyhow::bail!("Work '{}' already exists", work.id);
        }
        work.validate()?;
        std::fs::create_dir_all(self.work_dir(&work.id).join("chapters"))
            .context("Failed to create work directory")?;
        self.save(work)
    }

    pub fn load(&self, id: &WorkId) -> Result<Work> {
        let path = self.work_file(id);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Work '{}' not found at {}", id, path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self, work: &Work) -> Result<()> {
        let path = self.work_file(&work.id);
        let content = serde_json::to_string_pretty(work).context("Failed to serialize work")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Work>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut works = Vec::new();
        for entry in std::fs::read_dir(&self.root).context("Failed to read works directory")? {
            let entry = entry?;
            if entry.path().join("work.json").exists() {
                works.push(self.load(&WorkId::new(entry.file_name().to_string_lossy()))?);
            }
        }
        works.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(works)
    }
}

impl ChapterArchive for WorkStore {
    fn chapter(&self, work: &WorkId, sequence: u32) -> Result<Option<AcceptedChapter>> {
        let path = self.chapter_file(work, sequence);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let (title, text) = match content.split_once("\n\n") {
            Some((heading, body)) if heading.starts_with("# ") => {
                (heading.trim_start_matches("# ").to_string(), body.to_string())
            }
            _ => (format!("Chapter {sequence}"), content),
        };
        Ok(Some(AcceptedChapter {
            sequence,
            title,
            text,
        }))
    }

    fn save_accepted(&self, work: &WorkId, chapter: &AcceptedChapter) -> Result<()> {
        let path = self.chapter_file(work, chapter.sequence);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, format!("# {}\n\n{}", chapter.title, chapter.text))
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn set_status(
        &self,
        work: &WorkId,
        sequence: u32,
        status: ItemStatus,
        revisions: u32,
        attempts: u32,
    ) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("Work store lock poisoned"))?;
        let mut loaded = self.load(work)?;
        let item = loaded
            .item_mut(sequence)
            .with_context(|| format!("Chapter {sequence} not found in work '{work}'"))?;
        item.status = status;
        item.revisions = revisions;
        item.attempts = attempts;
        self.save(&loaded)
    }
}
