use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::work::WorkId;

/// What the backend last acknowledged for one chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub work: WorkId,
    pub chapter: u32,
    pub item_id: String,
    pub version: String,
    /// SHA-256 of the submitted title and text
    pub content_hash: String,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub history_recorded: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    entries: Vec<LedgerEntry>,
}

/// Per-chapter publishing progress, persisted after every step so a rerun
/// never repeats a step that already succeeded.
pub struct PublishLedger {
    path: Option<PathBuf>,
    entries: Vec<LedgerEntry>,
}

impl PublishLedger {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Vec::new(),
        }
    }

    /// Load the ledger at `path`; a missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read publish ledger {}", path.display()))?;
            let file: LedgerFile = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse publish ledger {}", path.display()))?;
            file.entries
        } else {
            Vec::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    pub fn get(&self, work: &WorkId, chapter: u32) -> Option<&LedgerEntry> {
        self.entries
            .iter()
            .find(|e| &e.work == work && e.chapter == chapter)
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Record a submitted draft. New content resets the published flags.
    pub fn record_draft(
        &mut self,
        work: &WorkId,
        chapter: u32,
        item_id: &str,
        version: &str,
        content_hash: &str,
    ) -> Result<()> {
        let entry = LedgerEntry {
            work: work.clone(),
            chapter,
            item_id: item_id.to_string(),
            version: version.to_string(),
            content_hash: content_hash.to_string(),
            published: false,
            history_recorded: false,
            updated_at: Utc::now(),
        };
        match self
            .entries
            .iter_mut()
            .find(|e| &e.work == work && e.chapter == chapter)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self.save()
    }

    pub fn mark_published(&mut self, work: &WorkId, chapter: u32) -> Result<()> {
        self.update(work, chapter, |e| e.published = true)
    }

    pub fn mark_history_recorded(&mut self, work: &WorkId, chapter: u32) -> Result<()> {
        self.update(work, chapter, |e| e.history_recorded = true)
    }

    fn update(&mut self, work: &WorkId, chapter: u32, f: impl FnOnce(&mut LedgerEntry)) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| &e.work == work && e.chapter == chapter)
            .with_context(|| format!("No ledger entry for chapter {chapter} of '{work}'"))?;
        f(entry);
        entry.updated_at = Utc::now();
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| a.work.cmp(&b.work).then(a.chapter.cmp(&b.chapter)));
        let json = serde_json::to_string_pretty(&LedgerFile { entries })
            .context("Failed to serialize publish ledger")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Hex SHA-256 over a chapter's title and body.
pub fn content_hash(title: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
