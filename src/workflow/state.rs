use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::work::{ItemStatus, WorkId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub work: WorkId,
    pub chapter: u32,
    pub revision: u32,
    pub status: ItemStatus,
    pub timestamp: DateTime<Utc>,
}

/// Append-only record of every stage a chapter completes.
///
/// One line per transition: `work|chapter|revision|status|timestamp`.
/// Lines that fail to parse are skipped on read, so a torn final line
/// after a crash does not hide the rest of the history.
pub struct StateJournal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateJournal {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn record(&self, work: &WorkId, chapter: u32, revision: u32, status: ItemStatus) -> Result<()> {
        let line = format!(
            "{}|{}|{}|{}|{}\n",
            work,
            chapter,
            revision,
            status,
            Utc::now().to_rfc3339()
        );

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open state journal")?
            .write_all(line.as_bytes())
            .context("Failed to append state journal entry")?;
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read state journal")?;
        Ok(content.lines().filter_map(parse_line).collect())
    }

    pub fn entries_for(&self, work: &WorkId) -> Result<Vec<JournalEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| &e.work == work)
            .collect())
    }

    /// Most recent journaled status of one chapter.
    pub fn last_status(&self, work: &WorkId, chapter: u32) -> Result<Option<JournalEntry>> {
        Ok(self
            .entries_for(work)?
            .into_iter()
            .rfind(|e| e.chapter == chapter))
    }
}

fn parse_line(line: &str) -> Option<JournalEntry> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != 5 {
        return None;
    }
    Some(JournalEntry {
        work: WorkId::new(parts[0]),
        chapter: parts[1].parse().ok()?,
        revision: parts[2].parse().unwrap_or(0),
        status: parts[3].parse().ok()?,
        timestamp: DateTime::parse_from_rfc3339(parts[4])
            .ok()?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_and_read_back() {
        let dir = tempdir().unwrap();
        let journal = StateJournal::new(dir.path().join("state"));
        let work = WorkId::new("river");
        journal.record(&work, 1, 0, ItemStatus::Drafting).unwrap();
        journal.record(&work, 1, 0, ItemStatus::Editing).unwrap();
        journal.record(&work, 1, 1, ItemStatus::Accepted).unwrap();

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 3);
        let last = journal.last_status(&work, 1).unwrap().unwrap();
        assert_eq!(last.status, ItemStatus::Accepted);
        assert_eq!(last.revision, 1);
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = tempdir().unwrap();
        let journal = StateJournal::new(dir.path().join("state"));
        assert!(journal.entries().unwrap().is_empty());
        assert!(journal.last_status(&WorkId::new("w"), 1).unwrap().is_none());
    }

    #[test]
    fn test_filters_by_work_and_skips_torn_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        let journal = StateJournal::new(path.clone());
        journal.record(&WorkId::new("a"), 1, 0, ItemStatus::Drafting).unwrap();
        journal.record(&WorkId::new("b"), 1, 0, ItemStatus::Drafting).unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"a|2|0|edit").unwrap();

        let entries = journal.entries_for(&WorkId::new("a")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].chapter, 1);
    }
}
