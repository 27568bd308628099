use super::{RunSettings, WriteRun};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::consistency::AuditReport;
use crate::work::WorkId;
use crate::workflow::WorkflowEvent;

/// Persists write runs and consistency reports under `.quill/audit`.
///
/// Layout:
/// - `current-run.json`: the run in progress, rewritten on every change
/// - `runs/<timestamp>_<id>.json`: finished runs
/// - `reports/<work>/through-NNNN.json`: consistency audit reports
pub struct AuditLogger {
    audit_dir: PathBuf,
    current_run: Option<WriteRun>,
    current_run_file: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            current_run_file: audit_dir.join("current-run.json"),
            audit_dir: audit_dir.to_path_buf(),
            current_run: None,
        }
    }

    pub fn start_run(&mut self, work_id: WorkId, settings: RunSettings) -> Result<()> {
        self.current_run = Some(WriteRun::new(work_id, settings));
        self.save_current()
    }

    /// Fold a workflow event into the active run.
    ///
    /// Fails when no run is active, so events are never dropped silently.
    pub fn record(&mut self, event: &WorkflowEvent) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("record called with no active run"))?;
        run.apply(event);
        self.save_current()
    }

    pub fn finish_run(&mut self) -> Result<PathBuf> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;
        run.finish();

        let runs_dir = self.audit_dir.join("runs");
        fs::create_dir_all(&runs_dir).context("Failed to create runs directory")?;
        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.to_string()[..8]
        );
        let run_file = runs_dir.join(filename);

        let json = serde_json::to_string_pretty(&run).context("Failed to serialize write run")?;
        fs::write(&run_file, json).context("Failed to write run file")?;

        if self.current_run_file.exists() {
            fs::remove_file(&self.current_run_file)
                .context("Failed to remove current-run.json after finishing run")?;
        }

        self.current_run = None;
        Ok(run_file)
    }

    pub fn save_current(&self) -> Result<()> {
        if let Some(ref run) = self.current_run {
            fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;
            let json =
                serde_json::to_string_pretty(run).context("Failed to serialize current run")?;
            fs::write(&self.current_run_file, json).context("Failed to write current run file")?;
        }
        Ok(())
    }

    /// Load a run left behind by an interrupted process. Returns whether one existed.
    pub fn load_current(&mut self) -> Result<bool> {
        if !self.current_run_file.exists() {
            return Ok(false);
        }
        let content =
            fs::read_to_string(&self.current_run_file).context("Failed to read current run file")?;
        let run: WriteRun =
            serde_json::from_str(&content).context("Failed to parse current run file")?;
        self.current_run = Some(run);
        Ok(true)
    }

    fn reports_dir(&self, work: &WorkId) -> PathBuf {
        self.audit_dir.join("reports").join(work.as_str())
    }

    /// Write a consistency report. A later audit through the same chapter
    /// replaces the earlier one.
    pub fn save_report(&self, report: &AuditReport) -> Result<PathBuf> {
        let dir = self.reports_dir(&report.work_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("through-{:04}.json", report.through_chapter));
        let json = serde_json::to_string_pretty(report).context("Failed to serialize audit report")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Report files for a work, oldest first.
    pub fn list_reports(&self, work: &WorkId) -> Result<Vec<PathBuf>> {
        json_files(&self.reports_dir(work))
    }

    pub fn latest_report(&self, work: &WorkId) -> Result<Option<AuditReport>> {
        let Some(path) = self.list_reports(work)?.pop() else {
            return Ok(None);
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let report = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(report))
    }
}

/// Sorted `*.json` files in `dir`; a missing directory is empty.
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect();
    files.sort();
    Ok(files)
}
