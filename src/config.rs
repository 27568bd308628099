use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::quill_config::{CliOverrides, QuillToml};

/// Runtime configuration for a quill project.
///
/// Resolves the `.quill/` layout for a project directory and carries the
/// fully layered [`QuillToml`] (file → environment → CLI).
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub quill_dir: PathBuf,
    pub config_file: PathBuf,
    pub works_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub log_dir: PathBuf,
    pub state_file: PathBuf,
    pub publish_ledger: PathBuf,
    pub verbose: bool,
    pub settings: QuillToml,
}

impl Config {
    pub fn new(project_dir: PathBuf, overrides: &CliOverrides) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        load_dotenv(&project_dir);

        let quill_dir = project_dir.join(".quill");
        let mut settings = QuillToml::load_or_default(&quill_dir)?;
        settings.apply_env();
        settings.apply_cli(overrides);
        settings.validate().context("Invalid configuration")?;

        Ok(Self::with_settings(project_dir, settings, overrides.verbose))
    }

    /// Build the layout without touching the environment or the config file.
    pub fn with_settings(project_dir: PathBuf, settings: QuillToml, verbose: bool) -> Self {
        let quill_dir = project_dir.join(".quill");
        Self {
            config_file: quill_dir.join("quill.toml"),
            works_dir: quill_dir.join("works"),
            memory_dir: quill_dir.join("memory"),
            audit_dir: quill_dir.join("audit"),
            log_dir: quill_dir.join("logs"),
            state_file: quill_dir.join("state"),
            publish_ledger: quill_dir.join("publish-ledger.json"),
            quill_dir,
            project_dir,
            verbose,
            settings,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.quill_dir,
            &self.works_dir,
            &self.memory_dir,
            &self.audit_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.quill_dir.exists()
    }
}

/// Load `.env` from the project, then from the user config directory.
/// Variables already set in the process environment are never overwritten.
fn load_dotenv(project_dir: &Path) {
    let _ = dotenvy::from_path(project_dir.join(".env"));
    if let Some(config_dir) = dirs::config_dir() {
        let _ = dotenvy::from_path(config_dir.join("quill").join(".env"));
    }
}
