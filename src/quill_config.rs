//! Project configuration read from `.quill/quill.toml`.
//!
//! Settings are layered: file → environment → CLI. Every section has
//! defaults, so an empty file (or no file at all) is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "the-long-night"
//!
//! [generation]
//! endpoint = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! timeout_secs = 180
//! max_attempts = 3
//!
//! [generation.models]
//! reviewer = "gpt-4o"
//!
//! [embedding]
//! provider = "local"
//! dimensions = 256
//!
//! [chapter]
//! min_chars = 2050
//! max_chars = 3000
//! length_unit = "chars"
//! max_revisions = 3
//!
//! [review]
//! pass_threshold = 7.0
//! length_gate = true
//! judged_dimensions = ["outline", "prose", "continuity"]
//!
//! [memory]
//! context_max_chars = 3000
//!
//! [audit]
//! interval = 5
//! stale_window = 10
//!
//! [publish]
//! base_url = "https://fanqienovel.com/api/author"
//! book_id = "7301234567890"
//! mode = "draft"
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::stages::text::LengthUnit;

/// Where chapters go after acceptance when running `quill publish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Save as a draft on the backend only
    #[default]
    Draft,
    /// Save the draft, then publish it
    Publish,
}

impl std::fmt::Display for PublishMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishMode::Draft => write!(f, "draft"),
            PublishMode::Publish => write!(f, "publish"),
        }
    }
}

impl std::str::FromStr for PublishMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(PublishMode::Draft),
            "publish" => Ok(PublishMode::Publish),
            _ => anyhow::bail!("Invalid publish mode '{}'. Valid values: draft, publish", s),
        }
    }
}

/// Which embedding implementation backs the memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Feature-hashing embedder computed in-process
    #[default]
    Local,
    /// The generation endpoint's `/embeddings` route
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: Option<String>,
}

/// Generation endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model used when a role has no override
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-role model overrides (producer, editor, reviewer, memory, auditor)
    #[serde(default)]
    pub models: HashMap<String, String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-call timeout; a timeout counts as one failed attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempt ceiling for each workflow transition
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts, doubled after each failure
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            models: HashMap::new(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl GenerationConfig {
    pub fn model_for(&self, role: &str) -> &str {
        self.models
            .get(role)
            .map(String::as_str)
            .unwrap_or(&self.model)
    }
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "QUILL_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            model: default_embedding_model(),
            dimensions: default_dimensions(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimensions() -> usize {
    256
}

/// Default chapter constraints, applied to outline items that omit them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default)]
    pub length_unit: LengthUnit,
    /// Retry budget: how many times a rejected draft goes back to the editor
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u32,
}

impl Default for ChapterConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            length_unit: LengthUnit::default(),
            max_revisions: default_max_revisions(),
        }
    }
}

fn default_min_chars() -> usize {
    2050
}

fn default_max_chars() -> usize {
    3000
}

fn default_max_revisions() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f32,
    /// Out-of-range length caps the aggregate below the pass threshold
    #[serde(default = "default_length_gate")]
    pub length_gate: bool,
    /// Dimensions scored by the reviewer model
    #[serde(default = "default_judged_dimensions")]
    pub judged_dimensions: Vec<String>,
    /// Phrases that read as machine-written filler
    #[serde(default = "default_style_markers")]
    pub style_markers: Vec<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            pass_threshold: default_pass_threshold(),
            length_gate: default_length_gate(),
            judged_dimensions: default_judged_dimensions(),
            style_markers: default_style_markers(),
        }
    }
}

fn default_pass_threshold() -> f32 {
    7.0
}

fn default_length_gate() -> bool {
    true
}

fn default_judged_dimensions() -> Vec<String> {
    vec![
        "outline".to_string(),
        "prose".to_string(),
        "continuity".to_string(),
    ]
}

fn default_style_markers() -> Vec<String> {
    [
        "in conclusion",
        "it is worth noting",
        "a testament to",
        "delve into",
        "不禁",
        "仿佛",
        "与此同时",
        "总而言之",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Character budget for the retrieved context block
    #[serde(default = "default_context_max_chars")]
    pub context_max_chars: usize,
    /// Unresolved plot threads included in context
    #[serde(default = "default_thread_limit")]
    pub thread_limit: usize,
    #[serde(default = "default_world_limit")]
    pub world_limit: usize,
    /// Minimum similarity for a resolution to close an open thread
    #[serde(default = "default_resolution_similarity")]
    pub resolution_similarity: f32,
    /// Trailing characters of the previous chapter handed to the producer
    #[serde(default = "default_ending_chars")]
    pub ending_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_max_chars: default_context_max_chars(),
            thread_limit: default_thread_limit(),
            world_limit: default_world_limit(),
            resolution_similarity: default_resolution_similarity(),
            ending_chars: default_ending_chars(),
        }
    }
}

fn default_context_max_chars() -> usize {
    3000
}

fn default_thread_limit() -> usize {
    10
}

fn default_world_limit() -> usize {
    5
}

fn default_resolution_similarity() -> f32 {
    0.75
}

fn default_ending_chars() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Run the consistency audit after every chapter whose number is a multiple of this
    #[serde(default = "default_audit_interval")]
    pub interval: u32,
    /// Unresolved threads older than this many chapters are flagged stale
    #[serde(default = "default_stale_window")]
    pub stale_window: u32,
    #[serde(default = "default_max_pairs_per_subject")]
    pub max_pairs_per_subject: usize,
    /// Plot events at least this similar are compared for contradictions
    #[serde(default = "default_event_similarity")]
    pub event_similarity: f32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            interval: default_audit_interval(),
            stale_window: default_stale_window(),
            max_pairs_per_subject: default_max_pairs_per_subject(),
            event_similarity: default_event_similarity(),
        }
    }
}

fn default_audit_interval() -> u32 {
    5
}

fn default_stale_window() -> u32 {
    10
}

fn default_max_pairs_per_subject() -> usize {
    6
}

fn default_event_similarity() -> f32 {
    0.6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_publish_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub book_id: Option<String>,
    /// Environment variable holding the session cookie
    #[serde(default = "default_cookie_env")]
    pub cookie_env: String,
    #[serde(default)]
    pub mode: PublishMode,
    /// `{n}` is the chapter number, `{title}` the chapter title
    #[serde(default = "default_title_template")]
    pub title_template: String,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
    #[serde(default)]
    pub paths: PublishPaths,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            base_url: default_publish_base_url(),
            book_id: None,
            cookie_env: default_cookie_env(),
            mode: PublishMode::default(),
            title_template: default_title_template(),
            title_max_chars: default_title_max_chars(),
            paths: PublishPaths::default(),
        }
    }
}

fn default_publish_base_url() -> String {
    "https://fanqienovel.com/api/author".to_string()
}

fn default_cookie_env() -> String {
    "QUILL_PUBLISH_COOKIE".to_string()
}

fn default_title_template() -> String {
    "第 {n} 章 {title}".to_string()
}

fn default_title_max_chars() -> usize {
    30
}

/// Backend routes for each publishing step, relative to `base_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishPaths {
    #[serde(default = "default_volumes_path")]
    pub volumes: String,
    #[serde(default = "default_new_draft_path")]
    pub new_draft: String,
    #[serde(default = "default_save_draft_path")]
    pub save_draft: String,
    #[serde(default = "default_publish_path")]
    pub publish: String,
    #[serde(default = "default_history_path")]
    pub history: String,
}

impl Default for PublishPaths {
    fn default() -> Self {
        Self {
            volumes: default_volumes_path(),
            new_draft: default_new_draft_path(),
            save_draft: default_save_draft_path(),
            publish: default_publish_path(),
            history: default_history_path(),
        }
    }
}

fn default_volumes_path() -> String {
    "/volume/volume_list/v1/".to_string()
}

fn default_new_draft_path() -> String {
    "/article/new_article/v0/".to_string()
}

fn default_save_draft_path() -> String {
    "/article/cover_article/v0/".to_string()
}

fn default_publish_path() -> String {
    "/publish_article/v0/".to_string()
}

fn default_history_path() -> String {
    "/article/history/v0/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write a daily rolling log under `.quill/logs`
    #[serde(default = "default_log_file")]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: default_log_file(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> bool {
    true
}

/// The complete quill.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuillToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chapter: ChapterConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Values passed on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_revisions: Option<u32>,
    pub audit_interval: Option<u32>,
    pub verbose: bool,
}

impl QuillToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse quill.toml")
    }

    /// Load `.quill/quill.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(quill_dir: &Path) -> Result<Self> {
        let config_path = quill_dir.join("quill.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize quill.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `QUILL_ENDPOINT`, `QUILL_MODEL` and `QUILL_MAX_REVISIONS`.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("QUILL_ENDPOINT") {
            self.generation.endpoint = endpoint;
        }
        if let Some(model) = lookup("QUILL_MODEL") {
            self.generation.model = model;
        }
        if let Some(value) = lookup("QUILL_MAX_REVISIONS")
            && let Ok(parsed) = value.parse()
        {
            self.chapter.max_revisions = parsed;
        }
    }

    pub fn apply_cli(&mut self, overrides: &CliOverrides) {
        if let Some(max) = overrides.max_revisions {
            self.chapter.max_revisions = max;
        }
        if let Some(interval) = overrides.audit_interval {
            self.audit.interval = interval;
        }
        if overrides.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Hard errors: values the workflow cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chapter.max_revisions < 1 {
            anyhow::bail!("chapter.max_revisions must be at least 1");
        }
        if self.audit.interval < 1 {
            anyhow::bail!("audit.interval must be at least 1");
        }
        if self.chapter.min_chars >= self.chapter.max_chars {
            anyhow::bail!(
                "chapter.min_chars ({}) must be less than chapter.max_chars ({})",
                self.chapter.min_chars,
                self.chapter.max_chars
            );
        }
        if !(0.0..=10.0).contains(&self.review.pass_threshold) {
            anyhow::bail!(
                "review.pass_threshold must be within 0-10, got {}",
                self.review.pass_threshold
            );
        }
        if self.generation.max_attempts < 1 {
            anyhow::bail!("generation.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Soft problems worth showing in `quill config validate`.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.memory.context_max_chars < 500 {
            warnings.push(format!(
                "memory.context_max_chars is {}; context will be mostly truncated",
                self.memory.context_max_chars
            ));
        }
        if self.review.judged_dimensions.is_empty() {
            warnings.push(
                "review.judged_dimensions is empty; only length and style will be scored"
                    .to_string(),
            );
        }
        if self.publish.book_id.is_none() {
            warnings.push("publish.book_id is not set; `quill publish` will fail".to_string());
        }
        if self.audit.stale_window < self.audit.interval {
            warnings.push(format!(
                "audit.stale_window ({}) is shorter than audit.interval ({})",
                self.audit.stale_window, self.audit.interval
            ));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = QuillToml::parse("").unwrap();
        assert_eq!(config.chapter.min_chars, 2050);
        assert_eq!(config.chapter.max_chars, 3000);
        assert_eq!(config.chapter.max_revisions, 3);
        assert_eq!(config.audit.interval, 5);
        assert_eq!(config.memory.context_max_chars, 3000);
        assert_eq!(config.publish.mode, PublishMode::Draft);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
[generation]
model = "base-model"
max_attempts = 5

[generation.models]
reviewer = "strong-model"

[chapter]
min_chars = 1000
max_chars = 1500
length_unit = "cjk"

[review]
pass_threshold = 8.0
judged_dimensions = ["outline"]
"#;
        let config = QuillToml::parse(content).unwrap();
        assert_eq!(config.generation.max_attempts, 5);
        assert_eq!(config.generation.model_for("reviewer"), "strong-model");
        assert_eq!(config.generation.model_for("producer"), "base-model");
        assert_eq!(config.chapter.length_unit, LengthUnit::Cjk);
        assert_eq!(config.review.pass_threshold, 8.0);
        assert_eq!(config.review.judged_dimensions, vec!["outline"]);
    }

    #[test]
    fn test_validate_rejects_inverted_length_range() {
        let mut config = QuillToml::default();
        config.chapter.min_chars = 3000;
        config.chapter.max_chars = 2000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_chars"));
    }

    #[test]
    fn test_validate_rejects_zero_interval_and_revisions() {
        let mut config = QuillToml::default();
        config.audit.interval = 0;
        assert!(config.validate().is_err());

        let mut config = QuillToml::default();
        config.chapter.max_revisions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_then_cli_layering() {
        let mut config = QuillToml::default();
        config.apply_env_from(|key| match key {
            "QUILL_MODEL" => Some("env-model".to_string()),
            "QUILL_MAX_REVISIONS" => Some("6".to_string()),
            _ => None,
        });
        assert_eq!(config.generation.model, "env-model");
        assert_eq!(config.chapter.max_revisions, 6);

        config.apply_cli(&CliOverrides {
            max_revisions: Some(2),
            audit_interval: Some(4),
            verbose: true,
        });
        assert_eq!(config.chapter.max_revisions, 2, "CLI should win over env");
        assert_eq!(config.audit.interval, 4);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_env_number_is_ignored() {
        let mut config = QuillToml::default();
        config.apply_env_from(|key| (key == "QUILL_MAX_REVISIONS").then(|| "lots".to_string()));
        assert_eq!(config.chapter.max_revisions, 3);
    }

    #[test]
    fn test_publish_mode_from_str() {
        assert_eq!("draft".parse::<PublishMode>().unwrap(), PublishMode::Draft);
        assert_eq!("PUBLISH".parse::<PublishMode>().unwrap(), PublishMode::Publish);
        assert!("pre-publish".parse::<PublishMode>().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quill.toml");
        let mut config = QuillToml::default();
        config.project.name = Some("saga".to_string());
        config.save(&path).unwrap();

        let loaded = QuillToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.project.name.as_deref(), Some("saga"));
    }

    #[test]
    fn test_warnings_for_missing_book_id() {
        let config = QuillToml::default();
        assert!(config.warnings().iter().any(|w| w.contains("book_id")));
    }
}
