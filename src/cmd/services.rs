//! Project loading and the wiring between stores, stages and the engine.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quill::config::Config;
use quill::consistency::{ConsistencyAuditor, GeneratorComparator};
use quill::generation::{Embedder, Generator, HashingEmbedder, HttpGenerator};
use quill::memory::{ContextRetriever, Cosine, MemoryStore, Similarity};
use quill::quill_config::EmbeddingProvider;
use quill::stages::{EditorStage, MemoryUpdateStage, ProducerStage, ReviewStage, Stages};
use quill::work::WorkStore;
use quill::workflow::{EngineOptions, EventSink, StateJournal, WorkflowEngine};
use tracing_appender::non_blocking::WorkerGuard;

use super::super::Cli;

/// An initialized project with logging installed.
pub struct Project {
    pub config: Config,
    _log_guard: Option<WorkerGuard>,
}

/// Load configuration for `project_dir`, failing if `quill init` has not run.
pub fn open_project(project_dir: &Path, cli: &Cli) -> Result<Project> {
    let config = Config::new(project_dir.to_path_buf(), &cli.overrides())?;
    if !config.is_initialized() {
        anyhow::bail!("Project not initialized. Run 'quill init' first.");
    }
    let log_guard =
        quill::logging::init(&config.settings.logging, Some(&config.log_dir), cli.verbose)?;
    Ok(Project {
        config,
        _log_guard: log_guard,
    })
}

/// Long-lived collaborators shared by every command that touches a work.
pub struct Services {
    pub works: Arc<WorkStore>,
    pub memory: Arc<MemoryStore>,
    pub auditor: Arc<ConsistencyAuditor>,
    pub journal: Arc<StateJournal>,
    generator: Arc<HttpGenerator>,
    config: Config,
}

impl Services {
    pub fn open(config: &Config) -> Self {
        let settings = &config.settings;
        let generator = Arc::new(HttpGenerator::new(&settings.generation, &settings.embedding));
        let embedder: Arc<dyn Embedder> = match settings.embedding.provider {
            EmbeddingProvider::Local => Arc::new(HashingEmbedder::new(settings.embedding.dimensions)),
            EmbeddingProvider::Http => generator.clone(),
        };
        let similarity: Arc<dyn Similarity> = Arc::new(Cosine);
        let memory = Arc::new(MemoryStore::persistent(
            config.memory_dir.clone(),
            embedder,
            similarity.clone(),
        ));

        let options = EngineOptions::from_settings(settings);
        let comparator = Arc::new(GeneratorComparator::new(generator.clone(), options.retry));
        let auditor = Arc::new(ConsistencyAuditor::new(
            memory.clone(),
            comparator,
            similarity,
            settings.audit.clone(),
        ));

        Self {
            works: Arc::new(WorkStore::new(config.works_dir.clone())),
            journal: Arc::new(StateJournal::new(config.state_file.clone())),
            memory,
            auditor,
            generator,
            config: config.clone(),
        }
    }

    pub fn engine(&self, events: EventSink) -> WorkflowEngine {
        let settings = &self.config.settings;
        let generator: Arc<dyn Generator> = self.generator.clone();
        let timeout = Duration::from_secs(settings.generation.timeout_secs);
        let unit = settings.chapter.length_unit;

        let retriever = Arc::new(ContextRetriever::new(
            self.memory.clone(),
            settings.memory.clone(),
        ));
        let stages = Stages::new(
            ProducerStage::new(generator.clone(), retriever, timeout, unit),
            EditorStage::new(generator.clone(), timeout, unit),
            ReviewStage::new(Some(generator.clone()), settings.review.clone(), unit, timeout),
            MemoryUpdateStage::new(
                generator,
                self.memory.clone(),
                timeout,
                settings.memory.resolution_similarity,
            ),
        );

        WorkflowEngine::new(
            stages,
            self.works.clone(),
            self.auditor.clone(),
            EngineOptions::from_settings(settings),
        )
        .with_journal(self.journal.clone())
        .with_events(events)
    }
}
