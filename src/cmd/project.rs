//! Project initialization and work creation.

use anyhow::Result;
use std::path::Path;

use quill::config::Config;
use quill::quill_config::{CliOverrides, QuillToml};
use quill::work::{OutlineFile, WorkStore};

use super::super::Cli;
use super::services::open_project;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), &CliOverrides::default())?;
    let was_initialized = config.is_initialized();
    config.ensure_directories()?;

    if !config.config_file.exists() {
        QuillToml::default().save(&config.config_file)?;
    }

    if was_initialized {
        println!(
            "Quill project already initialized at {}",
            config.quill_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!("Initialized quill project at {}", config.quill_dir.display());
    println!();
    println!("Created directory structure:");
    println!("  .quill/");
    println!("  ├── quill.toml    # Configuration (use `quill config show`)");
    println!("  ├── works/        # Outlines and accepted chapters");
    println!("  ├── memory/       # Per-work memory records");
    println!("  ├── audit/        # Run logs and consistency reports");
    println!("  └── logs/         # Diagnostic logs");
    println!();
    println!("Next steps:");
    println!("  1. Set QUILL_API_KEY (or add it to .env)");
    println!("  2. Run `quill create-work --outline outline.toml`");
    println!("  3. Run `quill write --work <id>` to start producing chapters");
    Ok(())
}

pub fn cmd_create_work(project_dir: &Path, cli: &Cli, outline: &Path) -> Result<()> {
    let project = open_project(project_dir, cli)?;
    let config = &project.config;

    let work = OutlineFile::load(outline)?.into_work(&config.settings.chapter)?;
    let store = WorkStore::new(config.works_dir.clone());
    store.create(&work)?;

    println!(
        "Created work '{}' ({}) with {} chapters",
        work.title,
        console::style(&work.id).cyan(),
        work.items.len()
    );
    println!();
    println!("Run `quill write --work {}` to start producing chapters.", work.id);
    Ok(())
}
