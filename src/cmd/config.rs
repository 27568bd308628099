//! Configuration view and validation: `quill config`.

use anyhow::Result;
use std::path::Path;

use quill::config::Config;
use quill::quill_config::QuillToml;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(project_dir: &Path, cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let layout = Config::with_settings(project_dir.to_path_buf(), QuillToml::default(), cli.verbose);
    let config_path = layout.config_file;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Quill Configuration");
            println!("===================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No quill.toml found at {}; showing defaults.", config_path.display());
            }
            println!();

            // Effective values, after environment and CLI overrides
            let config = Config::new(project_dir.to_path_buf(), &cli.overrides())?;
            let rendered = toml::to_string_pretty(&config.settings)?;
            println!("{}", rendered.trim_end());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let settings = if config_path.exists() {
                QuillToml::load(&config_path)?
            } else {
                println!("No quill.toml found. Using defaults.");
                QuillToml::default()
            };
            settings.validate()?;

            let warnings = settings.warnings();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration is valid, with warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("quill.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            QuillToml::default().save(&config_path)?;

            println!("Created quill.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [generation] endpoint, model, per-role models, attempt ceiling");
            println!("  - [chapter] length range and revision budget");
            println!("  - [publish] book_id and backend mode");
            println!();
        }
    }

    Ok(())
}
