use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use quill::quill_config::{CliOverrides, PublishMode};

mod cmd;

#[derive(Parser)]
#[command(name = "quill")]
#[command(version, about = "Serialized chapter production with memory, review and continuity audits")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Answer yes to every confirmation prompt
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Re-edits allowed after a failed review. Overrides quill.toml.
    #[arg(long, global = true)]
    pub max_revisions: Option<u32>,

    /// Audit after every N-th chapter. Overrides quill.toml.
    #[arg(long, global = true)]
    pub audit_interval: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            max_revisions: self.max_revisions,
            audit_interval: self.audit_interval,
            verbose: self.verbose,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a quill project in the current directory
    Init,
    /// Create a work from a TOML outline
    CreateWork {
        #[arg(short, long)]
        outline: PathBuf,
    },
    /// Produce chapters of a work
    Write {
        #[arg(short, long)]
        work: String,

        /// First chapter to produce
        #[arg(long, conflicts_with = "chapters")]
        from: Option<u32>,

        /// Last chapter to produce
        #[arg(long, conflicts_with = "chapters")]
        to: Option<u32>,

        /// Explicit chapters (comma-separated)
        #[arg(long, value_delimiter = ',')]
        chapters: Option<Vec<u32>>,
    },
    /// Show works and chapter status
    Status {
        #[arg(short, long)]
        work: Option<String>,
    },
    /// Show the latest consistency report, or run a new audit
    Audit {
        #[arg(short, long)]
        work: String,

        /// Run an audit now instead of showing the last report
        #[arg(long)]
        run: bool,
    },
    /// Send accepted chapters to the publishing backend
    Publish {
        #[arg(short, long)]
        work: String,

        #[arg(long)]
        from: Option<u32>,

        #[arg(long)]
        to: Option<u32>,

        /// draft or publish (defaults to publish.mode in quill.toml)
        #[arg(long)]
        mode: Option<PublishMode>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default quill.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::CreateWork { outline } => cmd::cmd_create_work(&project_dir, &cli, outline)?,
        Commands::Write {
            work,
            from,
            to,
            chapters,
        } => {
            let selection = cmd::Selection::from_args(*from, *to, chapters.clone())?;
            cmd::cmd_write(&project_dir, &cli, work, selection).await?;
        }
        Commands::Status { work } => cmd::cmd_status(&project_dir, &cli, work.as_deref())?,
        Commands::Audit { work, run } => cmd::cmd_audit(&project_dir, &cli, work, *run).await?,
        Commands::Publish {
            work,
            from,
            to,
            mode,
        } => {
            let selection = cmd::Selection::from_args(*from, *to, None)?;
            cmd::cmd_publish(&project_dir, &cli, work, selection, *mode).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, &cli, command.clone())?,
    }

    Ok(())
}
