//! CLI command implementations.
//!
//! | Module     | Commands handled          |
//! |------------|---------------------------|
//! | `project`  | `Init`, `CreateWork`      |
//! | `write`    | `Write`                   |
//! | `status`   | `Status`                  |
//! | `audit`    | `Audit`                   |
//! | `publish`  | `Publish`                 |
//! | `config`   | `Config`                  |
//! | `services` | wiring shared by the above |

pub mod audit;
pub mod config;
pub mod project;
pub mod publish;
pub mod services;
pub mod status;
pub mod write;

use anyhow::Result;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use project::{cmd_create_work, cmd_init};
pub use publish::cmd_publish;
pub use status::cmd_status;
pub use write::cmd_write;

use quill::work::Work;

/// Which chapters a command applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    All,
    Range { from: Option<u32>, to: Option<u32> },
    List(Vec<u32>),
}

impl Selection {
    pub fn from_args(from: Option<u32>, to: Option<u32>, chapters: Option<Vec<u32>>) -> Result<Self> {
        if let Some(mut chapters) = chapters {
            chapters.sort_unstable();
            chapters.dedup();
            return Ok(Selection::List(chapters));
        }
        match (from, to) {
            (None, None) => Ok(Selection::All),
            (Some(from), Some(to)) if from > to => {
                anyhow::bail!("--from ({}) must not be greater than --to ({})", from, to)
            }
            (from, to) => Ok(Selection::Range { from, to }),
        }
    }

    /// Chapter numbers to pass to the workflow; `None` means every chapter.
    ///
    /// Open range ends are filled from the work's outline. Explicit lists
    /// are passed through unchanged so unknown chapters are reported.
    pub fn resolve(&self, work: &Work) -> Option<Vec<u32>> {
        match self {
            Selection::All => None,
            Selection::List(chapters) => Some(chapters.clone()),
            Selection::Range { from, to } => Some(
                work.items
                    .iter()
                    .map(|i| i.sequence)
                    .filter(|s| from.is_none_or(|f| *s >= f) && to.is_none_or(|t| *s <= t))
                    .collect(),
            ),
        }
    }
}
