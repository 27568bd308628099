//! Tracing subscriber setup for the CLI.
//!
//! The console stays quiet (`warn`) unless `--verbose` is given, since
//! progress bars own stderr during a run. The daily rolling file under
//! `.quill/logs` always records at the configured level. `RUST_LOG`
//! overrides both filters.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::quill_config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn directive(level: &str) -> String {
    format!("warn,quill={level}")
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
pub fn init(config: &LoggingConfig, log_dir: Option<&Path>, verbose: bool) -> Result<Option<WorkerGuard>> {
    let console_level = if verbose { "debug" } else { "warn" };
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter(&directive(console_level)))
        .boxed();
    let mut layers: Vec<BoxedLayer> = vec![console];

    let mut guard = None;
    if config.file
        && let Some(dir) = log_dir
    {
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, "quill.log");
        let (writer, worker) = tracing_appender::non_blocking(appender);
        let file = fmt::layer().with_writer(writer).with_ansi(false);
        let file = if config.json {
            file.json().with_filter(filter(&directive(&config.level))).boxed()
        } else {
            file.with_filter(filter(&directive(&config.level))).boxed()
        };
        layers.push(file);
        guard = Some(worker);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_scopes_level_to_crate() {
        assert_eq!(directive("debug"), "warn,quill=debug");
    }
}
