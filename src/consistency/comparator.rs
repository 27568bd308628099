use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;
use crate::generation::{GenerationRequest, Generator, RetryPolicy, Role, retry_call};
use crate::memory::MemoryRecord;

/// Outcome of comparing two records.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    pub contradictory: bool,
    pub severity: Severity,
    pub explanation: String,
}

impl Judgement {
    pub fn consistent() -> Self {
        Self {
            contradictory: false,
            severity: Severity::Minor,
            explanation: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    #[default]
    Major,
    Critical,
}

impl Severity {
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "high" => Severity::Critical,
            "minor" | "low" => Severity::Minor,
            _ => Severity::Major,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Minor => write!(f, "minor"),
            Severity::Major => write!(f, "major"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Decides whether two records of the same work contradict each other.
///
/// The earlier record is always passed first.
#[async_trait]
pub trait Comparator: Send + Sync {
    async fn compare(
        &self,
        earlier: &MemoryRecord,
        later: &MemoryRecord,
    ) -> Result<Judgement, GenerationError>;
}

/// Asks the auditor model for a one-line verdict.
pub struct GeneratorComparator {
    generator: Arc<dyn Generator>,
    policy: RetryPolicy,
}

impl GeneratorComparator {
    pub fn new(generator: Arc<dyn Generator>, policy: RetryPolicy) -> Self {
        Self { generator, policy }
    }
}

#[async_trait]
impl Comparator for GeneratorComparator {
    async fn compare(
        &self,
        earlier: &MemoryRecord,
        later: &MemoryRecord,
    ) -> Result<Judgement, GenerationError> {
        let context = format!(
            "Chapter {}: {}\nChapter {}: {}",
            earlier.chapter,
            earlier.text(),
            later.chapter,
            later.text()
        );
        let request = GenerationRequest::new(
            Role::Auditor,
            "You check a serialized novel for continuity errors. A change that the story \
             explains (healing, travel, learning) is not a contradiction.",
            "Do these two facts contradict each other? Reply with exactly one line: \
             CONSISTENT, or CONTRADICTION|minor|major|critical|short explanation \
             (pick one severity).",
        )
        .with_context(context);

        let reply = retry_call(&self.policy, || self.generator.generate(&request)).await?;
        parse_judgement(&reply)
    }
}

/// `CONSISTENT` or `CONTRADICTION|<severity>|<explanation>`.
pub fn parse_judgement(reply: &str) -> Result<Judgement, GenerationError> {
    let line = reply
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let upper = line.to_ascii_uppercase();

    if upper.starts_with("CONSISTENT") {
        return Ok(Judgement::consistent());
    }
    if upper.starts_with("CONTRADICTION") {
        let mut parts = line.splitn(3, '|').skip(1);
        let severity = parts.next().map(Severity::parse_lenient).unwrap_or_default();
        let explanation = parts.next().unwrap_or_default().trim().to_string();
        return Ok(Judgement {
            contradictory: true,
            severity,
            explanation,
        });
    }
    Err(GenerationError::InvalidResponse(format!(
        "unrecognized comparison reply: {line}"
    )))
}
