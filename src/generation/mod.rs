//! Text generation and embedding collaborators.
//!
//! Stages never talk to a model directly; they go through [`Generator`] and
//! [`Embedder`] so tests can script responses and the backend stays swappable.

pub mod hashing;
pub mod http;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;

pub use hashing::HashingEmbedder;
pub use http::HttpGenerator;

/// Which part of the pipeline is asking. Backends may pick a model per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Producer,
    Editor,
    Reviewer,
    Memory,
    Auditor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Editor => "editor",
            Role::Reviewer => "reviewer",
            Role::Memory => "memory",
            Role::Auditor => "auditor",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One generation call: a system prompt, retrieved context, and the task.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub role: Role,
    pub system: String,
    pub context: String,
    pub instruction: String,
}

impl GenerationRequest {
    pub fn new(role: Role, system: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            role,
            system: system.into(),
            context: String::new(),
            instruction: instruction.into(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// The user-turn text: context block (if any) followed by the instruction.
    pub fn user_message(&self) -> String {
        if self.context.trim().is_empty() {
            self.instruction.clone()
        } else {
            format!("{}\n\n---\n\n{}", self.context.trim(), self.instruction)
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError>;
}

/// Run `call`, turning an elapsed deadline into [`GenerationError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GenerationError>
where
    F: Future<Output = Result<T, GenerationError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GenerationError::Timeout { after: limit }),
    }
}

/// Attempt ceiling and delay schedule shared by every retried transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, timeout: Duration, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout,
            base_delay,
        }
    }

    /// Delay before attempt `attempt + 1`, doubling per failure and capped at one minute.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(6);
        (self.base_delay * factor).min(Duration::from_secs(60))
    }

    pub fn exhausted(&self, failed_attempts: u32) -> bool {
        failed_attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(180), Duration::from_secs(2))
    }
}

/// Run a generation call under the policy's timeout, retrying retryable
/// failures until the ceiling. Used where a failure has no workflow state to
/// fall back to, such as audit comparisons.
pub async fn retry_call<T, F, Fut>(policy: &RetryPolicy, mut call: F) -> Result<T, GenerationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    let mut failed = 0;
    loop {
        match with_timeout(policy.timeout, call()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                failed += 1;
                if !err.is_retryable() || policy.exhausted(failed) {
                    return Err(err);
                }
                tracing::warn!(attempt = failed, error = %err, "Generation failed, retrying");
                tokio::time::sleep(policy.delay_after(failed)).await;
            }
        }
    }
}

/// Strip a surrounding ```json fence, which models add around JSON answers.
pub fn strip_code_fence(output: &str) -> &str {
    let trimmed = output.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(5), Duration::ZERO)
    }

    #[test]
    fn test_user_message_includes_context() {
        let request = GenerationRequest::new(Role::Producer, "sys", "Write chapter 3.")
            .with_context("Anna is injured.");
        assert_eq!(
            request.user_message(),
            "Anna is injured.\n\n---\n\nWrite chapter 3."
        );

        let bare = GenerationRequest::new(Role::Producer, "sys", "Write chapter 1.");
        assert_eq!(bare.user_message(), "Write chapter 1.");
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(policy.delay_after(20), Duration::from_secs(60));
    }

    #[test]
    fn test_policy_never_below_one_attempt() {
        assert_eq!(fast_policy(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(GenerationError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_retry_call_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_call(&fast_policy(3), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(GenerationError::RateLimited)
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_call_stops_at_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_call(&fast_policy(3), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GenerationError::Transport("reset".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_call_does_not_retry_fatal_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_call(&fast_policy(3), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(GenerationError::InvalidResponse("not json".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[]\n```"), "[]");
    }
}
