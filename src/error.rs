//! Error taxonomy and retry logic for the messaging core.
//!
//! Validation errors are terminal and surface immediately. Storage and
//! channel outages are transient and go through [`with_retry`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::config::RetrySettings;

/// Every failure a client-facing operation can report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Self-contact, blank ids, or a seller that does not own the listing.
    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("listing '{0}' was not found")]
    ListingNotFound(String),

    /// Caller is not a participant, or the conversation does not exist.
    /// Both cases share one variant so existence never leaks.
    #[error("forbidden")]
    Forbidden,

    #[error("message body is empty")]
    EmptyMessage,

    #[error("message body exceeds {max} characters")]
    MessageTooLong { max: usize },

    #[error("invalid cursor '{0}'")]
    InvalidCursor(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("delivery channel unavailable: {0}")]
    ChannelUnavailable(String),
}

impl ChatError {
    /// Only outages are worth retrying; everything else would fail again
    /// with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::StorageUnavailable(_) | ChatError::ChannelUnavailable(_)
        )
    }

    /// Stable machine-readable code used by the HTTP and WebSocket layers.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidParticipants(_) => "invalid_participants",
            ChatError::ListingNotFound(_) => "listing_not_found",
            ChatError::Forbidden => "forbidden",
            ChatError::EmptyMessage => "empty_message",
            ChatError::MessageTooLong { .. } => "message_too_long",
            ChatError::InvalidCursor(_) => "invalid_cursor",
            ChatError::StorageUnavailable(_) => "storage_unavailable",
            ChatError::ChannelUnavailable(_) => "channel_unavailable",
        }
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        ChatError::StorageUnavailable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        ChatError::StorageUnavailable(format!("failed to join database task: {err}"))
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Short delays for tests and local tooling.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_millis(1),
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(
            (current.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            backoff_multiplier: settings.backoff_multiplier.max(1.0),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

/// Run `operation` until it succeeds, fails terminally, or the policy's
/// attempts are used up. The last transient error is returned on exhaustion.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    label: &'static str,
    mut operation: F,
) -> ChatResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChatResult<T>>,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                if attempts >= policy.max_attempts {
                    tracing::error!(
                        operation = label,
                        attempts,
                        error = %err,
                        "giving up after transient failures"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    operation = label,
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    ?delay,
                    "transient failure, retrying"
                );

                sleep(delay).await;
                delay = policy.next_delay(delay);
            }
        }
    }
}
