//! Outbound message sender contract.
//!
//! The engine depends only on this tri-state result, not on any specific
//! transport; `topicbot-telegram` provides the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use topicbot_types::{Payload, Target};

/// Classified send failure.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// Worth retrying: timeout, transient network error, upstream 5xx.
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Not worth retrying: destination gone, payload rejected.
    #[error("permanent send failure: {0}")]
    Permanent(String),
    /// Rate limited with an explicit hint; the hint is honored verbatim as
    /// the next retry delay, bypassing exponential backoff.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

/// Capability to deliver one message to one target.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, target: &Target, payload: &Payload) -> Result<(), SendError>;
}
