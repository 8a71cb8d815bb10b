//! Port trait for the upstream supported-token feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageResult;
use crate::models::TokenSpec;

/// A point-in-time view of the supported-token configuration.
#[derive(Debug, Clone)]
pub struct TokenFeedSnapshot {
    /// Currently enabled tokens across all chains.
    pub tokens: Vec<TokenSpec>,
    /// Most recent modification timestamp across the feed, used for change
    /// detection. `None` when the feed is empty.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Port trait for the supported-token configuration feed.
///
/// Polled periodically by the token feed watcher; a change in
/// `last_modified` triggers re-registration of live subscriptions.
#[async_trait]
pub trait TokenConfigSource: Send + Sync {
    /// Fetch the current snapshot of enabled tokens.
    async fn fetch(&self) -> StorageResult<TokenFeedSnapshot>;
}
