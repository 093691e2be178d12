use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::store::CacheStore;
use crate::config::CacheSettings;
use crate::error::PipelineResult;
use crate::types::CachedToken;

/// Per-event ordered token list (the event's token cache snapshot).
#[derive(Clone)]
pub struct TokenSnapshotStore {
    store: Arc<dyn CacheStore>,
    key_prefix: String,
    default_ttl: Duration,
}

impl TokenSnapshotStore {
    pub fn new(store: Arc<dyn CacheStore>, settings: &CacheSettings) -> Self {
        Self {
            store,
            key_prefix: settings.snapshot_key_prefix.clone(),
            default_ttl: settings.snapshot_ttl(),
        }
    }

    pub fn key(&self, event_id: &str) -> String {
        format!("{}{}", self.key_prefix, event_id)
    }

    /// A missing or expired snapshot reads as an empty list.
    pub async fn load(&self, event_id: &str) -> PipelineResult<Vec<CachedToken>> {
        match self.store.get(&self.key(event_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Writes the list, keeping the remaining TTL of an existing snapshot and
    /// starting the default window for a new one.
    pub async fn persist(&self, event_id: &str, tokens: &[CachedToken]) -> PipelineResult<()> {
        let payload = serde_json::to_string(tokens)?;
        self.store
            .set_preserving_ttl(&self.key(event_id), &payload, Some(self.default_ttl))
            .await?;
        debug!(event_id, count = tokens.len(), "Persisted token snapshot");
        Ok(())
    }

    pub async fn remaining_ttl(&self, event_id: &str) -> PipelineResult<Option<Duration>> {
        self.store.ttl(&self.key(event_id)).await
    }
}
