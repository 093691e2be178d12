use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::store::CacheStore;
use crate::config::CacheSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{CachedToken, HotDataEntry};

/// Global append-only ledger of every token that ever reached the top of
/// an event's ranking. Writes go through compare-and-set so concurrent
/// appenders never lose each other's entries.
#[derive(Clone)]
pub struct HotDataLedger {
    store: Arc<dyn CacheStore>,
    key: String,
    ttl: Option<Duration>,
    max_attempts: u32,
}

impl HotDataLedger {
    pub fn new(store: Arc<dyn CacheStore>, settings: &CacheSettings) -> Self {
        Self {
            store,
            key: settings.hot_data_key.clone(),
            ttl: settings.hot_data_ttl(),
            max_attempts: settings.cas_max_attempts,
        }
    }

    pub async fn read(&self) -> PipelineResult<Vec<HotDataEntry>> {
        Ok(self.read_raw().await?.1)
    }

    async fn read_raw(&self) -> PipelineResult<(Option<String>, Vec<HotDataEntry>)> {
        match self.store.get(&self.key).await? {
            Some(raw) => {
                let entries = serde_json::from_str(&raw)?;
                Ok((Some(raw), entries))
            }
            None => Ok((None, Vec::new())),
        }
    }

    /// Appends, in ranked order, each of the first `n` ranked tokens not yet
    /// in the ledger. Returns the entries that were added.
    pub async fn append_top_n(
        &self,
        event_id: &str,
        ranked: &[CachedToken],
        n: usize,
    ) -> PipelineResult<Vec<HotDataEntry>> {
        for attempt in 1..=self.max_attempts {
            let (raw, mut entries) = self.read_raw().await?;
            let mut known: HashSet<String> = entries.iter().map(|e| e.unique_key()).collect();

            let now = Utc::now();
            let added: Vec<HotDataEntry> = ranked
                .iter()
                .take(n)
                .enumerate()
                .filter(|(_, token)| known.insert(token.unique_key()))
                .map(|(idx, token)| HotDataEntry {
                    token: token.clone(),
                    first_ranked_at: now,
                    first_ranked_event_id: event_id.to_string(),
                    first_rank: idx + 1,
                })
                .collect();

            if added.is_empty() {
                return Ok(added);
            }

            entries.extend(added.iter().cloned());
            let payload = serde_json::to_string(&entries)?;
            if self
                .store
                .compare_and_set(&self.key, raw.as_deref(), &payload, self.ttl)
                .await?
            {
                info!(
                    event_id,
                    added = added.len(),
                    total = entries.len(),
                    "Hot data ledger updated"
                );
                return Ok(added);
            }
            warn!(event_id, attempt, "Hot data ledger changed concurrently, retrying");
        }

        Err(PipelineError::CacheUnavailable(format!(
            "hot data ledger update lost {} compare-and-set races",
            self.max_attempts
        )))
    }

    /// Explicit removal; the only way the ledger shrinks.
    pub async fn remove(&self, unique_key: &str) -> PipelineResult<bool> {
        let wanted = unique_key.to_lowercase();
        for attempt in 1..=self.max_attempts {
            let (raw, mut entries) = self.read_raw().await?;
            let before = entries.len();
            entries.retain(|e| e.unique_key() != wanted);
            if entries.len() == before {
                return Ok(false);
            }

            let payload = serde_json::to_string(&entries)?;
            if self
                .store
                .compare_and_set(&self.key, raw.as_deref(), &payload, self.ttl)
                .await?
            {
                info!(unique_key = %wanted, "Removed token from hot data ledger");
                return Ok(true);
            }
            warn!(attempt, "Hot data ledger changed concurrently, retrying removal");
        }

        Err(PipelineError::CacheUnavailable(format!(
            "hot data ledger removal lost {} compare-and-set races",
            self.max_attempts
        )))
    }
}
