use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use super::RankingAuthority;
use crate::config::RankingSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::retry::with_retry;
use crate::types::CachedToken;

const SERVICE: &str = "ranking";

#[derive(Debug, Serialize)]
struct SortRequest<'a> {
    intelligence_id: &'a str,
    token_list: &'a [CachedToken],
}

#[derive(Debug, Deserialize)]
struct SortResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Vec<RankedItem>,
}

/// Only the identity fields of a returned item matter; the local record is
/// authoritative for everything else.
#[derive(Debug, Deserialize)]
struct RankedItem {
    #[serde(default)]
    name: String,
    #[serde(default)]
    contract_address: String,
    #[serde(default)]
    chain: RankedChain,
}

#[derive(Debug, Default, Deserialize)]
struct RankedChain {
    #[serde(default)]
    slug: String,
}

/// Client for the admin sort endpoint.
pub struct AdminRankingClient {
    http: Client,
    settings: RankingSettings,
}

impl AdminRankingClient {
    pub fn new(settings: RankingSettings) -> PipelineResult<Self> {
        let http = Client::builder()
            .timeout(settings.retry.request_timeout())
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { http, settings })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/v1/sort/", self.settings.base_url.trim_end_matches('/'))
    }

    async fn sort_once(&self, event_id: &str, candidates: &[CachedToken]) -> PipelineResult<Vec<RankedItem>> {
        let request = SortRequest {
            intelligence_id: event_id,
            token_list: candidates,
        };
        let response = self
            .http
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::from_http(SERVICE, e))?
            .error_for_status()
            .map_err(|e| PipelineError::from_http(SERVICE, e))?;

        let body: SortResponse = response.json().await.map_err(|e| PipelineError::Upstream {
            service: SERVICE,
            message: format!("undecodable response: {}", e),
        })?;
        if body.code != 0 {
            return Err(PipelineError::Upstream {
                service: SERVICE,
                message: format!("code {}: {}", body.code, body.message),
            });
        }
        Ok(body.data)
    }
}

/// Maps the authority's order back onto the local candidates. Unknown items
/// are dropped, duplicates ignored, omitted candidates appended in input
/// order.
fn reconcile(event_id: &str, candidates: &[CachedToken], items: Vec<RankedItem>) -> Vec<CachedToken> {
    let by_key: HashMap<String, &CachedToken> = candidates.iter().map(|t| (t.unique_key(), t)).collect();
    let mut placed = HashSet::new();
    let mut ranked = Vec::with_capacity(candidates.len());

    for item in items {
        let key = crate::types::unique_key(&item.name, &item.contract_address, &item.chain.slug);
        match by_key.get(&key) {
            Some(token) if placed.insert(key.clone()) => ranked.push((*token).clone()),
            Some(_) => {}
            None => warn!(event_id, unique_key = %key, "Ranking returned an unknown token, ignoring"),
        }
    }

    for token in candidates {
        if placed.insert(token.unique_key()) {
            debug!(event_id, name = %token.name, "Ranking omitted candidate, appending");
            ranked.push(token.clone());
        }
    }
    ranked
}

#[async_trait]
impl RankingAuthority for AdminRankingClient {
    async fn rank(&self, event_id: &str, candidates: &[CachedToken]) -> PipelineResult<Vec<CachedToken>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let items = with_retry(&self.settings.retry, "ranking", || self.sort_once(event_id, candidates)).await?;
        Ok(reconcile(event_id, candidates, items))
    }
}
