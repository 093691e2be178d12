use async_trait::async_trait;

use super::RankingAuthority;
use crate::error::PipelineResult;
use crate::types::CachedToken;

/// Orders candidates by effective market cap, descending. The sort is
/// stable so equal caps keep their input order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMarketCapRanking;

impl LocalMarketCapRanking {
    pub fn rank_sync(&self, candidates: &[CachedToken]) -> Vec<CachedToken> {
        let mut ranked = candidates.to_vec();
        ranked.sort_by(|a, b| b.effective_market_cap().cmp(&a.effective_market_cap()));
        ranked
    }
}

#[async_trait]
impl RankingAuthority for LocalMarketCapRanking {
    async fn rank(&self, _event_id: &str, candidates: &[CachedToken]) -> PipelineResult<Vec<CachedToken>> {
        Ok(self.rank_sync(candidates))
    }
}
