use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::error::PipelineResult;
use crate::types::CachedToken;

pub mod client;
pub mod local;

pub use client::AdminRankingClient;
pub use local::LocalMarketCapRanking;

/// Produces the total order of an event's candidates, highest effective
/// market cap first.
#[async_trait]
pub trait RankingAuthority: Send + Sync {
    async fn rank(&self, event_id: &str, candidates: &[CachedToken]) -> PipelineResult<Vec<CachedToken>>;
}

/// Uses the primary authority and falls back to local ranking when it fails.
pub struct FallbackRanking {
    primary: Arc<dyn RankingAuthority>,
    local: LocalMarketCapRanking,
}

impl FallbackRanking {
    pub fn new(primary: Arc<dyn RankingAuthority>) -> Self {
        Self {
            primary,
            local: LocalMarketCapRanking,
        }
    }
}

#[async_trait]
impl RankingAuthority for FallbackRanking {
    async fn rank(&self, event_id: &str, candidates: &[CachedToken]) -> PipelineResult<Vec<CachedToken>> {
        match self.primary.rank(event_id, candidates).await {
            Ok(ranked) => Ok(ranked),
            Err(e) => {
                warn!(event_id, error = %e, "Ranking authority failed, ranking locally");
                Ok(self.local.rank_sync(candidates))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::types::{ChainInfo, MarketStats};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn token(name: &str, warning: Decimal, current: Decimal) -> CachedToken {
        let now = Utc::now();
        let mut stats = MarketStats::first_observation(dec!(1), warning);
        stats.current_market_cap = current;
        CachedToken {
            id: name.to_string(),
            entity_id: String::new(),
            name: name.to_string(),
            symbol: String::new(),
            standard: None,
            decimals: 0,
            contract_address: String::new(),
            logo: String::new(),
            stats,
            chain: ChainInfo::from_slug("eth"),
            created_at: now,
            updated_at: now,
        }
    }

    struct Unavailable;

    #[async_trait]
    impl RankingAuthority for Unavailable {
        async fn rank(&self, _: &str, _: &[CachedToken]) -> PipelineResult<Vec<CachedToken>> {
            Err(PipelineError::TransientUpstream { service: "ranking", message: "down".into() })
        }
    }

    #[tokio::test]
    async fn test_local_ranking_uses_effective_cap_and_is_stable() {
        let candidates = vec![
            token("a", dec!(100), dec!(0)),
            token("b", dec!(50), dec!(300)),
            token("c", dec!(100), dec!(100)),
        ];
        let ranked = LocalMarketCapRanking.rank("evt", &candidates).await.unwrap();
        let names: Vec<&str> = ranked.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_fallback_ranks_locally() {
        let ranking = FallbackRanking::new(Arc::new(Unavailable));
        let candidates = vec![token("a", dec!(1), dec!(1)), token("b", dec!(2), dec!(2))];
        let ranked = ranking.rank("evt", &candidates).await.unwrap();
        assert_eq!(ranked[0].name, "b");
    }
}
