use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::admission::{has_new_entrant, rebuild};
use super::merger::{merge_candidates, undiscovered_names};
use crate::cache::{HotDataLedger, TokenSnapshotStore};
use crate::error::PipelineResult;
use crate::market_data::{MarketDataEnricher, RefreshOutcome};
use crate::projection::{showed_tokens, ShowedTokensProjection};
use crate::ranking::RankingAuthority;
use crate::types::InboundEvent;

/// What one enrich → merge → rank → admit pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub candidates: usize,
    pub discovered: usize,
    pub enrichment_skipped: bool,
    /// False when the ranking authority failed and the pass stopped early.
    pub ranked: bool,
    pub admitted: bool,
    pub snapshot_len: usize,
    pub ledger_added: usize,
}

/// Per-event pipeline over the shared cache.
pub struct IntelligencePipeline {
    snapshots: TokenSnapshotStore,
    ledger: HotDataLedger,
    enricher: MarketDataEnricher,
    ranking: Arc<dyn RankingAuthority>,
    projection: Arc<dyn ShowedTokensProjection>,
    top_n: usize,
}

impl IntelligencePipeline {
    pub fn new(
        snapshots: TokenSnapshotStore,
        ledger: HotDataLedger,
        enricher: MarketDataEnricher,
        ranking: Arc<dyn RankingAuthority>,
        projection: Arc<dyn ShowedTokensProjection>,
        top_n: usize,
    ) -> Self {
        Self {
            snapshots,
            ledger,
            enricher,
            ranking,
            projection,
            top_n,
        }
    }

    pub fn snapshots(&self) -> &TokenSnapshotStore {
        &self.snapshots
    }

    pub fn ledger(&self) -> &HotDataLedger {
        &self.ledger
    }

    /// Updates live stats of the event's cached members and writes the
    /// snapshot back only if something changed.
    pub async fn refresh_market_data(&self, event_id: &str) -> PipelineResult<RefreshOutcome> {
        let mut tokens = self.snapshots.load(event_id).await?;
        if tokens.is_empty() {
            debug!(event_id, "No cached tokens to refresh");
            return Ok(RefreshOutcome::default());
        }

        let outcome = self.enricher.refresh(event_id, &mut tokens).await;
        if outcome.changed() {
            self.snapshots.persist(event_id, &tokens).await?;
        }
        Ok(outcome)
    }

    /// One full pass for an event. Upstream failures degrade the pass
    /// instead of failing it; only an unreadable cache is an error.
    pub async fn run_iteration(&self, event: &InboundEvent) -> PipelineResult<IterationReport> {
        let event_id = event.event_id.as_str();
        let mut report = IterationReport::default();

        let prior = self.snapshots.load(event_id).await?;
        let prior_keys: HashSet<String> = prior.iter().map(|t| t.unique_key()).collect();

        let names = undiscovered_names(&prior, &event.candidate_names);
        let discovered = match self.enricher.discover(&names).await {
            Ok(found) => found,
            Err(e) => {
                warn!(event_id, error = %e, "Enrichment skipped for this iteration");
                report.enrichment_skipped = true;
                Vec::new()
            }
        };
        report.discovered = discovered.len();

        let candidates = merge_candidates(&prior, &discovered);
        report.candidates = candidates.len();
        report.snapshot_len = prior.len();
        if candidates.is_empty() {
            debug!(event_id, "No candidates yet");
            return Ok(report);
        }

        let ranked = match self.ranking.rank(event_id, &candidates).await {
            Ok(ranked) => ranked,
            Err(e) => {
                error!(event_id, error = %e, "Ranking failed, iteration degraded");
                return Ok(report);
            }
        };
        report.ranked = true;

        if has_new_entrant(&ranked, &prior_keys) {
            let rebuilt = rebuild(&ranked, &prior_keys);
            self.snapshots.persist(event_id, &rebuilt).await?;
            report.admitted = true;
            report.snapshot_len = rebuilt.len();
            info!(event_id, size = rebuilt.len(), "New top entrant admitted");

            if let Err(e) = self.projection.sync(event_id, &showed_tokens(&rebuilt)).await {
                warn!(event_id, error = %e, "Showed-tokens projection sync failed");
            }
        }

        match self.ledger.append_top_n(event_id, &ranked, self.top_n).await {
            Ok(added) => report.ledger_added = added.len(),
            Err(e) => warn!(event_id, error = %e, "Hot data ledger update failed"),
        }

        Ok(report)
    }
}
