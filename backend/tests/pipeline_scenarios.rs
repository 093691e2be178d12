use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use token_intel_backend::cache::{HotDataLedger, InMemoryCacheStore, TokenSnapshotStore};
use token_intel_backend::config::AppConfig;
use token_intel_backend::market_data::{MarketDataEnricher, MarketDataProvider, QuoteQuery, TokenQuote};
use token_intel_backend::pipeline::IntelligencePipeline;
use token_intel_backend::projection::NoopProjection;
use token_intel_backend::ranking::RankingAuthority;
use token_intel_backend::types::{CachedToken, ChainInfo, InboundEvent, MarketStats};
use token_intel_backend::{PipelineError, PipelineResult};

const EVENT: &str = "evt-scenario";

struct ScriptedQuotes {
    quotes: Mutex<Vec<TokenQuote>>,
    failing: AtomicBool,
}

#[async_trait]
impl MarketDataProvider for ScriptedQuotes {
    async fn search(&self, query: &QuoteQuery) -> PipelineResult<Vec<TokenQuote>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PipelineError::TransientUpstream {
                service: "market-data",
                message: "connection refused".to_string(),
            });
        }
        let wanted: HashSet<String> = query.names.iter().map(|n| n.to_lowercase()).collect();
        Ok(self
            .quotes
            .lock()
            .unwrap()
            .iter()
            .filter(|q| wanted.contains(&q.name.to_lowercase()))
            .filter(|q| query.chain.as_ref().map(|c| c == &q.network).unwrap_or(true))
            .cloned()
            .collect())
    }
}

/// Ranks by a fixed name order, as the external authority would.
struct ScriptedRanking {
    order: Mutex<Vec<String>>,
}

#[async_trait]
impl RankingAuthority for ScriptedRanking {
    async fn rank(&self, _event_id: &str, candidates: &[CachedToken]) -> PipelineResult<Vec<CachedToken>> {
        let order = self.order.lock().unwrap().clone();
        let mut ranked: Vec<CachedToken> = order
            .iter()
            .filter_map(|name| candidates.iter().find(|t| &t.name == name).cloned())
            .collect();
        for token in candidates {
            if !order.contains(&token.name) {
                ranked.push(token.clone());
            }
        }
        Ok(ranked)
    }
}

struct World {
    quotes: Arc<ScriptedQuotes>,
    ranking: Arc<ScriptedRanking>,
    snapshots: TokenSnapshotStore,
    ledger: HotDataLedger,
    pipeline: IntelligencePipeline,
}

fn world() -> World {
    let config = AppConfig::default();
    let store = Arc::new(InMemoryCacheStore::new());
    let quotes = Arc::new(ScriptedQuotes {
        quotes: Mutex::new(Vec::new()),
        failing: AtomicBool::new(false),
    });
    let ranking = Arc::new(ScriptedRanking {
        order: Mutex::new(Vec::new()),
    });
    let snapshots = TokenSnapshotStore::new(store.clone(), &config.cache);
    let ledger = HotDataLedger::new(store.clone(), &config.cache);
    let pipeline = IntelligencePipeline::new(
        snapshots.clone(),
        ledger.clone(),
        MarketDataEnricher::new(quotes.clone(), &config.market_data.supported_chains),
        ranking.clone(),
        Arc::new(NoopProjection),
        3,
    );
    World {
        quotes,
        ranking,
        snapshots,
        ledger,
        pipeline,
    }
}

fn quote(name: &str, network: &str, cap: Decimal) -> TokenQuote {
    TokenQuote {
        name: name.to_string(),
        symbol: name.to_string(),
        address: format!("addr{}", name.to_lowercase()),
        network: network.to_string(),
        logo: String::new(),
        is_internal: false,
        market_cap: cap,
        price_usd: cap / dec!(1000000),
        liquidity: Decimal::ZERO,
        total_supply: Decimal::ZERO,
        decimals: 9,
    }
}

fn cached(name: &str, cap: Decimal) -> CachedToken {
    let now = Utc::now();
    CachedToken {
        id: format!("id-{}", name),
        entity_id: String::new(),
        name: name.to_string(),
        symbol: name.to_string(),
        standard: None,
        decimals: 9,
        contract_address: format!("addr{}", name.to_lowercase()),
        logo: String::new(),
        stats: MarketStats::first_observation(cap / dec!(1000000), cap),
        chain: ChainInfo::from_slug("solana"),
        created_at: now,
        updated_at: now,
    }
}

fn event(names: &[&str]) -> InboundEvent {
    InboundEvent {
        event_id: EVENT.to_string(),
        candidate_names: names.iter().map(|n| n.to_string()).collect(),
    }
}

fn names(tokens: &[CachedToken]) -> Vec<String> {
    tokens.iter().map(|t| t.name.clone()).collect()
}

impl World {
    fn rank_as(&self, order: &[&str]) {
        *self.ranking.order.lock().unwrap() = order.iter().map(|n| n.to_string()).collect();
    }

    fn offer(&self, quotes: Vec<TokenQuote>) {
        *self.quotes.quotes.lock().unwrap() = quotes;
    }

    /// Event already holds A, B, C, which already sit in the ledger.
    async fn seed_abc(&self) -> Vec<CachedToken> {
        let prior = vec![cached("A", dec!(3000)), cached("B", dec!(2000)), cached("C", dec!(1000))];
        self.snapshots.persist(EVENT, &prior).await.unwrap();
        self.ledger.append_top_n("older-event", &prior, 3).await.unwrap();
        self.snapshots.load(EVENT).await.unwrap()
    }
}

#[tokio::test]
async fn test_first_sighting_creates_snapshot_and_ledger_entry() {
    let w = world();
    w.offer(vec![quote("FOO", "solana", dec!(1000))]);
    w.rank_as(&["FOO"]);

    let report = w.pipeline.run_iteration(&event(&["FOO"])).await.unwrap();
    assert!(report.admitted);

    let snapshot = w.snapshots.load(EVENT).await.unwrap();
    assert_eq!(names(&snapshot), vec!["FOO"]);
    assert_eq!(snapshot[0].stats.warning_market_cap, dec!(1000));

    let ledger = w.ledger.read().await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].unique_key(), "foo:addrfoo:solana");
    assert_eq!(ledger[0].first_rank, 1);
}

#[tokio::test]
async fn test_new_token_outside_top_three_changes_nothing() {
    let w = world();
    let prior = w.seed_abc().await;
    w.offer(vec![quote("D", "solana", dec!(500))]);
    w.rank_as(&["B", "A", "C", "D"]);
    let ledger_before = w.ledger.read().await.unwrap();

    let report = w.pipeline.run_iteration(&event(&["A", "D"])).await.unwrap();
    assert_eq!(report.discovered, 1);
    assert!(report.ranked);
    assert!(!report.admitted);

    assert_eq!(w.snapshots.load(EVENT).await.unwrap(), prior);
    assert_eq!(w.ledger.read().await.unwrap(), ledger_before);
}

#[tokio::test]
async fn test_new_leader_is_admitted_without_evicting_prior_members() {
    let w = world();
    w.seed_abc().await;
    w.offer(vec![quote("D", "solana", dec!(9000))]);
    w.rank_as(&["D", "A", "B", "C"]);

    let report = w.pipeline.run_iteration(&event(&["D"])).await.unwrap();
    assert!(report.admitted);

    let snapshot = w.snapshots.load(EVENT).await.unwrap();
    assert_eq!(names(&snapshot), vec!["D", "A", "B", "C"]);
    assert_eq!(snapshot[1].id, "id-A");

    let ledger: Vec<String> = w.ledger.read().await.unwrap().into_iter().map(|e| e.token.name).collect();
    assert_eq!(ledger, vec!["A", "B", "C", "D"]);
}

#[tokio::test]
async fn test_market_data_outage_only_reorders_known_members() {
    let w = world();
    let prior = w.seed_abc().await;
    w.quotes.failing.store(true, Ordering::SeqCst);
    w.rank_as(&["C", "B", "A"]);

    let report = w.pipeline.run_iteration(&event(&["D", "E"])).await.unwrap();
    assert!(report.enrichment_skipped);
    assert_eq!(report.candidates, 3);
    assert!(!report.admitted);
    assert_eq!(w.snapshots.load(EVENT).await.unwrap(), prior);
}

#[tokio::test]
async fn test_rewrites_keep_the_snapshot_ttl_window() {
    let w = world();
    w.seed_abc().await;
    let before = w.snapshots.remaining_ttl(EVENT).await.unwrap().unwrap();

    w.offer(vec![quote("D", "solana", dec!(9000))]);
    w.rank_as(&["D", "A", "B", "C"]);
    w.pipeline.run_iteration(&event(&["D"])).await.unwrap();

    let after = w.snapshots.remaining_ttl(EVENT).await.unwrap().unwrap();
    assert!(after <= before);
    assert!(after > Duration::from_secs(95 * 3600));
}

#[tokio::test]
async fn test_refresh_moves_current_stats_only() {
    let w = world();
    w.seed_abc().await;
    w.offer(vec![
        quote("A", "solana", dec!(6000)),
        quote("B", "solana", dec!(1000)),
        quote("C", "solana", dec!(1000)),
    ]);

    let outcome = w.pipeline.refresh_market_data(EVENT).await.unwrap();
    assert_eq!(outcome.updated, 2);

    let snapshot = w.snapshots.load(EVENT).await.unwrap();
    let a = &snapshot[0];
    assert_eq!(a.stats.warning_market_cap, dec!(3000));
    assert_eq!(a.stats.current_market_cap, dec!(6000));
    assert_eq!(a.stats.highest_increase_rate, dec!(2));

    let b = &snapshot[1];
    assert_eq!(b.stats.current_market_cap, dec!(1000));
    assert_eq!(b.stats.highest_increase_rate, dec!(1));

    w.offer(vec![quote("A", "solana", dec!(4500))]);
    w.pipeline.refresh_market_data(EVENT).await.unwrap();
    let a = &w.snapshots.load(EVENT).await.unwrap()[0];
    assert_eq!(a.stats.current_market_cap, dec!(4500));
    assert_eq!(a.stats.highest_increase_rate, dec!(2));
}

#[tokio::test]
async fn test_duplicate_names_never_duplicate_tokens() {
    let w = world();
    w.offer(vec![
        quote("FOO", "solana", dec!(100)),
        quote("FOO", "bsc", dec!(700)),
        quote("BAR", "base", dec!(50)),
    ]);
    w.rank_as(&["FOO", "BAR"]);

    for _ in 0..3 {
        w.pipeline
            .run_iteration(&event(&["FOO", "foo", "BAR", " FOO "]))
            .await
            .unwrap();
    }

    let snapshot = w.snapshots.load(EVENT).await.unwrap();
    let keys: HashSet<String> = snapshot.iter().map(|t| t.unique_key()).collect();
    assert_eq!(keys.len(), snapshot.len());
    assert_eq!(names(&snapshot), vec!["FOO", "BAR"]);
    assert_eq!(snapshot[0].chain.slug, "bsc");

    let ledger = w.ledger.read().await.unwrap();
    assert_eq!(ledger.len(), 2);
}

#[tokio::test]
async fn test_ledger_only_grows_across_events() {
    let w = world();
    w.offer(vec![
        quote("X", "solana", dec!(10)),
        quote("Y", "solana", dec!(20)),
        quote("Z", "solana", dec!(30)),
        quote("W", "solana", dec!(40)),
    ]);

    let mut seen = 0;
    for (i, order) in [["X", "Y", "Z"], ["W", "X", "Y"], ["Z", "Y", "X"]].iter().enumerate() {
        w.rank_as(order);
        let e = InboundEvent {
            event_id: format!("evt-{}", i),
            candidate_names: order.iter().map(|n| n.to_string()).collect(),
        };
        w.pipeline.run_iteration(&e).await.unwrap();

        let ledger = w.ledger.read().await.unwrap();
        assert!(ledger.len() >= seen);
        seen = ledger.len();
    }
    let names: Vec<String> = w.ledger.read().await.unwrap().into_iter().map(|e| e.token.name).collect();
    assert_eq!(names, vec!["X", "Y", "Z", "W"]);
}
