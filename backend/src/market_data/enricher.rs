use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::client::{MarketDataProvider, QuoteQuery, TokenQuote};
use crate::error::PipelineResult;
use crate::types::{normalize_address, unique_key, CachedToken};

/// Slug used when a cached token carries no chain.
pub const DEFAULT_CHAIN_SLUG: &str = "eth";

/// Result of refreshing an event's cached members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub updated: usize,
    pub unmatched: usize,
    pub failed_groups: usize,
}

impl RefreshOutcome {
    pub fn changed(&self) -> bool {
        self.updated > 0
    }
}

/// Turns provider quotes into live stats for candidate names.
pub struct MarketDataEnricher {
    provider: Arc<dyn MarketDataProvider>,
    supported_chains: HashSet<String>,
}

impl MarketDataEnricher {
    pub fn new(provider: Arc<dyn MarketDataProvider>, supported_chains: &[String]) -> Self {
        Self {
            provider,
            supported_chains: supported_chains.iter().map(|c| c.trim().to_lowercase()).collect(),
        }
    }

    pub fn is_supported(&self, network: &str) -> bool {
        self.supported_chains.contains(&network.trim().to_lowercase())
    }

    /// Looks up `names` in one batch and returns, per requested name, the
    /// supported-chain variant with the highest market cap. Output follows
    /// the order of `names`.
    pub async fn discover(&self, names: &[String]) -> PipelineResult<Vec<TokenQuote>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let quotes = self.provider.search(&QuoteQuery::new(names.to_vec(), None)).await?;
        let total = quotes.len();

        let mut best: HashMap<String, TokenQuote> = HashMap::new();
        for quote in quotes.into_iter().filter(|q| self.is_supported(&q.network)) {
            let name = quote.name.trim().to_lowercase();
            match best.get(&name) {
                Some(current) if current.market_cap >= quote.market_cap => {}
                _ => {
                    best.insert(name, quote);
                }
            }
        }

        let mut seen = HashSet::new();
        let picked: Vec<TokenQuote> = names
            .iter()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| seen.insert(n.clone()))
            .filter_map(|n| best.remove(&n))
            .collect();

        debug!(requested = names.len(), received = total, picked = picked.len(), "Discovery complete");
        Ok(picked)
    }

    /// Pulls fresh price and market cap for every cached member, one request
    /// per chain. A failing chain group is skipped; its members keep their
    /// last known stats.
    pub async fn refresh(&self, event_id: &str, tokens: &mut [CachedToken]) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();

        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, token) in tokens.iter().enumerate() {
            let slug = match token.chain.slug.trim() {
                "" => DEFAULT_CHAIN_SLUG.to_string(),
                s => s.to_lowercase(),
            };
            groups.entry(slug).or_default().push(idx);
        }

        for (slug, members) in groups {
            let names: Vec<String> = {
                let mut seen = HashSet::new();
                members
                    .iter()
                    .map(|&i| tokens[i].name.clone())
                    .filter(|n| !n.trim().is_empty() && seen.insert(n.to_lowercase()))
                    .collect()
            };
            if names.is_empty() {
                continue;
            }

            let chain = self.is_supported(&slug).then(|| slug.clone());
            let quotes = match self.provider.search(&QuoteQuery::new(names, chain)).await {
                Ok(quotes) => quotes,
                Err(e) => {
                    warn!(event_id, chain = %slug, error = %e, "Market refresh failed for chain group");
                    outcome.failed_groups += 1;
                    continue;
                }
            };

            let index = QuoteIndex::build(&slug, quotes);
            for idx in members {
                let token = &mut tokens[idx];
                let Some(quote) = index.lookup(token) else {
                    outcome.unmatched += 1;
                    continue;
                };

                let mut changed = token.stats.apply_quote(quote.price_usd, quote.market_cap);
                if token.contract_address.trim().is_empty() && !quote.address.trim().is_empty() {
                    token.contract_address = quote.address.clone();
                    changed = true;
                }
                if changed {
                    token.updated_at = Utc::now();
                    outcome.updated += 1;
                }
            }
        }

        if outcome.updated > 0 || outcome.failed_groups > 0 {
            info!(
                event_id,
                updated = outcome.updated,
                unmatched = outcome.unmatched,
                failed_groups = outcome.failed_groups,
                "Market refresh finished"
            );
        }
        outcome
    }
}

/// Quotes of one chain group, keyed the same way cached tokens are.
struct QuoteIndex {
    by_key: HashMap<String, TokenQuote>,
    by_address: HashMap<String, TokenQuote>,
    by_name: HashMap<String, TokenQuote>,
}

impl QuoteIndex {
    fn build(slug: &str, quotes: Vec<TokenQuote>) -> Self {
        let mut index = Self {
            by_key: HashMap::new(),
            by_address: HashMap::new(),
            by_name: HashMap::new(),
        };
        for quote in quotes {
            let network = quote.network.trim().to_lowercase();
            if network != slug && !(slug == DEFAULT_CHAIN_SLUG && network == "ethereum") {
                continue;
            }
            index
                .by_key
                .entry(unique_key(&quote.name, &quote.address, slug))
                .or_insert_with(|| quote.clone());
            let address = normalize_address(&quote.address);
            if !address.is_empty() {
                index.by_address.entry(address).or_insert_with(|| quote.clone());
            }
            let name = quote.name.trim().to_lowercase();
            match index.by_name.get(&name) {
                Some(current) if current.market_cap >= quote.market_cap => {}
                _ => {
                    index.by_name.insert(name, quote);
                }
            }
        }
        index
    }

    fn lookup(&self, token: &CachedToken) -> Option<&TokenQuote> {
        let slug = match token.chain.slug.trim() {
            "" => DEFAULT_CHAIN_SLUG.to_string(),
            s => s.to_lowercase(),
        };
        if let Some(quote) = self.by_key.get(&unique_key(&token.name, &token.contract_address, &slug)) {
            return Some(quote);
        }
        let address = normalize_address(&token.contract_address);
        if !address.is_empty() {
            return self.by_address.get(&address);
        }
        self.by_name.get(&token.name.trim().to_lowercase())
    }
}
