use chrono::Utc;
use std::collections::HashSet;
use uuid::Uuid;

use crate::market_data::TokenQuote;
use crate::types::{CachedToken, ChainInfo, MarketStats};

/// Builds a first-observation token from a quote. The warning baseline is
/// the quote itself.
pub fn token_from_quote(quote: &TokenQuote) -> CachedToken {
    let now = Utc::now();
    CachedToken {
        id: Uuid::now_v7().to_string(),
        entity_id: String::new(),
        name: quote.name.clone(),
        symbol: quote.symbol.clone(),
        standard: None,
        decimals: quote.decimals,
        contract_address: quote.address.clone(),
        logo: quote.logo.clone(),
        stats: MarketStats::first_observation(quote.price_usd, quote.market_cap),
        chain: ChainInfo::from_slug(&quote.network),
        created_at: now,
        updated_at: now,
    }
}

/// Names among `names` not already carried by `prior` (case-insensitive),
/// de-duplicated in input order.
pub fn undiscovered_names(prior: &[CachedToken], names: &[String]) -> Vec<String> {
    let mut known: HashSet<String> = prior.iter().map(|t| t.name.trim().to_lowercase()).collect();
    names
        .iter()
        .filter(|n| !n.trim().is_empty())
        .filter(|n| known.insert(n.trim().to_lowercase()))
        .cloned()
        .collect()
}

/// Prior members first in their stored order, then one new token per quote
/// that is not already present by unique key or name.
pub fn merge_candidates(prior: &[CachedToken], discovered: &[TokenQuote]) -> Vec<CachedToken> {
    let mut keys: HashSet<String> = HashSet::new();
    let mut names: HashSet<String> = HashSet::new();
    let mut merged = Vec::with_capacity(prior.len() + discovered.len());

    for token in prior {
        if keys.insert(token.unique_key()) {
            names.insert(token.name.trim().to_lowercase());
            merged.push(token.clone());
        }
    }

    for quote in discovered {
        let token = token_from_quote(quote);
        let name = token.name.trim().to_lowercase();
        if names.contains(&name) || !keys.insert(token.unique_key()) {
            continue;
        }
        names.insert(name);
        merged.push(token);
    }
    merged
}
