use std::collections::HashSet;

use crate::types::CachedToken;

/// Positions that count as "top" for admission and for the hot-data ledger.
pub const TOP_SLOTS: usize = 3;

/// True iff one of the first `min(3, len)` ranked tokens is not a prior
/// member.
pub fn has_new_entrant(ranked: &[CachedToken], prior_keys: &HashSet<String>) -> bool {
    ranked
        .iter()
        .take(TOP_SLOTS)
        .any(|token| !prior_keys.contains(&token.unique_key()))
}

/// Walks the ranking: prior members are always kept, new tokens only while
/// the rebuilt list is shorter than the top-slot budget.
pub fn rebuild(ranked: &[CachedToken], prior_keys: &HashSet<String>) -> Vec<CachedToken> {
    let mut rebuilt: Vec<CachedToken> = Vec::with_capacity(ranked.len());
    for token in ranked {
        if prior_keys.contains(&token.unique_key()) || rebuilt.len() < TOP_SLOTS {
            rebuilt.push(token.clone());
        }
    }
    rebuilt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChainInfo, MarketStats};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn token(name: &str) -> CachedToken {
        let now = Utc::now();
        CachedToken {
            id: name.to_string(),
            entity_id: String::new(),
            name: name.to_string(),
            symbol: String::new(),
            standard: None,
            decimals: 0,
            contract_address: String::new(),
            logo: String::new(),
            stats: MarketStats::first_observation(dec!(1), dec!(1)),
            chain: ChainInfo::from_slug("eth"),
            created_at: now,
            updated_at: now,
        }
    }

    fn keys(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| token(n).unique_key()).collect()
    }

    fn ranked(names: &[&str]) -> Vec<CachedToken> {
        names.iter().map(|n| token(n)).collect()
    }

    fn names(tokens: &[CachedToken]) -> Vec<String> {
        tokens.iter().map(|t| t.name.clone()).collect()
    }

    #[test]
    fn test_gate_ignores_entrants_below_top_three() {
        let prior = keys(&["a", "b", "c"]);
        assert!(!has_new_entrant(&ranked(&["b", "a", "c", "d"]), &prior));
        assert!(has_new_entrant(&ranked(&["b", "d", "a", "c"]), &prior));
    }

    #[test]
    fn test_gate_on_empty_prior() {
        assert!(has_new_entrant(&ranked(&["foo"]), &HashSet::new()));
        assert!(!has_new_entrant(&[], &HashSet::new()));
    }

    #[test]
    fn test_rebuild_never_evicts_prior_members() {
        let prior = keys(&["a", "b", "c"]);
        let rebuilt = rebuild(&ranked(&["d", "a", "b", "c"]), &prior);
        assert_eq!(names(&rebuilt), vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_rebuild_admits_new_tokens_only_within_budget() {
        let prior = keys(&["a"]);
        let rebuilt = rebuild(&ranked(&["x", "y", "a", "z"]), &prior);
        assert_eq!(names(&rebuilt), vec!["x", "y", "a"]);

        let rebuilt = rebuild(&ranked(&["x", "y", "z", "w"]), &HashSet::new());
        assert_eq!(names(&rebuilt), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let prior = keys(&["a", "b"]);
        let first = rebuild(&ranked(&["c", "a", "b", "d"]), &prior);
        let prior_again: HashSet<String> = first.iter().map(|t| t.unique_key()).collect();
        let second = rebuild(&first, &prior_again);
        assert_eq!(names(&first), names(&second));
    }
}
