pub mod client;
pub mod enricher;

pub use client::{MarketDataProvider, QuoteApiClient, QuoteQuery, TokenQuote};
pub use enricher::{MarketDataEnricher, RefreshOutcome};
