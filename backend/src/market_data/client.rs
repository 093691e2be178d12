use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::MarketDataSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::retry::with_retry;
use crate::types::lenient_decimal;

const SERVICE: &str = "market-data";

/// One token variant as reported by the quote provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenQuote {
    pub name: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub logo: String,
    #[serde(default)]
    pub is_internal: bool,
    #[serde(default, with = "lenient_decimal")]
    pub market_cap: Decimal,
    #[serde(default, with = "lenient_decimal")]
    pub price_usd: Decimal,
    #[serde(default, with = "lenient_decimal")]
    pub liquidity: Decimal,
    #[serde(default, with = "lenient_decimal")]
    pub total_supply: Decimal,
    #[serde(default, deserialize_with = "lenient_int")]
    pub decimals: i32,
}

fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::Number(n)) => n.as_i64().and_then(|v| i32::try_from(v).ok()).unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<BTreeMap<String, Vec<TokenQuote>>>,
}

/// One batched lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteQuery {
    pub names: Vec<String>,
    pub chain: Option<String>,
    pub limit: usize,
}

impl QuoteQuery {
    /// Limit is `max(10, 3 × names)` so fuzzy matches do not crowd out
    /// exact ones.
    pub fn new(names: Vec<String>, chain: Option<String>) -> Self {
        let limit = (names.len() * 3).max(10);
        Self { names, chain, limit }
    }
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn search(&self, query: &QuoteQuery) -> PipelineResult<Vec<TokenQuote>>;
}

/// HTTP client for the token search endpoint.
pub struct QuoteApiClient {
    http: Client,
    settings: MarketDataSettings,
}

impl QuoteApiClient {
    pub fn new(settings: MarketDataSettings) -> PipelineResult<Self> {
        let http = Client::builder()
            .timeout(settings.retry.request_timeout())
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { http, settings })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/v1/ai/tokens", self.settings.base_url.trim_end_matches('/'))
    }

    async fn search_once(&self, query: &QuoteQuery) -> PipelineResult<Vec<TokenQuote>> {
        let mut params = vec![
            ("q", query.names.join(",")),
            ("limit", query.limit.to_string()),
            ("fuzzy", "1".to_string()),
        ];
        if let Some(chain) = &query.chain {
            params.push(("chain", chain.clone()));
        }

        let response = self
            .http
            .get(self.endpoint())
            .query(&params)
            .send()
            .await
            .map_err(|e| PipelineError::from_http(SERVICE, e))?
            .error_for_status()
            .map_err(|e| PipelineError::from_http(SERVICE, e))?;

        let body: QuoteResponse = response.json().await.map_err(|e| PipelineError::Upstream {
            service: SERVICE,
            message: format!("undecodable response: {}", e),
        })?;

        if body.code != 0 {
            return Err(PipelineError::Upstream {
                service: SERVICE,
                message: format!("code {}: {}", body.code, body.message),
            });
        }

        let quotes: Vec<TokenQuote> = body.data.unwrap_or_default().into_values().flatten().collect();
        debug!(names = query.names.len(), quotes = quotes.len(), "Quote search complete");
        Ok(quotes)
    }
}

#[async_trait]
impl MarketDataProvider for QuoteApiClient {
    async fn search(&self, query: &QuoteQuery) -> PipelineResult<Vec<TokenQuote>> {
        if query.names.is_empty() {
            return Ok(Vec::new());
        }
        with_retry(&self.settings.retry, "quote search", || self.search_once(query))
            .await
            .map_err(|e| {
                warn!(error = %e, "Quote search failed");
                e
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: String) -> MarketDataSettings {
        MarketDataSettings {
            base_url,
            retry: RetrySettings {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 2,
                request_timeout_secs: 5,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_query_limit() {
        assert_eq!(QuoteQuery::new(vec!["a".into()], None).limit, 10);
        let names: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        assert_eq!(QuoteQuery::new(names, None).limit, 15);
    }

    #[test]
    fn test_out_of_range_decimals_fall_back_to_zero() {
        let quote: TokenQuote = serde_json::from_value(serde_json::json!({
            "name": "foo", "address": "a", "network": "solana", "decimals": 4294967305u64
        }))
        .unwrap();
        assert_eq!(quote.decimals, 0);

        let quote: TokenQuote = serde_json::from_value(serde_json::json!({
            "name": "foo", "address": "a", "network": "solana", "decimals": -6
        }))
        .unwrap();
        assert_eq!(quote.decimals, -6);
    }

    #[tokio::test]
    async fn test_search_decodes_grouped_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/ai/tokens"))
            .and(query_param("q", "foo,bar"))
            .and(query_param("limit", "10"))
            .and(query_param("fuzzy", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0,
                "message": "ok",
                "data": {
                    "foo": [{"name": "FOO", "symbol": "FOO", "address": "0xabc", "network": "solana",
                             "market_cap": "1000", "price_usd": "0.5", "decimals": 9}],
                    "bar": [{"name": "bar", "network": "bsc", "market_cap": 250.5, "price_usd": null,
                             "decimals": "18"}]
                }
            })))
            .mount(&server)
            .await;

        let client = QuoteApiClient::new(settings(server.uri())).unwrap();
        let quotes = client
            .search(&QuoteQuery::new(vec!["foo".into(), "bar".into()], None))
            .await
            .unwrap();

        assert_eq!(quotes.len(), 2);
        let bar = quotes.iter().find(|q| q.name == "bar").unwrap();
        assert_eq!(bar.market_cap, dec!(250.5));
        assert_eq!(bar.price_usd, Decimal::ZERO);
        assert_eq!(bar.decimals, 18);
        let foo = quotes.iter().find(|q| q.name == "FOO").unwrap();
        assert_eq!(foo.market_cap, dec!(1000));
    }

    #[tokio::test]
    async fn test_business_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 500, "message": "boom", "data": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = QuoteApiClient::new(settings(server.uri())).unwrap();
        let err = client.search(&QuoteQuery::new(vec!["foo".into()], None)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Upstream { .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = QuoteApiClient::new(settings(server.uri())).unwrap();
        let err = client.search(&QuoteQuery::new(vec!["foo".into()], None)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_chain_parameter_is_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("chain", "bsc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0, "message": "ok", "data": {}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = QuoteApiClient::new(settings(server.uri())).unwrap();
        let quotes = client
            .search(&QuoteQuery::new(vec!["foo".into()], Some("bsc".into())))
            .await
            .unwrap();
        assert!(quotes.is_empty());
    }
}
