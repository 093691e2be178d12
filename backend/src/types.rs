use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Chain a token variant lives on. Only the slug takes part in identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub logo: String,
}

impl ChainInfo {
    pub fn from_slug(slug: &str) -> Self {
        Self {
            slug: slug.to_lowercase(),
            ..Default::default()
        }
    }
}

/// Market statistics of a cached token.
///
/// `warning_*` is the baseline captured when the token was first observed for
/// an event and is never rewritten afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketStats {
    #[serde(default, with = "lenient_decimal")]
    pub warning_price_usd: Decimal,
    #[serde(default, with = "lenient_decimal")]
    pub warning_market_cap: Decimal,
    #[serde(default, with = "lenient_decimal")]
    pub current_price_usd: Decimal,
    #[serde(default, with = "lenient_decimal")]
    pub current_market_cap: Decimal,
    #[serde(default, with = "lenient_decimal")]
    pub highest_increase_rate: Decimal,
}

/// Increase rates are kept at six decimal places.
pub const INCREASE_RATE_SCALE: u32 = 6;

impl MarketStats {
    /// Baseline stats for a token seen for the first time.
    pub fn first_observation(price_usd: Decimal, market_cap: Decimal) -> Self {
        let highest_increase_rate = if market_cap > Decimal::ZERO {
            Decimal::ONE
        } else {
            Decimal::ZERO
        };
        Self {
            warning_price_usd: price_usd,
            warning_market_cap: market_cap,
            current_price_usd: price_usd,
            current_market_cap: market_cap,
            highest_increase_rate,
        }
    }

    /// Applies a fresh quote. Returns true if anything changed.
    pub fn apply_quote(&mut self, price_usd: Decimal, market_cap: Decimal) -> bool {
        let before = self.clone();
        self.current_price_usd = price_usd;
        self.current_market_cap = market_cap;
        if self.warning_market_cap > Decimal::ZERO {
            match self.current_market_cap.checked_div(self.warning_market_cap) {
                Some(rate) => {
                    let rate = rate.round_dp(INCREASE_RATE_SCALE);
                    if rate > self.highest_increase_rate {
                        self.highest_increase_rate = rate;
                    }
                }
                None => warn!(
                    warning_market_cap = %self.warning_market_cap,
                    current_market_cap = %self.current_market_cap,
                    "Increase rate overflowed, keeping previous high"
                ),
            }
        }
        *self != before
    }

    /// Current market cap, or the warning baseline when no live value is known.
    pub fn effective_market_cap(&self) -> Decimal {
        if self.current_market_cap.is_zero() {
            self.warning_market_cap
        } else {
            self.current_market_cap
        }
    }
}

/// One token variant attached to an intelligence event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    pub id: String,
    #[serde(default)]
    pub entity_id: String,
    pub name: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub standard: Option<String>,
    #[serde(default)]
    pub decimals: i32,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub logo: String,
    #[serde(default)]
    pub stats: MarketStats,
    #[serde(default)]
    pub chain: ChainInfo,
    #[serde(with = "token_time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "token_time")]
    pub updated_at: DateTime<Utc>,
}

impl CachedToken {
    /// `lower(name):lower(address without 0x):lower(chain slug)`
    pub fn unique_key(&self) -> String {
        unique_key(&self.name, &self.contract_address, &self.chain.slug)
    }

    pub fn effective_market_cap(&self) -> Decimal {
        self.stats.effective_market_cap()
    }
}

pub fn unique_key(name: &str, contract_address: &str, chain_slug: &str) -> String {
    format!(
        "{}:{}:{}",
        name.trim().to_lowercase(),
        normalize_address(contract_address),
        chain_slug.trim().to_lowercase()
    )
}

pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    stripped.to_lowercase()
}

/// Ledger entry: the token as it looked when it first reached the top three
/// of some event, plus where that happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotDataEntry {
    #[serde(flatten)]
    pub token: CachedToken,
    #[serde(with = "token_time")]
    pub first_ranked_at: DateTime<Utc>,
    pub first_ranked_event_id: String,
    pub first_rank: usize,
}

impl HotDataEntry {
    pub fn unique_key(&self) -> String {
        self.token.unique_key()
    }
}

/// One unit of inbound work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_id: String,
    pub candidate_names: Vec<String>,
}

/// Row shape written to `intelligences.showed_tokens`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowedToken {
    pub slug: String,
    pub contract_address: String,
    #[serde(with = "lenient_decimal")]
    pub warning_price_usd: Decimal,
    #[serde(with = "lenient_decimal")]
    pub warning_market_cap: Decimal,
}

impl From<&CachedToken> for ShowedToken {
    fn from(token: &CachedToken) -> Self {
        Self {
            slug: token.name.clone(),
            contract_address: token.contract_address.clone(),
            warning_price_usd: token.stats.warning_price_usd,
            warning_market_cap: token.stats.warning_market_cap,
        }
    }
}

/// Decimals travel as strings; upstreams also send numbers, empty strings
/// and nulls, all of which must decode.
pub mod lenient_decimal {
    use rust_decimal::Decimal;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.normalize().to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        match raw {
            None | Some(serde_json::Value::Null) => Ok(Decimal::ZERO),
            Some(serde_json::Value::String(s)) => parse(&s).map_err(de::Error::custom),
            Some(serde_json::Value::Number(n)) => parse(&n.to_string()).map_err(de::Error::custom),
            Some(other) => Err(de::Error::custom(format!("invalid decimal: {}", other))),
        }
    }

    pub fn parse(raw: &str) -> Result<Decimal, String> {
        let s = raw.trim();
        if s.is_empty() {
            return Ok(Decimal::ZERO);
        }
        Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .map_err(|e| format!("invalid decimal '{}': {}", s, e))
    }
}

/// `YYYY-MM-DDTHH:MM:SS.mmm` in UTC.
pub mod token_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";
    const ACCEPTED: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("cannot parse time: {}", raw)))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let s = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        ACCEPTED
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
            .map(|naive| naive.and_utc())
    }
}
