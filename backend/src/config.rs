use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::PipelineError;

/// Chains whose quotes are accepted at all.
pub const DEFAULT_SUPPORTED_CHAINS: [&str; 5] = ["solana", "bsc", "ethereum", "eth", "base"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub redis: RedisSettings,
    pub market_data: MarketDataSettings,
    pub ranking: RankingSettings,
    pub detection: DetectionSettings,
    pub consumer: ConsumerSettings,
    pub cache: CacheSettings,
    pub projection: ProjectionSettings,
    pub admin: AdminSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    pub url: String,
    pub command_timeout_ms: u64,
}

/// Outbound HTTP policy shared by both collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataSettings {
    pub base_url: String,
    pub supported_chains: Vec<String>,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingSettings {
    pub base_url: String,
    /// Rank locally by market cap when the authority cannot be reached.
    pub local_fallback: bool,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Sleep between iterations inside the worker.
    Inline,
    /// Release the worker and re-enqueue a delayed follow-up per iteration.
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSettings {
    pub interval_secs: u64,
    pub max_iterations: u32,
    pub mode: DetectionMode,
    pub top_n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    pub queue_name: String,
    pub max_concurrent: usize,
    pub receive_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub snapshot_key_prefix: String,
    pub snapshot_ttl_hours: u64,
    pub hot_data_key: String,
    /// `None` keeps the ledger forever.
    pub hot_data_ttl_hours: Option<u64>,
    pub lease_key_prefix: String,
    pub cas_max_attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectionSettings {
    pub database_url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSettings {
    pub enabled: bool,
    pub bind_addr: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            command_timeout_ms: 2000,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            request_timeout_secs: 30,
        }
    }
}

impl RetrySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for MarketDataSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            supported_chains: DEFAULT_SUPPORTED_CHAINS.iter().map(|c| c.to_string()).collect(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RankingSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8082".to_string(),
            local_fallback: false,
            retry: RetrySettings::default(),
        }
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_iterations: 10,
            mode: DetectionMode::Inline,
            top_n: 3,
        }
    }
}

impl DetectionSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Initial lease length; each iteration renews it to this length again.
    pub fn lease_ttl(&self) -> Duration {
        self.interval() * (self.max_iterations + 1) + Duration::from_secs(60)
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue_name: "intelligence:events".to_string(),
            max_concurrent: 100,
            receive_timeout_secs: 5,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            snapshot_key_prefix: "dogex:intelligence:latest_token_cache:intelligence_id:".to_string(),
            snapshot_ttl_hours: 96,
            hot_data_key: "dogex:coin:hot_data:all".to_string(),
            hot_data_ttl_hours: None,
            lease_key_prefix: "dogex:intelligence:detection_lease:".to_string(),
            cas_max_attempts: 8,
        }
    }
}

impl CacheSettings {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_hours * 3600)
    }

    pub fn hot_data_ttl(&self) -> Option<Duration> {
        self.hot_data_ttl_hours.map(|h| Duration::from_secs(h * 3600))
    }
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            market_data: MarketDataSettings::default(),
            ranking: RankingSettings::default(),
            detection: DetectionSettings::default(),
            consumer: ConsumerSettings::default(),
            cache: CacheSettings::default(),
            projection: ProjectionSettings {
                database_url: None,
                max_connections: 5,
            },
            admin: AdminSettings::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable value for {}: {}", name, raw);
            None
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &str) -> Result<Self, PipelineError> {
        info!("Loading configuration from: {}", path);
        let content = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("cannot read {}: {}", path, e)))?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), PipelineError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .map_err(|e| PipelineError::Config(format!("cannot write {}: {}", path, e)))?;
        info!("Configuration saved to: {}", path);
        Ok(())
    }

    /// Defaults (or `CONFIG_PATH` if set), overridden by environment variables.
    pub fn load() -> Result<Self, PipelineError> {
        let base = match env::var("CONFIG_PATH") {
            Ok(path) => Self::load_from_file(&path)?,
            Err(_) => Self::default(),
        };
        let config = base.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_env() -> Self {
        Self::default().apply_env()
    }

    fn apply_env(mut self) -> Self {
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(url) = env::var("MARKET_DATA_BASE_URL") {
            self.market_data.base_url = url;
        }
        if let Ok(chains) = env::var("SUPPORTED_CHAINS") {
            self.market_data.supported_chains = chains
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Ok(url) = env::var("RANKING_BASE_URL") {
            self.ranking.base_url = url;
        }
        if let Some(fallback) = env_parse::<bool>("RANKING_LOCAL_FALLBACK") {
            self.ranking.local_fallback = fallback;
        }
        if let Some(retries) = env_parse::<u32>("HTTP_MAX_RETRIES") {
            self.market_data.retry.max_retries = retries;
            self.ranking.retry.max_retries = retries;
        }
        if let Some(secs) = env_parse::<u64>("HTTP_TIMEOUT_SECS") {
            self.market_data.retry.request_timeout_secs = secs;
            self.ranking.retry.request_timeout_secs = secs;
        }
        if let Some(interval) = env_parse::<u64>("DETECTION_INTERVAL_SECS") {
            self.detection.interval_secs = interval;
        }
        if let Some(max) = env_parse::<u32>("DETECTION_MAX_ITERATIONS") {
            self.detection.max_iterations = max;
        }
        if let Ok(mode) = env::var("DETECTION_MODE") {
            match mode.trim().to_lowercase().as_str() {
                "inline" => self.detection.mode = DetectionMode::Inline,
                "deferred" => self.detection.mode = DetectionMode::Deferred,
                other => warn!("Unknown DETECTION_MODE {}, keeping {:?}", other, self.detection.mode),
            }
        }
        if let Ok(queue) = env::var("INTELLIGENCE_QUEUE") {
            self.consumer.queue_name = queue;
        }
        if let Some(max) = env_parse::<usize>("MAX_CONCURRENT") {
            self.consumer.max_concurrent = max;
        }
        if let Some(hours) = env_parse::<u64>("SNAPSHOT_TTL_HOURS") {
            self.cache.snapshot_ttl_hours = hours;
        }
        if let Some(hours) = env_parse::<u64>("HOT_DATA_TTL_HOURS") {
            self.cache.hot_data_ttl_hours = if hours == 0 { None } else { Some(hours) };
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                self.projection.database_url = Some(url);
            }
        }
        if let Some(enabled) = env_parse::<bool>("ADMIN_ENABLED") {
            self.admin.enabled = enabled;
        }
        if let Ok(addr) = env::var("ADMIN_ADDR") {
            self.admin.bind_addr = addr;
        }
        self
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut errors = Vec::new();

        if self.detection.interval_secs == 0 {
            errors.push("detection interval must be positive".to_string());
        }
        if self.detection.max_iterations == 0 {
            errors.push("detection max iterations must be positive".to_string());
        }
        if self.detection.top_n == 0 {
            errors.push("top_n must be positive".to_string());
        }
        if self.consumer.max_concurrent == 0 {
            errors.push("max concurrent workers must be positive".to_string());
        }
        if self.cache.snapshot_ttl_hours == 0 {
            errors.push("snapshot TTL must be positive".to_string());
        }
        if self.cache.cas_max_attempts == 0 {
            errors.push("CAS attempts must be positive".to_string());
        }
        if self.market_data.supported_chains.is_empty() {
            errors.push("at least one supported chain is required".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(errors.join("; ")))
        }
    }
}
