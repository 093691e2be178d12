use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ProjectionSettings;
use crate::error::PipelineResult;
use crate::types::{CachedToken, ShowedToken};

/// Downstream copy of the tokens an event currently shows.
#[async_trait]
pub trait ShowedTokensProjection: Send + Sync {
    async fn sync(&self, event_id: &str, tokens: &[ShowedToken]) -> PipelineResult<()>;
}

pub fn showed_tokens(tokens: &[CachedToken]) -> Vec<ShowedToken> {
    tokens.iter().map(ShowedToken::from).collect()
}

/// Writes `intelligences.showed_tokens`.
pub struct PgShowedTokensProjection {
    pool: PgPool,
}

impl PgShowedTokensProjection {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(settings: &ProjectionSettings, database_url: &str) -> PipelineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .connect(database_url)
            .await?;
        info!("Connected showed-tokens projection to Postgres");
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl ShowedTokensProjection for PgShowedTokensProjection {
    async fn sync(&self, event_id: &str, tokens: &[ShowedToken]) -> PipelineResult<()> {
        let payload = serde_json::to_string(tokens)?;
        let result = sqlx::query(
            r#"
            UPDATE intelligences
            SET showed_tokens = $1::jsonb, updated_at = NOW()
            WHERE id::text = $2
            "#,
        )
        .bind(payload)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        debug!(event_id, rows = result.rows_affected(), "Synced showed tokens");
        Ok(())
    }
}

/// Used when no database is configured.
#[derive(Debug, Default)]
pub struct NoopProjection;

#[async_trait]
impl ShowedTokensProjection for NoopProjection {
    async fn sync(&self, _event_id: &str, _tokens: &[ShowedToken]) -> PipelineResult<()> {
        Ok(())
    }
}

/// Keeps every sync in memory; handy for inspecting what would be written.
#[derive(Debug, Default)]
pub struct RecordingProjection {
    synced: RwLock<Vec<(String, Vec<ShowedToken>)>>,
}

impl RecordingProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn synced(&self) -> Vec<(String, Vec<ShowedToken>)> {
        self.synced.read().await.clone()
    }
}

#[async_trait]
impl ShowedTokensProjection for RecordingProjection {
    async fn sync(&self, event_id: &str, tokens: &[ShowedToken]) -> PipelineResult<()> {
        self.synced.write().await.push((event_id.to_string(), tokens.to_vec()));
        Ok(())
    }
}
