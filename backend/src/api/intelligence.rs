use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::cache::{HotDataLedger, TokenSnapshotStore};
use crate::intake::{decode_event, WorkQueue};
use crate::types::{CachedToken, HotDataEntry};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        })
    }
}

fn failure<T>(status: StatusCode, message: String) -> (StatusCode, Json<ApiResponse<T>>) {
    (
        status,
        Json(ApiResponse {
            code: status.as_u16() as i32,
            message,
            data: None,
        }),
    )
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<T>>)>;

#[derive(Debug, Serialize, Deserialize)]
pub struct EventTokensResponse {
    pub event_id: String,
    pub tokens: Vec<CachedToken>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HotDataResponse {
    pub total: usize,
    pub entries: Vec<HotDataEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub event_id: String,
    pub candidate_names: Vec<String>,
}

pub struct AdminApiState {
    pub snapshots: TokenSnapshotStore,
    pub ledger: HotDataLedger,
    pub queue: Arc<dyn WorkQueue>,
}

impl AdminApiState {
    pub fn new(snapshots: TokenSnapshotStore, ledger: HotDataLedger, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            snapshots,
            ledger,
            queue,
        }
    }
}

pub fn create_intelligence_routes() -> Router<Arc<AdminApiState>> {
    Router::new()
        .route("/intelligence/:id/tokens", get(get_event_tokens))
        .route("/hot-data", get(get_hot_data))
        .route("/hot-data/:unique_key", delete(remove_hot_data))
        .route("/events", post(publish_event))
}

async fn get_event_tokens(
    State(state): State<Arc<AdminApiState>>,
    Path(event_id): Path<String>,
) -> ApiResult<EventTokensResponse> {
    let tokens = state.snapshots.load(&event_id).await.map_err(|e| {
        error!(event_id = %event_id, error = %e, "Failed to load snapshot");
        failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;
    let ttl_seconds = state
        .snapshots
        .remaining_ttl(&event_id)
        .await
        .ok()
        .flatten()
        .map(|ttl| ttl.as_secs());

    Ok(ApiResponse::ok(EventTokensResponse {
        event_id,
        tokens,
        ttl_seconds,
    }))
}

async fn get_hot_data(State(state): State<Arc<AdminApiState>>) -> ApiResult<HotDataResponse> {
    let entries = state.ledger.read().await.map_err(|e| {
        error!(error = %e, "Failed to read hot data ledger");
        failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;
    Ok(ApiResponse::ok(HotDataResponse {
        total: entries.len(),
        entries,
    }))
}

async fn remove_hot_data(
    State(state): State<Arc<AdminApiState>>,
    Path(unique_key): Path<String>,
) -> ApiResult<bool> {
    match state.ledger.remove(&unique_key).await {
        Ok(true) => {
            info!(unique_key = %unique_key, "Hot data entry removed via admin API");
            Ok(ApiResponse::ok(true))
        }
        Ok(false) => Err(failure(StatusCode::NOT_FOUND, format!("{} not in ledger", unique_key))),
        Err(e) => Err(failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
    }
}

async fn publish_event(
    State(state): State<Arc<AdminApiState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<PublishResponse>>), (StatusCode, Json<ApiResponse<PublishResponse>>)> {
    let event = decode_event(&body).map_err(|e| failure(StatusCode::BAD_REQUEST, e.to_string()))?;
    let payload = String::from_utf8(body.to_vec())
        .map_err(|e| failure(StatusCode::BAD_REQUEST, e.to_string()))?;

    state.queue.publish(&payload).await.map_err(|e| {
        error!(event_id = %event.event_id, error = %e, "Failed to publish event");
        failure(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    info!(event_id = %event.event_id, "Event published via admin API");
    Ok((
        StatusCode::ACCEPTED,
        ApiResponse::ok(PublishResponse {
            event_id: event.event_id,
            candidate_names: event.candidate_names,
        }),
    ))
}
