use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use common::{Band, ChunkData, ChunkKey, ErrorMode, IndexItem, MetaFields, StorageLevel, codec};
use serde::Deserialize;
use tracing::debug;

use super::{ReadRequest, STORAGE_ROUTE};
use crate::cache::{LocationCache, StorageApiCache};
use crate::error::StorageError;
use crate::meta::MetaService;

pub struct TunnelState {
    pub meta: Arc<MetaService>,
    pub storage: Arc<StorageApiCache>,
    pub locations: LocationCache,
}

pub fn create_router(state: Arc<TunnelState>) -> Router {
    Router::new()
        .route(
            STORAGE_ROUTE,
            get(get_data).post(get_data_by_conditions).put(put_data),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct LevelQuery {
    pub level: Option<String>,
}

/// GET /api/session/{session_id}/storage/{data_key}
pub async fn get_data(
    State(state): State<Arc<TunnelState>>,
    Path((session_id, data_key)): Path<(String, String)>,
) -> Result<Response, StorageError> {
    let value = read_through(&state, &session_id, &ChunkKey::from(data_key), None).await?;
    encoded(&value)
}

/// POST /api/session/{session_id}/storage/{data_key}
pub async fn get_data_by_conditions(
    State(state): State<Arc<TunnelState>>,
    Path((session_id, data_key)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, StorageError> {
    let request: ReadRequest = if body.is_empty() {
        ReadRequest::default()
    } else {
        codec::deserialize(&body)?
    };
    let value = read_through(
        &state,
        &session_id,
        &ChunkKey::from(data_key),
        request.conditions.as_deref(),
    )
    .await?;
    encoded(&value)
}

/// PUT /api/session/{session_id}/storage/{data_key}?level=
pub async fn put_data(
    State(state): State<Arc<TunnelState>>,
    Path((session_id, data_key)): Path<(String, String)>,
    Query(query): Query<LevelQuery>,
    body: Bytes,
) -> Result<Response, StorageError> {
    let level = match query.level.as_deref() {
        Some(level) => level
            .parse::<StorageLevel>()
            .map_err(|_| StorageError::InvalidLevel(level.to_string()))?,
        None => StorageLevel::Memory,
    };
    let value: ChunkData = codec::deserialize(&body)?;
    let key = ChunkKey::from(data_key);
    let band = resolve_band(&state, &session_id, &key).await?;
    let storage = state.storage.get(&session_id, &band.address).await?;
    let info = storage.put(&key, value, level).await?;
    encoded(&info)
}

fn encoded<T: serde::Serialize>(value: &T) -> Result<Response, StorageError> {
    let bytes = codec::serialize(value)?;
    Ok(([(header::CONTENT_TYPE, codec::CONTENT_TYPE)], bytes).into_response())
}

async fn resolve_band(
    state: &TunnelState,
    session_id: &str,
    key: &ChunkKey,
) -> Result<Band, StorageError> {
    if let Some(band) = state.locations.get(session_id, key).await {
        return Ok(band);
    }
    let meta_api = state.meta.api(session_id).await?;
    let band = meta_api
        .get_chunk_meta(key, MetaFields::BANDS, ErrorMode::Raise)
        .await?
        .and_then(|meta| meta.bands.into_iter().next())
        .ok_or_else(|| StorageError::NoBand(key.clone()))?;
    state.locations.insert(session_id, key, band.clone()).await;
    Ok(band)
}

async fn read_through(
    state: &TunnelState,
    session_id: &str,
    key: &ChunkKey,
    conditions: Option<&[IndexItem]>,
) -> Result<ChunkData, StorageError> {
    let was_cached = state.locations.get(session_id, key).await.is_some();
    let band = resolve_band(state, session_id, key).await?;
    let storage = state.storage.get(session_id, &band.address).await?;
    match storage.get(key, conditions).await {
        Err(e) if e.is_not_found() && was_cached => {
            debug!("Stale location of {} on {}, resolving again", key, band);
            state.locations.invalidate(session_id, key).await;
            let band = resolve_band(state, session_id, key).await?;
            let storage = state.storage.get(session_id, &band.address).await?;
            storage.get(key, conditions).await
        }
        other => other,
    }
}
