use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::firewall::store::{BulkRequest, CreateEntry, EntryFilter};
use crate::AppState;

use super::{AuthUser, RequestMeta};

pub async fn status(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<Value>> {
    let summary = state.firewall.status().await?;
    Ok(Json(json!(summary)))
}

pub async fn list_entries(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Query(filter): Query<EntryFilter>,
) -> ApiResult<Json<Value>> {
    let limit = filter.limit.unwrap_or(25);
    let offset = filter.offset.unwrap_or(0);
    let (entries, total) = state.firewall.list_entries(&filter).await?;
    Ok(Json(json!({
        "entries": entries,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

pub async fn create_entry(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    meta: RequestMeta,
    Json(payload): Json<CreateEntry>,
) -> ApiResult<Json<Value>> {
    let entry = state.firewall.create_entry(payload, meta.ip).await?;
    Ok(Json(json!({ "status": "created", "entry": entry })))
}

pub async fn bulk(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    meta: RequestMeta,
    Json(payload): Json<BulkRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state.firewall.bulk(payload, meta.ip).await?;
    Ok(Json(json!({
        "status": "ok",
        "affected": outcome.affected,
        "created": outcome.created,
    })))
}

pub async fn delete_entry(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.firewall.delete_entry(id).await?;
    Ok(Json(json!({ "status": "deleted", "id": id })))
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: Option<bool>,
    pub direction: Option<String>,
}

pub async fn toggle_entry(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<ToggleRequest>,
) -> ApiResult<Json<Value>> {
    let entry = state
        .firewall
        .toggle_entry(id, payload.enabled, payload.direction)
        .await?;
    Ok(Json(json!({ "status": "updated", "entry": entry })))
}

pub async fn delete_by_source(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Path(source): Path<String>,
) -> ApiResult<Json<Value>> {
    let deleted = state.firewall.delete_by_source(&source).await?;
    Ok(Json(json!({ "status": "deleted", "deleted": deleted })))
}

/// Force a synchronous recompile, bypassing the debounce.
pub async fn apply(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<Value>> {
    state.firewall.apply_rules().await?;
    Ok(Json(json!({ "status": "applied" })))
}

pub async fn get_ssh_port(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<Value>> {
    let port = state.firewall.ssh_port().await?;
    Ok(Json(json!({ "port": port })))
}

#[derive(Debug, Deserialize)]
pub struct SshPortRequest {
    pub port: u16,
}

pub async fn set_ssh_port(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Json(payload): Json<SshPortRequest>,
) -> ApiResult<Json<Value>> {
    if payload.port == 0 {
        return Err(crate::error::ApiError::Validation(
            "invalid port: 0".to_string(),
        ));
    }
    state.firewall.set_ssh_port(payload.port).await?;
    Ok(Json(json!({ "status": "updated", "port": payload.port })))
}
