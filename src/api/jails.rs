use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::firewall::jail::{JailCreate, JailUpdate};
use crate::models::Jail;
use crate::AppState;

use super::AuthUser;

pub async fn list(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<Vec<Jail>>> {
    Ok(Json(state.firewall.list_jails().await?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Json(payload): Json<JailCreate>,
) -> ApiResult<Json<Value>> {
    let jail = state.firewall.create_jail(payload).await?;
    Ok(Json(json!({ "status": "created", "jail": jail })))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Path(name): Path<String>,
) -> ApiResult<Json<Jail>> {
    Ok(Json(state.firewall.get_jail(&name).await?))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Path(name): Path<String>,
    Json(payload): Json<JailUpdate>,
) -> ApiResult<Json<Value>> {
    let jail = state.firewall.update_jail(&name, payload).await?;
    Ok(Json(json!({ "status": "updated", "jail": jail })))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    state.firewall.delete_jail(&name).await?;
    Ok(Json(json!({ "status": "deleted", "name": name })))
}
