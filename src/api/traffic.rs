use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::AppState;

use super::AuthUser;

#[derive(Debug, Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    25
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Query(query): Query<TrafficQuery>,
) -> ApiResult<Json<Value>> {
    let (entries, total) = state.firewall.list_traffic(query.limit, query.offset).await?;
    Ok(Json(json!({
        "entries": entries,
        "total": total,
        "limit": query.limit,
        "offset": query.offset,
    })))
}
