use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::firewall::blocklist;
use crate::AppState;

use super::AuthUser;

/// The curated catalog plus how many entries each source has contributed.
pub async fn list(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<Value>> {
    let mut sources = Vec::new();
    for source in blocklist::catalog() {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM firewall_entries WHERE source = ?")
                .bind(source.id)
                .fetch_one(&state.db)
                .await?;
        sources.push(json!({
            "id": source.id,
            "name": source.name,
            "description": source.description,
            "url": source.url,
            "entryCount": count,
        }));
    }
    Ok(Json(json!({ "sources": sources })))
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub source: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "minScore")]
    pub min_score: Option<u32>,
}

pub async fn import(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Json(payload): Json<ImportRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .firewall
        .import_blocklist(
            payload.source.as_deref(),
            payload.url.as_deref(),
            payload.min_score,
        )
        .await?;
    Ok(Json(json!(outcome)))
}
