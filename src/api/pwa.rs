use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::models::PushSubscription;
use crate::push::SubscribeRequest;
use crate::AppState;

use super::{AuthUser, RequestMeta};

pub async fn vapid_key(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
) -> ApiResult<Json<Value>> {
    let key = state.notifier.public_key()?;
    Ok(Json(json!({ "publicKey": key })))
}

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    meta: RequestMeta,
    Json(payload): Json<SubscribeRequest>,
) -> ApiResult<Json<Value>> {
    let id = state
        .notifier
        .subscribe(user.id, payload, &meta.user_agent)
        .await?;
    Ok(Json(json!({ "status": "subscribed", "id": id })))
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<UnsubscribeRequest>,
) -> ApiResult<Json<Value>> {
    state.notifier.unsubscribe(user.id, &payload.endpoint).await?;
    Ok(Json(json!({ "status": "unsubscribed" })))
}

pub async fn subscriptions(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Vec<PushSubscription>>> {
    Ok(Json(state.notifier.get_user_subscriptions(user.id).await?))
}

pub async fn get_preferences(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Value>> {
    let prefs = state.notifier.preferences(user.id).await?;
    let map: serde_json::Map<String, Value> = prefs
        .into_iter()
        .map(|(k, v)| (k, Value::Bool(v)))
        .collect();
    Ok(Json(Value::Object(map)))
}

#[derive(Debug, Deserialize)]
pub struct PreferencesRequest {
    #[serde(flatten)]
    pub prefs: std::collections::BTreeMap<String, bool>,
}

pub async fn set_preferences(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<PreferencesRequest>,
) -> ApiResult<Json<Value>> {
    let prefs: Vec<(String, bool)> = payload.prefs.into_iter().collect();
    state.notifier.set_preferences(user.id, &prefs).await?;
    Ok(Json(json!({ "status": "updated" })))
}

/// Deliver a test notification to every device of the calling user.
pub async fn test_send(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Value>> {
    let recipients: Vec<PushSubscription> = state
        .notifier
        .get_user_subscriptions(user.id)
        .await?;
    let delivered = state
        .notifier
        .dispatch(
            recipients,
            json!({
                "type": "test",
                "title": "Test notification",
                "body": "Push notifications are working",
            }),
        )
        .await?;
    Ok(Json(json!({ "status": "sent", "delivered": delivered })))
}
