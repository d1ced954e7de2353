use crate::*;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

// ============================================================
// Shared response helpers
// ============================================================

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!("Request failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg.into()})))
}

fn not_found(msg: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({"error": msg.into()})))
}

// ============================================================
// Health
// ============================================================

pub async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ============================================================
// Detection control
// ============================================================

pub async fn trigger_full_detection(
    State(state): State<AppState>,
    body: Option<Json<models::TriggerFullRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match state.detection.trigger_full(request.sync_first).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => internal_error(e),
    }
}

pub async fn trigger_channel_detection(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    body: Option<Json<models::TriggerChannelRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match state
        .detection
        .trigger_channel(&channel_id, request.model_ids)
        .await
    {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) if e.to_string().contains("not found") => not_found(e.to_string()),
        Err(e) => internal_error(e),
    }
}

pub async fn trigger_model_detection(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> impl IntoResponse {
    match state.detection.trigger_model(&model_id).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) if e.to_string().contains("not found") => not_found(e.to_string()),
        Err(e) => internal_error(e),
    }
}

pub async fn trigger_selective_detection(
    State(state): State<AppState>,
    body: Option<Json<models::TriggerSelectiveRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match state
        .detection
        .trigger_selective(request.channel_ids, request.model_ids_by_channel)
        .await
    {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => internal_error(e),
    }
}

pub async fn stop_detection(State(state): State<AppState>) -> impl IntoResponse {
    match state.detection.stop_detection().await {
        Ok(cleared) => (StatusCode::OK, Json(json!({"cleared": cleared}))),
        Err(e) => internal_error(e),
    }
}

pub async fn get_detection_progress(State(state): State<AppState>) -> impl IntoResponse {
    match state.detection.progress_snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))),
        Err(e) => internal_error(e),
    }
}

// ============================================================
// Progress stream (SSE)
// ============================================================

/// `type:"connected"` on open, `type:"progress"` per probe, and a
/// `type:"heartbeat"` every 30 seconds to keep intermediaries from
/// closing an idle stream.
pub async fn detection_stream(State(state): State<AppState>) -> impl IntoResponse {
    let mut progress_rx = state.progress.subscribe();
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        let connected = Event::default().data(json!({"type": "connected"}).to_string());
        if tx.send(Ok(connected)).await.is_err() {
            return;
        }

        let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(30));
        heartbeat.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                event = progress_rx.recv() => match event {
                    Ok(event) => {
                        let mut payload = match serde_json::to_value(&event) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        payload["type"] = json!("progress");
                        if tx.send(Ok(Event::default().data(payload.to_string()))).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("SSE subscriber lagged, skipped {} events", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = heartbeat.tick() => {
                    let beat = Event::default().data(json!({"type": "heartbeat"}).to_string());
                    if tx.send(Ok(beat)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx))
}

// ============================================================
// Scheduler control
// ============================================================

pub async fn scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!(state.scheduler.status().await))
}

pub async fn scheduler_start(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.start_all().await {
        Ok(()) => (StatusCode::OK, Json(json!({"started": true}))),
        Err(e) => bad_request(e.to_string()),
    }
}

pub async fn scheduler_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.stop_all().await;
    Json(json!({"stopped": true}))
}

pub async fn scheduler_cleanup_now(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.cleanup_now().await {
        Ok(deleted) => (StatusCode::OK, Json(json!({"deleted": deleted}))),
        Err(e) => internal_error(e),
    }
}

pub async fn get_scheduler_config(State(state): State<AppState>) -> impl IntoResponse {
    match db::load_scheduler_config(&state.db).await {
        Ok(config) => (StatusCode::OK, Json(json!(config))),
        Err(e) => internal_error(e),
    }
}

pub async fn update_scheduler_config(
    State(state): State<AppState>,
    Json(config): Json<models::SchedulerConfig>,
) -> impl IntoResponse {
    // An expression that never parses would wedge the detection loop
    if let Err(e) = scheduler::next_fire(&config.cron_expression, &config.timezone) {
        return bad_request(e.to_string());
    }
    let config = config.normalized();
    match db::upsert_scheduler_config(&state.db, &config).await {
        Ok(()) => {
            state.worker_config.reload().await;
            (StatusCode::OK, Json(json!(config)))
        }
        Err(e) => internal_error(e),
    }
}

// ============================================================
// Dashboard data
// ============================================================

pub async fn list_channels(State(state): State<AppState>) -> impl IntoResponse {
    match db::list_channels(&state.db, true).await {
        Ok(channels) => (StatusCode::OK, Json(json!({"channels": channels}))),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    limit: Option<i64>,
}

pub async fn get_model_logs(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match db::list_check_logs(&state.db, &model_id, limit).await {
        Ok(logs) => (StatusCode::OK, Json(json!({"logs": logs}))),
        Err(e) => internal_error(e),
    }
}

// ============================================================
// Channel management
// ============================================================

pub async fn create_channel(
    State(state): State<AppState>,
    Json(request): Json<models::CreateChannelRequest>,
) -> impl IntoResponse {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return bad_request("channel name must not be empty");
    }
    if request.api_key.is_empty() {
        return bad_request("primary api key must not be empty");
    }
    let base_url = probes::normalize_base_url(request.base_url.trim()).to_string();
    if !models::is_valid_base_url(&base_url) {
        return bad_request("base url must be http(s) without a trailing slash");
    }

    let now = chrono::Utc::now();
    let channel_id = format!("ch_{}", uuid::Uuid::new_v4());
    let keys: Vec<models::ChannelKey> = request
        .additional_keys
        .iter()
        .filter(|k| !k.is_empty())
        .map(|api_key| models::ChannelKey {
            id: format!("key_{}", uuid::Uuid::new_v4()),
            channel_id: channel_id.clone(),
            api_key: api_key.clone(),
            last_valid: None,
            last_checked_at: None,
            created_at: now,
        })
        .collect();

    let channel = models::Channel {
        id: channel_id.clone(),
        name,
        base_url,
        api_key: request.api_key,
        key_mode: if keys.is_empty() {
            models::KeyMode::Single
        } else {
            models::KeyMode::Multi
        },
        proxy_url: request.proxy_url.filter(|p| !p.is_empty()),
        enabled: request.enabled,
        sort_order: request.sort_order,
        created_at: now,
        updated_at: now,
        keys,
        models: Vec::new(),
    };

    if let Err(e) = db::create_channel(&state.db, &channel).await {
        return internal_error(e);
    }
    if !request.models.is_empty() {
        if let Err(e) = db::replace_or_add_models(&state.db, &channel_id, &request.models).await {
            return internal_error(e);
        }
    }

    match db::get_channel(&state.db, &channel_id).await {
        Ok(Some(created)) => (StatusCode::CREATED, Json(json!(created))),
        Ok(None) => internal_error("channel vanished after create"),
        Err(e) => internal_error(e),
    }
}

pub async fn update_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Json(mut request): Json<models::UpdateChannelRequest>,
) -> impl IntoResponse {
    if let Some(base_url) = &request.base_url {
        let normalized = probes::normalize_base_url(base_url.trim()).to_string();
        if !models::is_valid_base_url(&normalized) {
            return bad_request("base url must be http(s) without a trailing slash");
        }
        request.base_url = Some(normalized);
    }
    if let Some(api_key) = &request.api_key {
        if api_key.is_empty() {
            return bad_request("primary api key must not be empty");
        }
    }

    match db::get_channel(&state.db, &channel_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("channel not found"),
        Err(e) => return internal_error(e),
    }

    if let Err(e) = db::update_channel(&state.db, &channel_id, &request).await {
        return internal_error(e);
    }
    match db::get_channel(&state.db, &channel_id).await {
        Ok(Some(updated)) => (StatusCode::OK, Json(json!(updated))),
        Ok(None) => not_found("channel not found"),
        Err(e) => internal_error(e),
    }
}

pub async fn delete_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    match db::delete_channel(&state.db, &channel_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"deleted": true}))),
        Err(e) => internal_error(e),
    }
}

pub async fn delete_channel_key(
    State(state): State<AppState>,
    Path((_channel_id, key_id)): Path<(String, String)>,
) -> impl IntoResponse {
    match db::delete_channel_key(&state.db, &key_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"deleted": true}))),
        Err(e) => internal_error(e),
    }
}

/// Manual catalog sync for one channel.
pub async fn sync_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> impl IntoResponse {
    let channel = match db::get_channel(&state.db, &channel_id).await {
        Ok(Some(channel)) => channel,
        Ok(None) => return not_found("channel not found"),
        Err(e) => return internal_error(e),
    };
    let result = sync::sync_channel(&state.db, &channel).await;
    (StatusCode::OK, Json(json!(result)))
}
