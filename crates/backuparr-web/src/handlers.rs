use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use backuparr_core::config::{find_app, find_backend_config, AppConfig, StorageConfig};
use backuparr_core::retention::{classify, RetentionPolicy};
use backuparr_core::storage::backends_from_config;
use backuparr_core::cancel::CancelToken;

use crate::job::JobRequest;
use crate::state::WebState;

/// WebSocket snapshot/ping cadence.
const WS_TICK: Duration = Duration::from_secs(1);
/// Idle cutoff; any inbound frame (pongs included) extends it.
const WS_READ_DEADLINE: Duration = Duration::from_secs(120);

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/apps", get(list_apps))
        .route("/api/backups", get(list_backups).delete(delete_backup))
        .route("/api/backup", post(trigger_backup).get(get_job))
        .route("/api/backup/ws", get(backup_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppOption {
    name: String,
    app_type: String,
    backends: Vec<String>,
    retention: RetentionPolicy,
}

async fn list_apps(State(state): State<WebState>) -> Response {
    let mut apps: Vec<AppOption> = state
        .inner
        .config
        .app_configs
        .iter()
        .map(|app| {
            let mut backends: Vec<String> = app
                .storage
                .iter()
                .map(|s| s.effective_name().to_string())
                .collect();
            backends.sort();
            backends.dedup();
            AppOption {
                name: app.effective_name().to_string(),
                app_type: app.app_type.clone(),
                backends,
                retention: app.retention,
            }
        })
        .collect();
    apps.sort_by(|a, b| a.name.cmp(&b.name));

    Json(serde_json::json!({"apps": apps})).into_response()
}

#[derive(Deserialize)]
struct BackupsQuery {
    #[serde(default)]
    app: String,
    #[serde(default)]
    backend: String,
    #[serde(default)]
    key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupEntry {
    key: String,
    app_name: String,
    file_name: String,
    size: u64,
    created_at: DateTime<Utc>,
    retention_buckets: Vec<String>,
}

/// Resolve `(app config, backend config)` from query params, cloned so the
/// blocking task can own them.
fn resolve_target(
    state: &WebState,
    query: &BackupsQuery,
) -> Result<(AppConfig, StorageConfig), Response> {
    if query.app.is_empty() || query.backend.is_empty() {
        return Err(error_json(
            StatusCode::BAD_REQUEST,
            "query params app and backend are required",
        ));
    }
    let app = find_app(&state.inner.config, &query.app)
        .map_err(|e| error_json(StatusCode::NOT_FOUND, &e.to_string()))?;
    let backend = find_backend_config(app, &query.backend)
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, &e.to_string()))?;
    Ok((app.clone(), backend.clone()))
}

async fn list_backups(
    State(state): State<WebState>,
    Query(query): Query<BackupsQuery>,
) -> Response {
    let (app, backend_cfg) = match resolve_target(&state, &query) {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };
    let app_name = query.app.clone();

    let listed = tokio::task::spawn_blocking(move || {
        let backends = backends_from_config(std::slice::from_ref(&backend_cfg), &CancelToken::new())?;
        backends[0].list(&app_name)
    })
    .await;

    let backups = match listed {
        Ok(Ok(backups)) => backups,
        Ok(Err(e)) => {
            tracing::error!("listing backups failed: {e}");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to list backups");
        }
        Err(e) => {
            tracing::error!("listing task panicked: {e}");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to list backups");
        }
    };

    let buckets = classify(&backups, &app.retention);
    let enriched: Vec<BackupEntry> = backups
        .into_iter()
        .map(|b| {
            let retention_buckets = buckets.get(&b.key).cloned().unwrap_or_default();
            BackupEntry {
                key: b.key,
                app_name: b.app_name,
                file_name: b.file_name,
                size: b.size,
                created_at: b.created_at,
                retention_buckets,
            }
        })
        .collect();

    Json(serde_json::json!({"backups": enriched})).into_response()
}

async fn delete_backup(
    State(state): State<WebState>,
    Query(query): Query<BackupsQuery>,
) -> Response {
    let (_, backend_cfg) = match resolve_target(&state, &query) {
        Ok(resolved) => resolved,
        Err(response) => return response,
    };
    if query.key.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "query param key is required");
    }
    let key = query.key.clone();

    let deleted = tokio::task::spawn_blocking(move || {
        let backends = backends_from_config(std::slice::from_ref(&backend_cfg), &CancelToken::new())?;
        backends[0].delete(&key)
    })
    .await;

    match deleted {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => {
            tracing::error!("deleting backup failed: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete backup")
        }
        Err(e) => {
            tracing::error!("delete task panicked: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete backup")
        }
    }
}

async fn trigger_backup(
    State(state): State<WebState>,
    body: Option<Json<JobRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    if !request.all {
        let Some(app) = request.app.as_deref().filter(|a| !a.is_empty()) else {
            return error_json(StatusCode::BAD_REQUEST, "set all=true or provide app");
        };
        if find_app(&state.inner.config, app).is_err() {
            return error_json(StatusCode::NOT_FOUND, "app not found");
        }
    }

    let snapshot = state.start_job(request);
    (StatusCode::ACCEPTED, Json(snapshot)).into_response()
}

#[derive(Deserialize)]
struct JobQuery {
    #[serde(default)]
    id: String,
}

async fn get_job(State(state): State<WebState>, Query(query): Query<JobQuery>) -> Response {
    if query.id.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "query param id is required");
    }
    match state.snapshot(&query.id) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_json(StatusCode::NOT_FOUND, "job not found"),
    }
}

async fn backup_ws(
    State(state): State<WebState>,
    Query(query): Query<JobQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if query.id.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "query param id is required");
    }
    if state.snapshot(&query.id).is_none() {
        return error_json(StatusCode::NOT_FOUND, "job not found");
    }
    let id = query.id;
    ws.on_upgrade(move |socket| stream_job(socket, state, id))
}

/// Stream job snapshots until the job completes or the peer goes silent.
/// Dropping the socket never affects the job; clients recover by polling.
async fn stream_job(socket: WebSocket, state: WebState, id: String) {
    let (mut sender, mut receiver) = socket.split();

    // Reader side: any inbound frame counts as liveness. Close/read errors
    // end the stream via the deadline check.
    let last_seen = std::sync::Arc::new(std::sync::Mutex::new(Instant::now()));
    let reader_seen = last_seen.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(_frame)) = receiver.next().await {
            if let Ok(mut seen) = reader_seen.lock() {
                *seen = Instant::now();
            }
        }
    });

    // Immediate snapshot on connect; a finished job gets its final state and
    // the socket closes right away.
    let mut running = send_snapshot(&mut sender, &state, &id).await;

    let mut ticker = tokio::time::interval(WS_TICK);
    ticker.tick().await; // the first tick completes immediately

    while running {
        ticker.tick().await;

        let silent = last_seen
            .lock()
            .map(|seen| seen.elapsed() > WS_READ_DEADLINE)
            .unwrap_or(true);
        if silent {
            break;
        }

        if sender.send(Message::Ping(Vec::new())).await.is_err() {
            break;
        }
        running = send_snapshot(&mut sender, &state, &id).await;
    }

    let _ = sender.close().await;
    reader.abort();
}

/// Send the current snapshot; returns whether the job is still running and
/// the socket still usable.
async fn send_snapshot(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    state: &WebState,
    id: &str,
) -> bool {
    let Some(snapshot) = state.snapshot(id) else {
        let _ = sender
            .send(Message::Text(r#"{"error": "job not found"}"#.to_string()))
            .await;
        return false;
    };
    let Ok(payload) = serde_json::to_string(&snapshot) else {
        return false;
    };
    if sender.send(Message::Text(payload)).await.is_err() {
        return false;
    }
    snapshot.running
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use backuparr_core::config::{BackuparrConfig, Connection};

    use super::*;
    use crate::capture::CaptureSink;

    fn sample_state() -> WebState {
        let config = BackuparrConfig {
            app_configs: vec![AppConfig {
                app_type: "sonarr".into(),
                connection: Connection {
                    url: "http://sonarr:8989".into(),
                    api_key: "key".into(),
                    ..Default::default()
                },
                retention: RetentionPolicy {
                    keep_last: 2,
                    keep_daily: 7,
                    ..Default::default()
                },
                storage: vec![
                    StorageConfig {
                        kind: "local".into(),
                        path: "/backups".into(),
                        ..Default::default()
                    },
                    StorageConfig {
                        kind: "local".into(),
                        name: "nas".into(),
                        path: "/nas".into(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
        };
        WebState::new(config, CaptureSink::new())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn apps_endpoint_lists_apps_with_backends_and_retention() {
        let app = router(sample_state());
        let response = app
            .oneshot(Request::get("/api/apps").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let apps = json["apps"].as_array().unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0]["name"], "sonarr");
        assert_eq!(apps[0]["appType"], "sonarr");
        assert_eq!(apps[0]["backends"], serde_json::json!(["local", "nas"]));
        assert_eq!(apps[0]["retention"]["keepLast"], 2);
        assert_eq!(apps[0]["retention"]["keepDaily"], 7);
    }

    #[tokio::test]
    async fn trigger_backup_validates_target() {
        let app = router(sample_state());

        // Neither all nor app.
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/backup")
                    .header("Content-Type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Unknown app.
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/backup")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"app": "nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_backup_returns_job_snapshot() {
        let state = WebState::new(BackuparrConfig::default(), CaptureSink::new());
        let app = router(state.clone());

        let response = app
            .oneshot(
                Request::post("/api/backup")
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"all": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let json = body_json(response).await;
        let id = json["jobId"].as_str().unwrap().to_string();
        assert!(!id.is_empty());
        assert_eq!(json["status"], "running");

        // The job is pollable through the same state.
        assert!(state.snapshot(&id).is_some());
    }

    #[tokio::test]
    async fn get_job_requires_id_and_finds_jobs() {
        let state = WebState::new(BackuparrConfig::default(), CaptureSink::new());
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/api/backup").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/backup?id=12345")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let snapshot = state.start_job(JobRequest {
            all: true,
            ..Default::default()
        });
        let response = app
            .oneshot(
                Request::get(format!("/api/backup?id={}", snapshot.job_id).as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["jobId"], snapshot.job_id.as_str());
    }

    #[tokio::test]
    async fn backups_endpoint_requires_app_and_backend() {
        let app = router(sample_state());
        let response = app
            .oneshot(Request::get("/api/backups").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn backups_endpoint_rejects_unknown_app_or_backend() {
        let app = router(sample_state());

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/backups?app=nope&backend=local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::get("/api/backups?app=sonarr&backend=offsite")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_requires_key() {
        let app = router(sample_state());
        let response = app
            .oneshot(
                Request::delete("/api/backups?app=sonarr&backend=nas")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
