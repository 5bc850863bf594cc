//! Admin HTTP API
//!
//! Producers post change and full-scan signals here; they are appended to
//! the pipeline journal and acknowledged with their sequence number.

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, SubsecRound, Utc};
use runsync_common::{FileShot, Signal};
use runsync_pipeline::{PipelineJournal, PipelineStatus, pipeline_metrics};
use runsync_store::RunStore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

#[derive(Clone)]
pub struct AppState {
    pub journal: PipelineJournal,
    pub store: Arc<RunStore>,
    pub status: watch::Receiver<PipelineStatus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/v1/status", get(status_handler))
        .route("/v1/signals/change", post(change_handler))
        .route("/v1/signals/full", post(full_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub path: String,
    #[serde(default)]
    pub last_write_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SignalResponse {
    const fn accepted(seq: u64) -> Self {
        Self {
            accepted: true,
            seq: Some(seq),
            reason: None,
        }
    }

    fn ignored(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            seq: None,
            reason: Some(reason.into()),
        }
    }
}

/// Journal failures surface as 500s
pub struct AdminError(runsync_common::Error);

impl From<runsync_common::Error> for AdminError {
    fn from(e: runsync_common::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "Failed to enqueue signal");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Store-relative form of a signalled path; `None` if it lies outside the
/// store
fn store_path(store: &RunStore, path: &str) -> Option<String> {
    let normalized = path.replace('\\', "/");
    if Path::new(&normalized).is_absolute() {
        return store.relative_path(&normalized);
    }
    let relative = normalized.trim_start_matches("./");
    (!relative.is_empty()).then(|| relative.to_string())
}

async fn change_handler(
    State(state): State<AppState>,
    Json(request): Json<ChangeRequest>,
) -> Result<(StatusCode, Json<SignalResponse>), AdminError> {
    let Some(path) = store_path(&state.store, &request.path) else {
        debug!(path = %request.path, "Ignoring change outside the run store");
        return Ok((
            StatusCode::OK,
            Json(SignalResponse::ignored("path is outside the run store")),
        ));
    };
    let last_write_time = request
        .last_write_time
        .unwrap_or_else(|| Utc::now().trunc_subsecs(0));
    let seq = state
        .journal
        .enqueue(&Signal::Change(FileShot::new(path, last_write_time)))?;
    Ok((StatusCode::ACCEPTED, Json(SignalResponse::accepted(seq))))
}

async fn full_handler(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SignalResponse>), AdminError> {
    let seq = state.journal.enqueue(&Signal::Full)?;
    Ok((StatusCode::ACCEPTED, Json(SignalResponse::accepted(seq))))
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let status = state.status.borrow().clone();
    if status.started {
        Json(status).into_response()
    } else {
        Json(serde_json::json!({ "started": false })).into_response()
    }
}

/// Prometheus metrics endpoint handler
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        pipeline_metrics().export_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use runsync_store::{ExtensionFilter, LocalBackend, RunFileClassifier};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Harness {
        _store_dir: TempDir,
        _state_dir: TempDir,
        state: AppState,
        _status: watch::Sender<PipelineStatus>,
    }

    fn harness() -> Harness {
        let store_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        let store = RunStore::new(
            Arc::new(LocalBackend::new(store_dir.path()).unwrap()),
            RunFileClassifier::new(r"^(?<runId>[^/]+)/params\.json$").unwrap(),
            Arc::new(ExtensionFilter::new(["csv"])),
        );
        let journal = PipelineJournal::open(state_dir.path().join("journal.redb")).unwrap();
        let (status_tx, status) = watch::channel(PipelineStatus::default());
        Harness {
            _store_dir: store_dir,
            _state_dir: state_dir,
            state: AppState {
                journal,
                store: Arc::new(store),
                status,
            },
            _status: status_tx,
        }
    }

    async fn call(state: AppState, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_change_is_journaled() {
        let h = harness();
        let (status, body) = call(
            h.state.clone(),
            "POST",
            "/v1/signals/change",
            Some(r#"{"path":"run/a.csv","lastWriteTime":"2024-01-01T00:00:10Z"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.contains(r#""seq":1"#));

        let entry = h.state.journal.next_after(0).unwrap().unwrap();
        let Signal::Change(shot) = entry.decode().unwrap() else {
            panic!("expected a change signal");
        };
        assert_eq!(shot.path, "run/a.csv");
        assert_eq!(shot.last_write_time.to_rfc3339(), "2024-01-01T00:00:10+00:00");
    }

    #[tokio::test]
    async fn test_absolute_paths_are_made_relative() {
        let h = harness();
        let inside = format!("{}run/b.csv", h.state.store.absolute_base_path());
        let body = serde_json::json!({ "path": inside }).to_string();
        let (status, _) = call(h.state.clone(), "POST", "/v1/signals/change", Some(&body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let entry = h.state.journal.next_after(0).unwrap().unwrap();
        let Signal::Change(shot) = entry.decode().unwrap() else {
            panic!("expected a change signal");
        };
        assert_eq!(shot.path, "run/b.csv");
        assert_eq!(shot.last_write_time.timestamp_subsec_nanos(), 0);

        let (status, body) = call(
            h.state.clone(),
            "POST",
            "/v1/signals/change",
            Some(r#"{"path":"/somewhere/else/c.csv"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#""accepted":false"#));
        assert_eq!(h.state.journal.pending().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_scan_request() {
        let h = harness();
        let (status, _) = call(h.state.clone(), "POST", "/v1/signals/full", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let entry = h.state.journal.next_after(0).unwrap().unwrap();
        assert_eq!(entry.decode().unwrap(), Signal::Full);
    }

    #[tokio::test]
    async fn test_status_before_start() {
        let h = harness();
        let (status, body) = call(h.state.clone(), "GET", "/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"started":false}"#);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let h = harness();
        let (status, body) = call(h.state.clone(), "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# TYPE runsync_signals_received_total counter"));
    }
}
