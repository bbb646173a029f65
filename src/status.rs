use std::net::SocketAddr;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::supervisor::SupervisorStatus;
use crate::worker::{WorkerPhase, WorkerStatus};

#[derive(Clone)]
pub struct StatusState {
    worker: watch::Receiver<WorkerStatus>,
    supervisor: watch::Receiver<SupervisorStatus>,
}

impl StatusState {
    pub fn new(
        worker: watch::Receiver<WorkerStatus>,
        supervisor: watch::Receiver<SupervisorStatus>,
    ) -> Self {
        Self { worker, supervisor }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    worker_id: String,
    phase: WorkerPhase,
    host: Option<String>,
    state: Option<String>,
    restarts: u32,
    last_exit_code: Option<i32>,
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    phase: WorkerPhase,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Serve the status endpoint until `shutdown` is cancelled.
pub async fn run_status_server(addr: SocketAddr, state: StatusState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn health_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let phase = state.worker.borrow().phase;
    let healthy = phase != WorkerPhase::Failed;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthResponse { healthy, phase }))
}

async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let worker = state.worker.borrow().clone();
    let supervisor = state.supervisor.borrow().clone();

    // The supervisor status belongs to the last supervised host, which is
    // only current while the worker is supervising it.
    let current = worker.host.is_some() && worker.host == supervisor.host;
    Json(StatusResponse {
        worker_id: worker.worker_id,
        phase: worker.phase,
        host: worker.host,
        state: current.then(|| supervisor.state.to_string()),
        restarts: if current { supervisor.restarts } else { 0 },
        last_exit_code: if current { supervisor.last_exit_code } else { None },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn worker_status(phase: WorkerPhase, host: Option<&str>) -> WorkerStatus {
        WorkerStatus {
            worker_id: "pod-a".into(),
            phase,
            host: host.map(String::from),
            acquisitions: 1,
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn status_reports_supervised_host() {
        let mut supervisor = SupervisorStatus::for_host("app1");
        supervisor.enter(SupervisorState::Running);
        supervisor.restarts = 2;
        let (_w, worker_rx) = watch::channel(worker_status(WorkerPhase::Supervising, Some("app1")));
        let (_s, supervisor_rx) = watch::channel(supervisor);

        let (code, body) = get_json(router(StatusState::new(worker_rx, supervisor_rx)), "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["worker_id"], "pod-a");
        assert_eq!(body["host"], "app1");
        assert_eq!(body["state"], "running");
        assert_eq!(body["restarts"], 2);
    }

    #[tokio::test]
    async fn health_fails_after_fatal_error() {
        let (_w, worker_rx) = watch::channel(worker_status(WorkerPhase::Failed, None));
        let (_s, supervisor_rx) = watch::channel(SupervisorStatus::default());

        let (code, body) = get_json(router(StatusState::new(worker_rx, supervisor_rx)), "/health").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["healthy"], false);
    }

    #[tokio::test]
    async fn status_without_host_has_no_state() {
        let (_w, worker_rx) = watch::channel(worker_status(WorkerPhase::Acquiring, None));
        let (_s, supervisor_rx) = watch::channel(SupervisorStatus::default());

        let (code, body) = get_json(router(StatusState::new(worker_rx, supervisor_rx)), "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["phase"], "acquiring");
        assert!(body["state"].is_null());
    }
}
