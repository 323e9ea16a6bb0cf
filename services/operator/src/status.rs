//! Status endpoints.
//!
//! - `GET /api/state`: current state, with the recorded error if any
//! - `GET /_health`: 200 while `Running`, 503 otherwise

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::machine::{AgentState, MachineHandle};

/// Create the status router.
pub fn router(machine: MachineHandle) -> Router {
    Router::new()
        .route("/api/state", get(current_state))
        .route("/_health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(machine)
}

async fn current_state(State(machine): State<MachineHandle>) -> impl IntoResponse {
    match machine.current().await {
        Ok(state) => (StatusCode::OK, state.to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

async fn health(State(machine): State<MachineHandle>) -> impl IntoResponse {
    match machine.current().await {
        Ok(state) if state.name() == AgentState::Running => (StatusCode::OK, "ok".to_string()),
        Ok(state) => (StatusCode::SERVICE_UNAVAILABLE, state.name().to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Serve the status router until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    machine: MachineHandle,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(machine))
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("Status server shutting down");
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::error::TransportError;
    use crate::machine::{new_machine, MachineActor};

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_state_endpoint() {
        let machine = MachineActor::spawn(new_machine().unwrap());
        let app = router(machine.clone());

        let (status, body) = get_text(app.clone(), "/api/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Initial");

        machine
            .force_transition(
                AgentState::DetectionFailed,
                Some(Arc::new(TransportError::Unavailable("consul down".to_string()))),
            )
            .await
            .unwrap();

        let (_, body) = get_text(app, "/api/state").await;
        assert_eq!(body, "DetectionFailed: unavailable: consul down");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let machine = MachineActor::spawn(new_machine().unwrap());
        let app = router(machine.clone());

        let (status, body) = get_text(app.clone(), "/_health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Initial");

        machine.force_transition(AgentState::Running, None).await.unwrap();

        let (status, body) = get_text(app, "/_health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let machine = MachineActor::spawn(new_machine().unwrap());
        let (status, _) = get_text(router(machine), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
