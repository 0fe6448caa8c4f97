//! Minimal HTTP admin surface (§6): replica registration and a health probe.
//! Not the control plane itself, just the local entry point the scheduler
//! agent on this node calls into when it places a replica here.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::common::{Component, HealthStatus};
use crate::environment::Environment;
use crate::resolver::Resolver;

#[derive(Clone)]
pub struct AdminState {
    pub environment: Arc<Environment>,
    pub resolver: Arc<Resolver>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RegisterRequest {
    pub job_name: String,
    pub instance_number: u32,
    pub node_port: u16,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub nsip: String,
    pub already_registered: bool,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn register(
    State(state): State<AdminState>,
    Json(req): Json<RegisterRequest>,
) -> (StatusCode, Json<RegisterResponse>) {
    let already_registered = state
        .environment
        .is_locally_deployed(&req.job_name, req.instance_number);

    match state
        .environment
        .construct_table_entry(&req.job_name, req.instance_number, req.node_port, vec![])
        .await
    {
        Some(entry) => {
            let status = if already_registered { StatusCode::OK } else { StatusCode::CREATED };
            state.resolver.upsert_entry(entry.clone());
            (
                status,
                Json(RegisterResponse {
                    nsip: entry.nsip.to_string(),
                    already_registered,
                }),
            )
        }
        None => (
            StatusCode::INSUFFICIENT_STORAGE,
            Json(RegisterResponse {
                nsip: String::new(),
                already_registered,
            }),
        ),
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Wraps the admin HTTP server as a lifecycle [`Component`] so it starts and
/// stops alongside the rest of the node in `main`.
pub struct AdminServer {
    state: AdminState,
    port: u16,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl AdminServer {
    pub fn new(state: AdminState, port: u16) -> Self {
        Self {
            state,
            port,
            handle: None,
        }
    }
}

impl Component for AdminServer {
    fn initialize(&mut self) -> crate::error::Result<()> {
        let app = router(self.state.clone());
        let port = self.port;
        self.handle = Some(tokio::spawn(async move {
            let addr = format!("0.0.0.0:{port}");
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!(error = %e, "admin server exited");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to bind admin server"),
            }
        }));
        Ok(())
    }

    fn shutdown(&mut self) -> crate::error::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        Ok(())
    }

    fn health_check(&self) -> HealthStatus {
        match &self.handle {
            Some(h) if !h.is_finished() => HealthStatus::Healthy,
            Some(_) => HealthStatus::Unhealthy,
            None => HealthStatus::Degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_channel::LocalControlChannel;
    use axum::body::Body;
    use axum::http::Request;
    use std::net::Ipv6Addr;
    use tower::ServiceExt;

    fn test_state() -> AdminState {
        AdminState {
            environment: Arc::new(Environment::new(
                "tun0",
                "192.168.1.10".parse().unwrap(),
                "10.18.0.0".parse().unwrap(),
                16,
                Ipv6Addr::UNSPECIFIED,
                0,
                "10.30.0.0".parse().unwrap(),
                16,
                Ipv6Addr::UNSPECIFIED,
                0,
                Arc::new(crate::exposer::LoggingExposer),
            )),
            resolver: Arc::new(Resolver::new(Arc::new(LocalControlChannel::new()))),
        }
    }

    #[tokio::test]
    async fn register_then_reregister_is_idempotent_at_the_http_layer() {
        let app = router(test_state());
        let body = serde_json::to_vec(&RegisterRequest {
            job_name: "svc.ns".to_string(),
            instance_number: 0,
            node_port: 9000,
        })
        .unwrap();

        let req1 = Request::builder()
            .method("POST")
            .uri("/register")
            .header("content-type", "application/json")
            .body(Body::from(body.clone()))
            .unwrap();
        let resp1 = app.clone().oneshot(req1).await.unwrap();
        assert_eq!(resp1.status(), StatusCode::CREATED);

        let req2 = Request::builder()
            .method("POST")
            .uri("/register")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let resp2 = app.oneshot(req2).await.unwrap();
        assert_eq!(resp2.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn registering_publishes_the_new_entry_to_the_resolver() {
        let state = test_state();
        let resolver = state.resolver.clone();
        let app = router(state);
        let body = serde_json::to_vec(&RegisterRequest {
            job_name: "svc.ns".to_string(),
            instance_number: 0,
            node_port: 9000,
        })
        .unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/register")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        app.oneshot(req).await.unwrap();

        assert!(resolver.is_service_deployed("svc.ns#0"));
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = router(test_state());
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
