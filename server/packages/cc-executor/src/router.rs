use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::config::{ConfigError, ServerConfig, SERVICE_NAME, WEBSOCKET_PATH};
use crate::session::connection::{self, ConnectQuery};
use crate::session::SessionManager;
use crate::supervisor::Supervisor;

/// Shared by every connection: configuration, the process supervisor and the
/// session manager.
#[derive(Debug)]
pub struct AppState {
    config: Arc<ServerConfig>,
    supervisor: Arc<Supervisor>,
    sessions: Arc<SessionManager>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let supervisor = Arc::new(Supervisor::new(&config));
        let sessions = Arc::new(SessionManager::new(config.clone(), supervisor.clone()));
        Ok(Self {
            config,
            supervisor,
            sessions,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub uptime_seconds: u64,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::info!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .route("/health", get(get_health))
        .route("/healthz", get(get_healthz))
        .route(WEBSOCKET_PATH, get(websocket_handler))
        .fallback(not_found)
        .with_state(state)
        .layer(trace_layer)
}

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let sessions = state.sessions();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: sessions.active_sessions().await,
        max_sessions: sessions.max_sessions(),
        uptime_seconds: state.uptime().as_secs(),
    })
}

async fn get_healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| connection::serve_socket(state, socket, query))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(ServerConfig::default()).expect("valid config"))
    }

    #[tokio::test]
    async fn health_reports_session_capacity() {
        let state = state();
        state.sessions().open().await.expect("session");
        let response = build_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.expect("body").to_bytes();
        let health: HealthResponse = serde_json::from_slice(&body).expect("json");
        assert_eq!(health.status, "healthy");
        assert_eq!(health.service, SERVICE_NAME);
        assert_eq!(health.active_sessions, 1);
        assert_eq!(health.max_sessions, 100);
    }

    #[tokio::test]
    async fn liveness_and_unknown_routes() {
        let router = build_router(state());
        let response = router
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::get("/nope").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ServerConfig {
            max_sessions: 0,
            ..ServerConfig::default()
        };
        assert!(AppState::new(config).is_err());
    }
}
