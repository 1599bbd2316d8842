use crate::backend::{BackendClient, ChatBackend};
use crate::config::{BackendConfig, env_non_empty};
use crate::error::StartupError;
use crate::orchestrator::CompletionsOrchestrator;
use crate::session::SessionStore;
use axum::Router;
use axum::routing::{delete, get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub sessions: SessionStore,
    pub orchestrator: CompletionsOrchestrator,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<String> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub backend: BackendConfig,
}

impl RuntimeConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            metrics_path: "/metrics".to_string(),
            backend,
        }
    }

    /// Fails when `ANUNEKO_TOKEN` is missing: every backend call needs it.
    pub fn from_env() -> Result<Self, StartupError> {
        let backend = BackendConfig::from_env().ok_or(StartupError::MissingToken)?;
        let listen = env_non_empty("NEKOBRIDGE_LISTEN")
            .or_else(legacy_listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let metrics_path = env_non_empty("NEKOBRIDGE_METRICS_PATH")
            .unwrap_or_else(|| "/metrics".to_string());
        Ok(Self {
            listen,
            metrics_path,
            backend,
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, StartupError> {
        self.listen
            .parse()
            .map_err(|source| StartupError::InvalidListen {
                addr: self.listen.clone(),
                source,
            })
    }
}

// FLASK_HOST / FLASK_PORT, as honoured by earlier deployments.
fn legacy_listen() -> Option<String> {
    let host = env_non_empty("FLASK_HOST");
    let port = env_non_empty("FLASK_PORT");
    if host.is_none() && port.is_none() {
        return None;
    }
    Some(format!(
        "{}:{}",
        host.as_deref().unwrap_or("0.0.0.0"),
        port.as_deref().unwrap_or("8080")
    ))
}

pub async fn load_state() -> Result<AppState, StartupError> {
    load_state_with_runtime(RuntimeConfig::from_env()?).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> Result<AppState, StartupError> {
    let http = reqwest::Client::builder()
        .user_agent("nekobridge/0.1")
        .build()?;
    let backend: Arc<dyn ChatBackend> = Arc::new(BackendClient::new(http, runtime.backend.clone()));
    let metrics = init_metrics()?;
    let sessions = SessionStore::new();
    let orchestrator = CompletionsOrchestrator::new(backend, sessions.clone());
    tracing::info!(backend = %runtime.backend.base_url, "state loaded");

    Ok(AppState {
        runtime: Arc::new(runtime),
        sessions,
        orchestrator,
        metrics,
    })
}

/// The recorder is process-global; every state built in this process shares it.
fn init_metrics() -> Result<PrometheusHandle, StartupError> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(err.to_string());
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(StartupError::Metrics(err.clone()));
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| StartupError::Metrics("recorder not available".to_string()))
}

pub fn build_app(state: AppState) -> Router {
    let api_router = build_api_router(&state.runtime.metrics_path);
    Router::<AppState>::new()
        .merge(api_router.clone())
        .nest("/api", api_router)
        .fallback(crate::handlers::not_found)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/sessions", get(crate::handlers::list_sessions))
        .route("/sessions/{id}", delete(crate::handlers::delete_session))
        .route("/health", get(crate::handlers::health))
        .route(metrics_path, get(crate::handlers::metrics))
}
