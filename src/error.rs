use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message).with_type("not_found")
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "backend_error", message)
            .with_type("api_error")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            .with_type("internal_error")
    }

    /// The `{"error": {...}}` envelope used both as a JSON body and as an SSE frame.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::to_value(ErrorEnvelope {
            error: ErrorBody {
                message: &self.message,
                error_type: &self.error_type,
            },
        })
        .unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    error_type: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(code = %self.code, status = %self.status, "{}", self.message);
        }
        (self.status, axum::Json(self.envelope())).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures before the server accepts its first request. These never reach a client.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("ANUNEKO_TOKEN must be set")]
    MissingToken,
    #[error("invalid listen address {addr:?}: {source}")]
    InvalidListen {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server stopped: {0}")]
    Serve(#[source] std::io::Error),
}
