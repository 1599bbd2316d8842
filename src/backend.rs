use crate::config::{APP_ID, BackendConfig, CLIENT_TYPE};
use crate::models::BackendModel;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future;
use futures_util::stream::{self, BoxStream, Stream};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::io;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::io::StreamReader;

const CREATE_SESSION_PATH: &str = "/api/v1/chat";
const SELECT_MODEL_PATH: &str = "/api/v1/user/select_model";
const SELECT_CHOICE_PATH: &str = "/api/v1/msg/select-choice";

/// Longest backend line accepted before the turn is treated as broken.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One unit produced by a streamed turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendLine {
    Line(String),
    /// The connection could not be opened or broke mid-body. Always the last item.
    TransportFailure(String),
}

pub type LineStream = BoxStream<'static, BackendLine>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("undecodable response (status {status}): {message}")]
    Decode { status: StatusCode, message: String },
    #[error("response without chat id (status {0})")]
    MissingChatId(StatusCode),
}

/// The four AnuNeko operations. None of them raise: failures are reported as
/// `None`, `false` or a trailing [`BackendLine::TransportFailure`].
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn create_session(&self, model: BackendModel) -> Option<String>;
    async fn switch_model(&self, chat_id: &str, model: BackendModel) -> bool;
    async fn confirm_choice(&self, msg_id: &str, choice_idx: u32) -> bool;
    async fn stream_turn(&self, chat_id: &str, text: &str) -> LineStream;
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    config: BackendConfig,
}

impl BackendClient {
    pub fn new(http: reqwest::Client, config: BackendConfig) -> Self {
        Self { http, config }
    }

    fn post(&self, path: &str, content_type: &str) -> reqwest::RequestBuilder {
        let url = join_url(&self.config.base_url, path);
        let origin = self.config.origin();
        let mut req = self
            .http
            .post(url)
            .header("accept", "*/*")
            .header("content-type", content_type)
            .header("origin", origin)
            .header("referer", format!("{origin}/"))
            .header("user-agent", "Mozilla/5.0")
            .header("x-app_id", APP_ID)
            .header("x-client_type", CLIENT_TYPE)
            .header("x-device_id", self.config.device_id.as_str())
            .header("x-token", self.config.token.as_str());
        if let Some(cookie) = &self.config.cookie {
            req = req.header("cookie", cookie.as_str());
        }
        req
    }

    async fn try_create_session(&self, model: BackendModel) -> Result<String, BackendError> {
        let resp = self
            .post(CREATE_SESSION_PATH, "application/json")
            .timeout(self.config.create_timeout())
            .body(json!({ "model": model.as_str() }).to_string())
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        let value: Value = serde_json::from_str(&text).map_err(|err| BackendError::Decode {
            status,
            message: err.to_string(),
        })?;
        extract_chat_id(&value).ok_or(BackendError::MissingChatId(status))
    }

    async fn post_expecting_ok(
        &self,
        path: &str,
        body: Value,
        timeout: std::time::Duration,
    ) -> Result<(), BackendError> {
        let resp = self
            .post(path, "application/json")
            .timeout(timeout)
            .body(body.to_string())
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            status => Err(BackendError::Status(status)),
        }
    }
}

#[async_trait]
impl ChatBackend for BackendClient {
    async fn create_session(&self, model: BackendModel) -> Option<String> {
        match self.try_create_session(model).await {
            Ok(chat_id) => {
                tracing::debug!(chat_id = %chat_id, model = %model, "backend chat created");
                // The creation response does not reliably reflect the requested persona.
                self.switch_model(&chat_id, model).await;
                Some(chat_id)
            }
            Err(err) => {
                record_failure("create_session");
                tracing::warn!(model = %model, "failed to create backend chat: {err}");
                None
            }
        }
    }

    async fn switch_model(&self, chat_id: &str, model: BackendModel) -> bool {
        let body = json!({ "chat_id": chat_id, "model": model.as_str() });
        match self
            .post_expecting_ok(SELECT_MODEL_PATH, body, self.config.switch_timeout())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                record_failure("switch_model");
                tracing::warn!(chat_id = %chat_id, model = %model, "model switch failed: {err}");
                false
            }
        }
    }

    async fn confirm_choice(&self, msg_id: &str, choice_idx: u32) -> bool {
        let body = json!({ "msg_id": msg_id, "choice_idx": choice_idx });
        match self
            .post_expecting_ok(SELECT_CHOICE_PATH, body, self.config.confirm_timeout())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                record_failure("confirm_choice");
                tracing::warn!(msg_id = %msg_id, choice_idx, "branch confirmation failed: {err}");
                false
            }
        }
    }

    async fn stream_turn(&self, chat_id: &str, text: &str) -> LineStream {
        let path = format!("/api/v1/msg/{chat_id}/stream");
        let body = json!({ "contents": [text] }).to_string();
        // No timeout: the reply lasts as long as the backend keeps the connection open.
        let sent = self.post(&path, "text/plain").body(body).send().await;
        match sent {
            Ok(resp) => {
                tracing::debug!(chat_id = %chat_id, status = %resp.status(), "turn stream opened");
                split_lines(resp.bytes_stream())
            }
            Err(err) => {
                record_failure("stream_turn");
                tracing::warn!(chat_id = %chat_id, "turn stream failed to open: {err}");
                stream::iter([BackendLine::TransportFailure(err.to_string())]).boxed()
            }
        }
    }
}

fn record_failure(op: &'static str) {
    metrics::counter!("nekobridge_backend_failures_total", "op" => op).increment(1);
}

fn extract_chat_id(value: &Value) -> Option<String> {
    ["chat_id", "id"].iter().find_map(|key| match value.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Re-frames a byte stream into `\n`-separated lines, tolerating `\r\n` and
/// invalid UTF-8. A transport error, or a line longer than [`MAX_LINE_BYTES`],
/// ends the stream with a [`BackendLine::TransportFailure`].
pub fn split_lines<S, E>(body: S) -> LineStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let reader = StreamReader::new(Box::pin(
        body.map(|chunk| chunk.map_err(|err| io::Error::other(err.to_string()))),
    ));
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_BYTES);
    FramedRead::new(reader, codec)
        .scan(false, |failed, frame| {
            if *failed {
                return future::ready(None);
            }
            let line = match frame {
                Ok(raw) => BackendLine::Line(decode_line(&raw)),
                Err(err) => {
                    *failed = true;
                    BackendLine::TransportFailure(err.to_string())
                }
            };
            future::ready(Some(line))
        })
        .boxed()
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
