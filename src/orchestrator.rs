use crate::backend::ChatBackend;
use crate::error::{AppError, AppResult};
use crate::formatter::{self, CompletionMeta, FINISH_STOP};
use crate::models::{self, DEFAULT_MODEL};
use crate::session::SessionStore;
use crate::translator::{self, TurnItem, TurnStream};
use axum::response::sse::Event;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub stream: Option<bool>,
    // Accepted for compatibility; the backend exposes no sampling controls.
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl ChatMessage {
    /// Plain text of the message; array content contributes its text parts.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter(|p| {
                    matches!(
                        p.get("type").and_then(|t| t.as_str()),
                        Some("text") | Some("input_text")
                    )
                })
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

impl ChatCompletionRequest {
    pub fn model_name(&self) -> &str {
        self.model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MODEL)
    }

    /// Text of the most recent user message.
    pub fn last_user_text(&self) -> AppResult<String> {
        let messages = self
            .messages
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| AppError::bad_request("Missing messages"))?;
        messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(ChatMessage::text)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| AppError::bad_request("No user message found"))
    }
}

/// A validated turn bound to a backend chat, ready to be sent.
#[derive(Debug)]
pub struct PreparedTurn {
    pub session_id: String,
    pub session_created: bool,
    pub stream: bool,
    chat_id: String,
    user_text: String,
    meta: CompletionMeta,
}

#[derive(Clone)]
pub struct CompletionsOrchestrator {
    backend: Arc<dyn ChatBackend>,
    sessions: SessionStore,
}

impl CompletionsOrchestrator {
    pub fn new(backend: Arc<dyn ChatBackend>, sessions: SessionStore) -> Self {
        Self { backend, sessions }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Validates the request and makes sure the conversation is bound to a
    /// backend chat running the requested persona.
    pub async fn prepare(
        &self,
        request: ChatCompletionRequest,
        session_id: Option<&str>,
    ) -> AppResult<PreparedTurn> {
        let user_text = request.last_user_text()?;
        let requested_model = request.model_name().to_string();
        let model = models::map_model(&requested_model);
        let (entry, session_created) = self.sessions.resolve(session_id, &requested_model, model);

        // Held across create/switch so concurrent first turns share one backend chat.
        let mut state = entry.lock().await;
        let chat_id = match state.backend_chat_id() {
            None => {
                let chat_id = self.backend.create_session(model).await.ok_or_else(|| {
                    AppError::backend("Failed to create AnuNeko session")
                })?;
                state.record_backend_chat(chat_id.clone());
                chat_id
            }
            Some(chat_id) => {
                let chat_id = chat_id.to_string();
                if state.active_model() != model {
                    let switched = self.backend.switch_model(&chat_id, model).await;
                    tracing::debug!(
                        session_id = %entry.id(),
                        chat_id = %chat_id,
                        from = %state.active_model(),
                        to = %model,
                        switched,
                        "model switch requested"
                    );
                }
                chat_id
            }
        };
        state.set_model(model, requested_model.clone());
        drop(state);

        Ok(PreparedTurn {
            session_id: entry.id().to_string(),
            session_created,
            stream: request.stream.unwrap_or(false),
            chat_id,
            user_text,
            meta: CompletionMeta::new(requested_model),
        })
    }

    async fn open_turn(backend: Arc<dyn ChatBackend>, chat_id: &str, text: &str) -> TurnStream {
        let lines = backend.stream_turn(chat_id, text).await;
        translator::translate(lines, backend)
    }

    /// Runs the turn to completion and renders a single completion object.
    pub async fn complete(&self, turn: PreparedTurn) -> AppResult<Value> {
        metrics::counter!("nekobridge_completions_total", "mode" => "sync").increment(1);
        let stream = Self::open_turn(self.backend.clone(), &turn.chat_id, &turn.user_text).await;
        let reply = translator::collect_reply(stream)
            .await
            .ok_or_else(|| AppError::internal("reply stream ended unexpectedly"))?;
        Ok(formatter::completion(&turn.meta, &reply, FINISH_STOP))
    }

    /// Lazily produced SSE frames: one chunk per fragment, a final `stop`
    /// chunk and `[DONE]`. The backend request is only sent once the body is polled.
    pub fn stream(
        &self,
        turn: PreparedTurn,
    ) -> impl Stream<Item = Result<Event, Infallible>> + Send + use<> {
        metrics::counter!("nekobridge_completions_total", "mode" => "stream").increment(1);
        let backend = self.backend.clone();
        let PreparedTurn {
            chat_id,
            user_text,
            meta,
            ..
        } = turn;
        let opening = async move { Self::open_turn(backend, &chat_id, &user_text).await };
        stream::once(opening)
            .flat_map(move |turn| sse_frames(turn, meta.clone()))
            .map(Ok)
    }
}

fn sse_frames(turn: TurnStream, meta: CompletionMeta) -> impl Stream<Item = Event> + Send {
    stream::unfold(Some((turn, meta)), |state| async move {
        let Some((mut turn, meta)) = state else {
            return None;
        };
        let frames = match turn.next().await {
            Some(TurnItem::Fragment(text)) => {
                let frame = formatter::chunk_event(&meta, &text);
                return Some((vec![frame], Some((turn, meta))));
            }
            Some(TurnItem::Finished(_)) => {
                vec![formatter::stop_event(&meta), formatter::done_event()]
            }
            None => {
                let err = AppError::backend("reply stream ended unexpectedly");
                tracing::warn!(completion_id = %meta.id, "{}", err.message);
                vec![formatter::error_event(&err)]
            }
        };
        Some((frames, None))
    })
    .flat_map(stream::iter)
}
