use axum::response::sse::Event;
use serde_json::{Value, json};

pub const DONE_MARKER: &str = "[DONE]";
pub const FINISH_STOP: &str = "stop";

/// Bookkeeping shared by every object rendered for one completion.
#[derive(Debug, Clone)]
pub struct CompletionMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl CompletionMeta {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
        }
    }
}

pub fn completion(meta: &CompletionMeta, content: &str, finish_reason: &str) -> Value {
    json!({
        "id": meta.id,
        "object": "chat.completion",
        "created": meta.created,
        "model": meta.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": 0,
            "completion_tokens": 0,
            "total_tokens": 0
        }
    })
}

pub fn chunk(meta: &CompletionMeta, content: &str, finish_reason: Option<&str>) -> Value {
    json!({
        "id": meta.id,
        "object": "chat.completion.chunk",
        "created": meta.created,
        "model": meta.model,
        "choices": [{
            "index": 0,
            "delta": { "content": content },
            "finish_reason": finish_reason
        }]
    })
}

pub fn chunk_event(meta: &CompletionMeta, content: &str) -> Event {
    Event::default().data(chunk(meta, content, None).to_string())
}

pub fn stop_event(meta: &CompletionMeta) -> Event {
    Event::default().data(chunk(meta, "", Some(FINISH_STOP)).to_string())
}

pub fn done_event() -> Event {
    Event::default().data(DONE_MARKER)
}

pub fn error_event(error: &crate::error::AppError) -> Event {
    Event::default().data(error.envelope().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> CompletionMeta {
        CompletionMeta {
            id: "chatcmpl-test".to_string(),
            created: 1_700_000_000,
            model: "gpt-4".to_string(),
        }
    }

    #[test]
    fn completion_has_zero_usage_and_assistant_message() {
        let v = completion(&meta(), "meow", FINISH_STOP);
        assert_eq!(v["object"], "chat.completion");
        assert_eq!(v["model"], "gpt-4");
        assert_eq!(v["choices"][0]["message"]["role"], "assistant");
        assert_eq!(v["choices"][0]["message"]["content"], "meow");
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
        assert_eq!(
            v["usage"],
            json!({ "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 })
        );
    }

    #[test]
    fn streaming_chunk_has_null_finish_reason() {
        let v = chunk(&meta(), "me", None);
        assert_eq!(v["object"], "chat.completion.chunk");
        assert_eq!(v["choices"][0]["delta"]["content"], "me");
        assert!(v["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn final_chunk_is_empty_with_stop() {
        let v = chunk(&meta(), "", Some(FINISH_STOP));
        assert_eq!(v["choices"][0]["delta"]["content"], "");
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn ids_are_prefixed_hex() {
        let m = CompletionMeta::new("gpt-4");
        let hex = m.id.strip_prefix("chatcmpl-").unwrap();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
