use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::routing::post;
use http_body_util::BodyExt;
use nekobridge::translator::BRANCH_CONFLICT_WARNING;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

/// Records what the proxy sent to the fake AnuNeko service.
#[derive(Default)]
struct MockAnuNeko {
    creates: AtomicUsize,
    fail_create: AtomicBool,
    created_models: Mutex<Vec<String>>,
    model_selections: Mutex<Vec<Value>>,
    choice_selections: Mutex<Vec<Value>>,
    turns: Mutex<Vec<(String, String)>>,
    seen_headers: Mutex<Vec<HeaderMap>>,
}

impl MockAnuNeko {
    fn model_selections(&self) -> Vec<Value> {
        self.model_selections.lock().unwrap().clone()
    }

    fn choice_selections(&self) -> Vec<Value> {
        self.choice_selections.lock().unwrap().clone()
    }

    fn turns(&self) -> Vec<(String, String)> {
        self.turns.lock().unwrap().clone()
    }
}

struct TestContext {
    router: Router,
    state: nekobridge::app::AppState,
    mock: Arc<MockAnuNeko>,
}

async fn create_chat(
    State(mock): State<Arc<MockAnuNeko>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.seen_headers.lock().unwrap().push(headers);
    if mock.fail_create.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "unavailable" })),
        );
    }
    let model = body["model"].as_str().unwrap_or_default().to_string();
    mock.created_models.lock().unwrap().push(model);
    let n = mock.creates.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, Json(json!({ "chat_id": format!("chat-{n}") })))
}

async fn select_model(State(mock): State<Arc<MockAnuNeko>>, Json(body): Json<Value>) -> StatusCode {
    mock.model_selections.lock().unwrap().push(body);
    StatusCode::OK
}

async fn select_choice(
    State(mock): State<Arc<MockAnuNeko>>,
    Json(body): Json<Value>,
) -> StatusCode {
    mock.choice_selections.lock().unwrap().push(body);
    StatusCode::OK
}

async fn stream_turn(
    State(mock): State<Arc<MockAnuNeko>>,
    Path(chat_id): Path<String>,
    body: String,
) -> String {
    let parsed: Value = serde_json::from_str(&body).unwrap_or_default();
    let text = parsed["contents"][0].as_str().unwrap_or_default().to_string();
    mock.turns.lock().unwrap().push((chat_id, text.clone()));
    if text == "conflict" {
        return "{\"code\":\"chat_choice_shown\",\"msg\":\"select a reply first\"}\n".to_string();
    }
    [
        json!({ "msg_id": "m1" }).to_string(),
        json!({ "c": [{ "v": "Meow, " }, { "v": "Woof", "c": 1 }] }).to_string(),
        String::new(),
        json!({ "v": format!("you said {text}") }).to_string(),
        json!({ "msg_id": "m2" }).to_string(),
    ]
    .iter()
    .map(|line| {
        if line.is_empty() {
            "\n".to_string()
        } else {
            format!("data: {line}\r\n")
        }
    })
    .collect()
}

async fn start_upstream(mock: Arc<MockAnuNeko>) -> SocketAddr {
    let app = Router::new()
        .route("/api/v1/chat", post(create_chat))
        .route("/api/v1/user/select_model", post(select_model))
        .route("/api/v1/msg/select-choice", post(select_choice))
        .route("/api/v1/msg/{chat_id}/stream", post(stream_turn))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn setup() -> TestContext {
    let mock = Arc::new(MockAnuNeko::default());
    let addr = start_upstream(mock.clone()).await;
    let backend = nekobridge::config::BackendConfig::new("test-token")
        .with_base_url(format!("http://{addr}"))
        .with_cookie(Some("session=abc".to_string()));
    let mut runtime = nekobridge::app::RuntimeConfig::new(backend);
    runtime.listen = "127.0.0.1:0".to_string();
    let state = nekobridge::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
    let router = nekobridge::app::build_app(state.clone());
    TestContext {
        router,
        state,
        mock,
    }
}

fn completion_request(body: Value, session_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json");
    if let Some(id) = session_id {
        builder = builder.header("x-session-id", id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(ctx: &TestContext, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&bytes).to_string())
}

async fn chat(
    ctx: &TestContext,
    model: &str,
    text: &str,
    session_id: Option<&str>,
) -> (StatusCode, String, Value) {
    let body = json!({ "model": model, "messages": [{ "role": "user", "content": text }] });
    let (status, headers, body) = send(ctx, completion_request(body, session_id)).await;
    let session = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (status, session, serde_json::from_str(&body).unwrap_or(Value::Null))
}

async fn get(ctx: &TestContext, path: &str) -> (StatusCode, String) {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    let (status, _, body) = send(ctx, req).await;
    (status, body)
}

async fn wait_for_choices(mock: &MockAnuNeko, expected: usize) -> Vec<Value> {
    for _ in 0..100 {
        let choices = mock.choice_selections();
        if choices.len() >= expected {
            return choices;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    mock.choice_selections()
}

#[tokio::test]
async fn nonstream_turn_creates_backend_chat_and_reuses_it() {
    let ctx = setup().await;
    let (status, session_id, v) = chat(&ctx, "gpt-4", "hello", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!session_id.is_empty());
    assert_eq!(v["object"], "chat.completion");
    assert_eq!(v["model"], "gpt-4");
    assert_eq!(v["choices"][0]["message"]["role"], "assistant");
    assert_eq!(v["choices"][0]["message"]["content"], "Meow, you said hello");
    assert_eq!(v["choices"][0]["finish_reason"], "stop");
    assert_eq!(v["usage"]["total_tokens"], 0);
    assert!(v["id"].as_str().unwrap().starts_with("chatcmpl-"));

    assert_eq!(
        ctx.mock.created_models.lock().unwrap().clone(),
        vec!["Exotic Shorthair".to_string()]
    );
    assert_eq!(
        ctx.mock.model_selections(),
        vec![json!({ "chat_id": "chat-0", "model": "Exotic Shorthair" })]
    );

    let (status, again, v) = chat(&ctx, "gpt-4", "again", Some(&session_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, session_id);
    assert_eq!(v["choices"][0]["message"]["content"], "Meow, you said again");
    assert_eq!(ctx.mock.creates.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.mock.model_selections().len(), 1);
    assert_eq!(
        ctx.mock.turns(),
        vec![
            ("chat-0".to_string(), "hello".to_string()),
            ("chat-0".to_string(), "again".to_string()),
        ]
    );

    let choices = wait_for_choices(&ctx.mock, 2).await;
    assert_eq!(choices.len(), 2);
    assert!(
        choices
            .iter()
            .all(|c| *c == json!({ "msg_id": "m2", "choice_idx": 0 }))
    );
}

#[tokio::test]
async fn backend_requests_carry_identity_headers() {
    let ctx = setup().await;
    let (status, _, _) = chat(&ctx, "gpt-3.5-turbo", "hi", None).await;
    assert_eq!(status, StatusCode::OK);
    let headers = ctx.mock.seen_headers.lock().unwrap()[0].clone();
    assert_eq!(headers["x-token"], "test-token");
    assert_eq!(headers["x-app_id"], "com.anuttacon.neko");
    assert_eq!(headers["x-client_type"], "4");
    assert_eq!(headers["cookie"], "session=abc");
    assert!(headers.contains_key("x-device_id"));
}

#[tokio::test]
async fn model_change_switches_persona_on_existing_chat() {
    let ctx = setup().await;
    let (_, session_id, _) = chat(&ctx, "gpt-3.5-turbo", "one", None).await;
    let (status, _, v) = chat(&ctx, "gpt-4", "two", Some(&session_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["model"], "gpt-4");
    assert_eq!(
        ctx.mock.model_selections(),
        vec![
            json!({ "chat_id": "chat-0", "model": "Orange Cat" }),
            json!({ "chat_id": "chat-0", "model": "Exotic Shorthair" }),
        ]
    );
    assert_eq!(ctx.mock.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_session_id_is_replaced_with_a_fresh_one() {
    let ctx = setup().await;
    let (status, session_id, _) = chat(&ctx, "gpt-4", "hi", Some("never-seen")).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(session_id, "never-seen");
    assert!(ctx.state.sessions.get("never-seen").is_none());
    assert!(ctx.state.sessions.get(&session_id).is_some());

    let (_, reused, _) = chat(&ctx, "gpt-4", "again", Some(&session_id)).await;
    assert_eq!(reused, session_id);
    assert_eq!(ctx.mock.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn streaming_emits_chunks_and_done() {
    let ctx = setup().await;
    let body = json!({
        "model": "gpt-4",
        "stream": true,
        "messages": [
            { "role": "system", "content": "be a cat" },
            { "role": "user", "content": [{ "type": "text", "text": "hi" }] }
        ]
    });
    let (status, headers, body) = send(&ctx, completion_request(body, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        headers[CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    assert_eq!(headers[CACHE_CONTROL], "no-cache");
    assert!(headers.contains_key("x-session-id"));

    let frames: Vec<&str> = body
        .split("\n\n")
        .filter_map(|f| f.strip_prefix("data: "))
        .collect();
    assert_eq!(frames.last(), Some(&"[DONE]"));
    let chunks: Vec<Value> = frames[..frames.len() - 1]
        .iter()
        .map(|f| serde_json::from_str(f).unwrap())
        .collect();
    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(last["choices"][0]["delta"]["content"], "");
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
    assert!(chunks.iter().all(|c| c["id"] == chunks[0]["id"]));
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "Meow, you said hi");

    let choices = wait_for_choices(&ctx.mock, 1).await;
    assert_eq!(choices, vec![json!({ "msg_id": "m2", "choice_idx": 0 })]);
}

#[tokio::test]
async fn branch_conflict_returns_warning_without_confirmation() {
    let ctx = setup().await;
    let (status, _, v) = chat(&ctx, "gpt-4", "conflict", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["choices"][0]["message"]["content"], BRANCH_CONFLICT_WARNING);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ctx.mock.choice_selections().is_empty());
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let ctx = setup().await;
    let empty = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::empty())
        .unwrap();
    let cases = vec![
        (empty, "Missing request body"),
        (completion_request(json!({}), None), "Missing request body"),
        (
            completion_request(json!({ "model": "gpt-4" }), None),
            "Missing messages",
        ),
        (
            completion_request(json!({ "messages": [] }), None),
            "Missing messages",
        ),
        (
            completion_request(
                json!({ "messages": [{ "role": "assistant", "content": "hi" }] }),
                None,
            ),
            "No user message found",
        ),
    ];
    for (req, message) in cases {
        let (status, _, body) = send(&ctx, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{message}");
        let v: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["error"]["message"], message);
        assert_eq!(v["error"]["type"], "invalid_request_error");
    }
    assert_eq!(ctx.mock.creates.load(Ordering::SeqCst), 0);
    assert!(ctx.state.sessions.is_empty());
}

#[tokio::test]
async fn failed_backend_chat_creation_is_500() {
    let ctx = setup().await;
    ctx.mock.fail_create.store(true, Ordering::SeqCst);
    let (status, _, v) = chat(&ctx, "gpt-4", "hi", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(v["error"]["message"], "Failed to create AnuNeko session");
    assert_eq!(v["error"]["type"], "api_error");
    assert!(ctx.mock.turns().is_empty());
}

#[tokio::test]
async fn sessions_can_be_listed_and_deleted() {
    let ctx = setup().await;
    let (_, session_id, _) = chat(&ctx, "gpt-4", "hi", None).await;

    let (status, body) = get(&ctx, "/sessions").await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    let sessions = v["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], session_id.as_str());
    assert_eq!(sessions[0]["model"], "gpt-4");
    assert_eq!(sessions[0]["has_anuneko_chat"], true);
    assert!(sessions[0]["created_at"].is_number());

    let delete = |path: String| {
        Request::builder()
            .method("DELETE")
            .uri(path)
            .body(Body::empty())
            .unwrap()
    };
    let (status, _, body) = send(&ctx, delete(format!("/sessions/{session_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["message"], "Session deleted successfully");

    let (status, _, body) = send(&ctx, delete(format!("/api/sessions/{session_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        v,
        json!({ "error": { "message": "Session not found", "type": "not_found" } })
    );

    let (_, body) = get(&ctx, "/api/sessions").await;
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["sessions"], json!([]));
}

#[tokio::test]
async fn models_are_listed_on_both_prefixes() {
    let ctx = setup().await;
    for path in ["/v1/models", "/api/v1/models"] {
        let (status, body) = get(&ctx, path).await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["object"], "list");
        let ids: Vec<&str> = v["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["gpt-3.5-turbo", "gpt-4"]);
        assert_eq!(v["data"][1]["owned_by"], "anuneko-exotic-shorthair");
    }
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let ctx = setup().await;
    let (status, body) = get(&ctx, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(v["status"], "healthy");
    assert!(v["timestamp"].is_i64());

    let (status, body) = get(&ctx, "/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let v: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(
        v,
        json!({ "error": { "message": "Not found", "type": "not_found" } })
    );
}

#[tokio::test]
async fn request_id_is_propagated() {
    let ctx = setup().await;
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (_, headers, _) = send(&ctx, req).await;
    assert!(headers.contains_key("x-request-id"));
}
