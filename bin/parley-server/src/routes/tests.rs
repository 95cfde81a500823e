use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::config::Config;
use crate::entities::{ChatStore, MessageStore, UserStore};
use crate::routes;
use crate::services::search::SearchIndex;
use crate::testing::{
    FailingIndex, RecordingIndex, ScriptedBackend, TEST_PASSWORD, TestApp, seed_chat_with, test_app,
};

async fn app_with(backend: Arc<ScriptedBackend>, search: Arc<dyn SearchIndex>) -> TestApp {
    test_app(backend, search, Config::default()).await
}

async fn call(app: &TestApp, req: Request<Body>) -> Response {
    routes::build(app.state.clone()).oneshot(req).await.unwrap()
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Payloads of the `data:` records of an SSE body.
fn sse_payloads(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn first_message_creates_chat_and_returns_reply() {
    let backend = Arc::new(ScriptedBackend::replying(&["Hi", " there"]));
    let app = app_with(backend.clone(), Arc::new(RecordingIndex::default())).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            "/chats",
            json!({
                "user_id": app.user.id,
                "model_id": "llama3.1:latest",
                "initial_message": "Hello",
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["chat"]["message_count"], 2);
    assert_eq!(body["chat"]["title"], "New Chat");
    assert_eq!(body["user_message"]["content"], "Hello");
    assert_eq!(body["response"]["role"], "assistant");
    assert_eq!(body["response"]["content"], "Hi there");

    let chat_id = body["chat"]["id"].as_str().unwrap().to_owned();
    let response = call(&app, get(&format!("/chats/{chat_id}/messages"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let messages = body_json(response).await;
    let roles: Vec<_> = messages
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(roles, ["user", "assistant"]);
    assert_eq!(backend.calls()[0].0, "llama3.1:latest");
}

#[tokio::test]
async fn streamed_reply_matches_stored_message() {
    let backend = Arc::new(ScriptedBackend::replying(&["The ", "answer ", "is 42"]));
    let app = app_with(backend, Arc::new(RecordingIndex::default())).await;
    let chat = seed_chat_with(&app.store, &app.user.id).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            &format!("/chats/{}/messages", chat.id),
            json!({ "message": "What is the answer?", "stream": true }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let payloads = sse_payloads(&body_text(response).await);
    assert_eq!(payloads.last(), Some(&json!({ "done": true })));
    let relayed: String = payloads
        .iter()
        .filter_map(|p| p["chunk"].as_str())
        .collect();
    assert_eq!(relayed, "The answer is 42");

    let messages = app.store.list_messages(&chat.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, relayed);
}

#[tokio::test]
async fn failed_stream_ends_with_error_event() {
    let backend = Arc::new(ScriptedBackend::failing_after(&["par", "tial"], "model crashed"));
    let app = app_with(backend, Arc::new(RecordingIndex::default())).await;
    let chat = seed_chat_with(&app.store, &app.user.id).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            &format!("/chats/{}/messages", chat.id),
            json!({ "message": "go", "stream": true }),
        ),
    )
    .await;
    let payloads = sse_payloads(&body_text(response).await);
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[0], json!({ "chunk": "par" }));
    assert!(payloads[2]["error"].is_string());
    assert!(payloads.iter().all(|p| p.get("done").is_none()));
}

#[tokio::test]
async fn non_streamed_send_returns_created_turn() {
    let backend = Arc::new(ScriptedBackend::replying(&["ok"]));
    let app = app_with(backend, Arc::new(RecordingIndex::default())).await;
    let chat = seed_chat_with(&app.store, &app.user.id).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            &format!("/chats/{}/messages", chat.id),
            json!({ "message": "ping", "stream": false }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["response"]["content"], "ok");
    assert_eq!(body["chat"]["message_count"], 2);
}

#[tokio::test]
async fn unknown_chat_is_404_without_side_effects() {
    let backend = Arc::new(ScriptedBackend::replying(&["never"]));
    let index = Arc::new(RecordingIndex::default());
    let app = app_with(backend.clone(), index.clone()).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            "/chats/does-not-exist/messages",
            json!({ "message": "hello?" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"].is_string());

    assert!(backend.calls().is_empty());
    assert!(app.store.list_messages("does-not-exist").await.unwrap().is_empty());
    assert!(index.indexed_ids().is_empty());

    let response = call(&app, get("/chats/does-not-exist/messages")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_message_field_is_400() {
    let backend = Arc::new(ScriptedBackend::replying(&["never"]));
    let app = app_with(backend.clone(), Arc::new(RecordingIndex::default())).await;
    let chat = seed_chat_with(&app.store, &app.user.id).await;

    let response = call(
        &app,
        json_request(Method::POST, &format!("/chats/{}/messages", chat.id), json!({})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = call(
        &app,
        json_request(
            Method::POST,
            &format!("/chats/{}/messages", chat.id),
            json!({ "message": "   " }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn delete_removes_chat_messages_and_index_entries() {
    let backend = Arc::new(ScriptedBackend::replying(&["sure"]));
    let index = Arc::new(RecordingIndex::default());
    let app = app_with(backend, index.clone()).await;
    let chat = seed_chat_with(&app.store, &app.user.id).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            &format!("/chats/{}/messages", chat.id),
            json!({ "message": "remember this", "stream": false }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/chats/{}", chat.id))
        .body(Body::empty())
        .unwrap();
    let response = call(&app, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert!(app.store.get_chat(&chat.id).await.unwrap().is_none());
    assert!(app.store.list_messages(&chat.id).await.unwrap().is_empty());
    let removed = index.clone();
    let chat_id = chat.id.clone();
    eventually(move || removed.removed_chats().contains(&chat_id)).await;

    let again = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/chats/{}", chat.id))
        .body(Body::empty())
        .unwrap();
    assert_eq!(call(&app, again).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failing_index_does_not_affect_turns() {
    let backend = Arc::new(ScriptedBackend::replying(&["fine"]));
    let index = Arc::new(FailingIndex::default());
    let app = app_with(backend, index.clone()).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            "/chats",
            json!({
                "user_id": app.user.id,
                "model_id": "mistral:latest",
                "initial_message": "index me",
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["response"]["content"], "fine");

    let failing = index.clone();
    eventually(move || failing.calls() > 0).await;

    let response = call(&app, get("/search?q=index")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn search_finds_indexed_messages() {
    let backend = Arc::new(ScriptedBackend::replying(&["Paris is the capital"]));
    let index = Arc::new(RecordingIndex::default());
    let app = app_with(backend, index.clone()).await;
    let chat = seed_chat_with(&app.store, &app.user.id).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            &format!("/chats/{}/messages", chat.id),
            json!({ "message": "capital of France?", "stream": false }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let indexed = index.clone();
    eventually(move || indexed.indexed_ids().len() == 2).await;

    let response = call(&app, get("/search?q=Paris")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let hits = body_json(response).await;
    assert_eq!(hits.as_array().unwrap().len(), 1);
    assert_eq!(hits[0]["chat_id"], chat.id.as_str());
}

#[tokio::test]
async fn blank_search_is_400() {
    let backend = Arc::new(ScriptedBackend::replying(&[]));
    let app = app_with(backend, Arc::new(RecordingIndex::default())).await;

    assert_eq!(call(&app, get("/search")).await.status(), StatusCode::BAD_REQUEST);
    assert_eq!(call(&app, get("/search?q=%20")).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn models_lists_the_catalog() {
    let backend = Arc::new(ScriptedBackend::replying(&[]));
    let app = app_with(backend, Arc::new(RecordingIndex::default())).await;

    let response = call(&app, get("/models")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let models = body_json(response).await;
    let names: Vec<_> = models
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["model_name"].as_str().unwrap().to_owned())
        .collect();
    assert!(names.contains(&"granite3.3:latest".to_owned()));
    assert_eq!(names.len(), 3);
}

#[tokio::test]
async fn login_accepts_only_matching_password() {
    let backend = Arc::new(ScriptedBackend::replying(&[]));
    let app = app_with(backend, Arc::new(RecordingIndex::default())).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            "/login",
            json!({ "username": "ada", "password": TEST_PASSWORD }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["user"]["id"], app.user.id.as_str());
    assert!(body["user"].get("password_digest").is_none());

    for (username, password) in [("ada", "wrong password"), ("nobody", TEST_PASSWORD)] {
        let response = call(
            &app,
            json_request(
                Method::POST,
                "/login",
                json!({ "username": username, "password": password }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["error"],
            "invalid username or password"
        );
    }
}

#[tokio::test]
async fn admin_routes_require_the_token() {
    let backend = Arc::new(ScriptedBackend::replying(&[]));
    let config = Config {
        admin_token: Some("s3cret".into()),
        ..Config::default()
    };
    let app = test_app(backend, Arc::new(RecordingIndex::default()), config).await;

    let body = json!({ "model_name": "qwen2.5:7b", "label": "Qwen 2.5" });
    let response = call(&app, json_request(Method::POST, "/admin/models", body.clone())).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let with_token = |body: Value, token: &str| {
        let mut req = json_request(Method::POST, "/admin/models", body);
        req.headers_mut()
            .insert(header::AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        req
    };
    for wrong in ["s3creT", "s3cret-and-more", ""] {
        let response = call(&app, with_token(body.clone(), wrong)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "token {wrong:?}");
    }
    assert_eq!(call(&app, with_token(body.clone(), "s3cret")).await.status(), StatusCode::CREATED);
    assert_eq!(call(&app, with_token(body, "s3cret")).await.status(), StatusCode::CONFLICT);

    let models = body_json(call(&app, get("/models")).await).await;
    assert!(
        models
            .as_array()
            .unwrap()
            .iter()
            .any(|m| m["model_name"] == "qwen2.5:7b")
    );
}

#[tokio::test]
async fn admin_can_create_a_user_who_can_log_in() {
    let backend = Arc::new(ScriptedBackend::replying(&[]));
    let app = app_with(backend, Arc::new(RecordingIndex::default())).await;

    let user = json!({
        "username": "grace",
        "email": "grace@example.com",
        "password": "hopper-1906",
    });
    let response = call(&app, json_request(Method::POST, "/admin/users", user.clone())).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        call(&app, json_request(Method::POST, "/admin/users", user)).await.status(),
        StatusCode::CONFLICT
    );

    let stored = app
        .store
        .find_user_by_username("grace")
        .await
        .unwrap()
        .unwrap();
    assert!(stored.password_digest.starts_with("$2b$"));
    assert!(!stored.password_digest.contains("hopper-1906"));

    let response = call(
        &app,
        json_request(
            Method::POST,
            "/login",
            json!({ "username": "grace", "password": "hopper-1906" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_and_docs_are_served() {
    let backend = Arc::new(ScriptedBackend::replying(&[]));
    let app = app_with(backend, Arc::new(RecordingIndex::default())).await;

    let response = call(&app, get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["fanout"]["dropped"], 0);

    let response = call(&app, get("/api-docs/openapi.json")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["paths"]["/chats"].is_object());
}

#[tokio::test]
async fn failed_first_turn_creates_no_chat() {
    let backend = Arc::new(ScriptedBackend::replying(&["Hi"]));
    let app = app_with(backend.clone(), Arc::new(RecordingIndex::default())).await;

    backend.refuse_next(503);
    let response = call(
        &app,
        json_request(
            Method::POST,
            "/chats",
            json!({
                "user_id": app.user.id,
                "model_id": "llama3.1:latest",
                "initial_message": "Hello",
            }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        body_json(response).await["error"],
        "inference backend rejected the request (503)"
    );

    let response = call(&app, get(&format!("/chats?user_id={}", app.user.id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
    assert!(app.store.list_chats(&app.user.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn sse_disconnect_keeps_only_the_delivered_reply() {
    let backend = Arc::new(ScriptedBackend::endless());
    let app = app_with(backend.clone(), Arc::new(RecordingIndex::default())).await;
    let chat = seed_chat_with(&app.store, &app.user.id).await;

    let response = call(
        &app,
        json_request(
            Method::POST,
            &format!("/chats/{}/messages", chat.id),
            json!({ "message": "Tell me everything", "stream": true }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let first = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert_eq!(sse_payloads(&first), vec![json!({ "chunk": "more " })]);

    // The backend keeps producing into the relay buffer until the client goes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(body);

    let mut stored = Vec::new();
    for _ in 0..200 {
        stored = app.store.list_messages(&chat.id).await.unwrap();
        if stored.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored.len(), 2, "partial reply stored");
    assert_eq!(stored[1].content, "more ");
    assert!(backend.stream_dropped());
}

#[tokio::test]
async fn malformed_query_strings_get_a_json_400() {
    let backend = Arc::new(ScriptedBackend::replying(&[]));
    let app = app_with(backend, Arc::new(RecordingIndex::default())).await;

    for uri in ["/chats", "/search?q=paris&limit=abc"] {
        let response = call(&app, get(uri)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json",
            "{uri}"
        );
        let body = body_json(response).await;
        assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()), "{uri}");
    }
}
