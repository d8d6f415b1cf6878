//! Integration tests for the llm-switch proxy
//!
//! These drive the full router with a recording supervisor and a mock HTTP client standing in
//! for the model servers, covering switching, forwarding, normalization and error mapping.

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use llm_switch::config::Config;
use llm_switch::handlers::DEGRADED_HEADER;
use llm_switch::model_switcher::{ProcessSupervisor, SupervisorError};
use llm_switch::test_utils::{MockHttpClient, json_response};
use llm_switch::{AppState, build_router};
use rstest::rstest;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tower::util::ServiceExt; // for oneshot()

#[derive(Debug, Default)]
struct RecordingSupervisor {
    calls: Mutex<Vec<String>>,
    running: Mutex<HashSet<String>>,
}

impl RecordingSupervisor {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessSupervisor for RecordingSupervisor {
    async fn start(&self, unit: &str) -> Result<(), SupervisorError> {
        self.calls.lock().unwrap().push(format!("start {unit}"));
        self.running.lock().unwrap().insert(unit.to_string());
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        self.calls.lock().unwrap().push(format!("stop {unit}"));
        self.running.lock().unwrap().remove(unit);
        Ok(())
    }

    async fn is_active(&self, unit: &str) -> Result<bool, SupervisorError> {
        Ok(self.running.lock().unwrap().contains(unit))
    }
}

fn config() -> Config {
    serde_json::from_value(json!({
        "server": {"backend_url": "http://localhost:3004"},
        "models": {
            "qwen3-coder": "qwen3-coder.service",
            "gpt-oss": {"unit": "gpt-oss.service", "url": "http://localhost:3005"}
        },
        "switch": {"ready_timeout_secs": 1, "probe_interval_ms": 10, "drain_timeout_secs": 1}
    }))
    .unwrap()
}

fn setup(client: MockHttpClient) -> (TestServer, Arc<RecordingSupervisor>, Arc<MockHttpClient>) {
    let config = config();
    let registry = Arc::new(config.build_registry().unwrap());
    let supervisor = Arc::new(RecordingSupervisor::default());
    let client = Arc::new(client);
    let state = AppState::with_parts(
        registry,
        Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
        Arc::clone(&client),
        &config,
    );
    let server = TestServer::new(build_router(state)).unwrap();
    (server, supervisor, client)
}

/// Every backend is healthy and answers completions with `completion`.
fn healthy_backend(completion: Value) -> MockHttpClient {
    let completion = completion.to_string();
    MockHttpClient::with_handler(move |req| {
        if req.method == "GET" {
            Ok(json_response(StatusCode::OK, r#"{"status": "ok"}"#))
        } else {
            Ok(json_response(StatusCode::OK, &completion))
        }
    })
}

fn text_completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "model": "/models/backend.gguf",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": content}, "finish_reason": "stop"}]
    })
}

#[tokio::test]
async fn test_switch_then_forward() {
    let (server, supervisor, client) = setup(healthy_backend(text_completion("Hello!")));

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({
            "model": "qwen3-coder",
            "stream": true,
            "messages": [{"role": "user", "content": "Hi"}]
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
    assert!(response.headers().get(DEGRADED_HEADER).is_none());

    assert_eq!(supervisor.calls(), vec!["start qwen3-coder.service"]);

    let requests = client.get_requests();
    let post = requests.iter().find(|r| r.method == "POST").unwrap();
    assert_eq!(post.uri, "http://localhost:3004/v1/chat/completions");
    let forwarded: Value = serde_json::from_slice(&post.body).unwrap();
    assert_eq!(forwarded["stream"], false);
    assert_eq!(forwarded["messages"][0]["content"], "Hi");
}

#[tokio::test]
async fn test_switching_models_stops_previous_unit() {
    let (server, supervisor, client) = setup(healthy_backend(text_completion("ok")));

    for model in ["qwen3-coder", "qwen3-coder", "gpt-oss"] {
        let response = server
            .post("/v1/chat/completions")
            .json(&json!({"model": model, "messages": []}))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    assert_eq!(
        supervisor.calls(),
        vec![
            "start qwen3-coder.service",
            "stop qwen3-coder.service",
            "start gpt-oss.service"
        ]
    );

    let last_post = client
        .get_requests()
        .into_iter()
        .filter(|r| r.method == "POST")
        .last()
        .unwrap();
    assert_eq!(last_post.uri, "http://localhost:3005/v1/chat/completions");
}

#[tokio::test]
async fn test_tool_call_arguments_repaired() {
    let (server, _, _) = setup(healthy_backend(json!({
        "model": "m",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": "I'll look that up.",
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "search", "arguments": "{\"query\": \"rust\","}
                }]
            },
            "finish_reason": "tool_calls"
        }]
    })));

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "qwen3-coder", "messages": []}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response.headers().get(DEGRADED_HEADER).is_none());

    let body: Value = response.json();
    let message = &body["choices"][0]["message"];
    assert!(message["content"].is_null());
    let arguments: Value =
        serde_json::from_str(message["tool_calls"][0]["function"]["arguments"].as_str().unwrap())
            .unwrap();
    assert_eq!(arguments, json!({"query": "rust"}));
}

#[tokio::test]
async fn test_irreparable_arguments_mark_response_degraded() {
    let (server, _, _) = setup(healthy_backend(json!({
        "model": "m",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "search", "arguments": "query=rust"}
                }]
            }
        }]
    })));

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "qwen3-coder", "messages": []}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.headers().get(DEGRADED_HEADER).unwrap(), "true");
    let body: Value = response.json();
    assert_eq!(
        body["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"],
        "{}"
    );
}

#[tokio::test]
async fn test_unknown_model_is_not_found() {
    let (server, supervisor, client) = setup(healthy_backend(text_completion("ok")));

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "llama-70b", "messages": []}))
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "model_not_found");
    assert!(supervisor.calls().is_empty());
    assert!(client.get_requests().is_empty());
}

#[tokio::test]
async fn test_model_override_header_wins() {
    let (server, supervisor, _) = setup(healthy_backend(text_completion("ok")));

    let response = server
        .post("/v1/chat/completions")
        .add_header(
            HeaderName::from_static("model-override"),
            HeaderValue::from_static("gpt-oss"),
        )
        .json(&json!({"model": "qwen3-coder", "messages": []}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(supervisor.calls(), vec!["start gpt-oss.service"]);
}

#[tokio::test]
async fn test_list_models_does_not_touch_backends() {
    let (server, supervisor, client) = setup(healthy_backend(text_completion("ok")));

    let response = server.get("/v1/models").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gpt-oss", "qwen3-coder"]);
    assert!(supervisor.calls().is_empty());
    assert!(client.get_requests().is_empty());
}

#[rstest]
#[case::empty_body("", "No data provided")]
#[case::invalid_json("{not json", "Invalid JSON")]
#[case::missing_model(r#"{"messages": []}"#, "Missing model field")]
#[tokio::test]
async fn test_bad_requests(#[case] body: &'static str, #[case] message: &str) {
    let supervisor = Arc::new(RecordingSupervisor::default());
    let config = config();
    let state = AppState::with_parts(
        Arc::new(config.build_registry().unwrap()),
        Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
        Arc::new(healthy_backend(text_completion("ok"))),
        &config,
    );
    let app = build_router(state);

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let error: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(error["error"]["message"], message);
    assert_eq!(error["error"]["type"], "invalid_request_error");
    assert!(supervisor.calls().is_empty());
}

#[tokio::test]
async fn test_backend_never_ready_is_unavailable() {
    let client = MockHttpClient::with_handler(|req| {
        if req.method == "GET" {
            Ok(json_response(StatusCode::SERVICE_UNAVAILABLE, r#"{"status": "loading"}"#))
        } else {
            Ok(json_response(StatusCode::OK, "{}"))
        }
    });
    let (server, supervisor, client) = setup(client);

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "qwen3-coder", "messages": []}))
        .await;

    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "model_switcher_error");
    assert_eq!(supervisor.calls(), vec!["start qwen3-coder.service"]);
    // Nothing was forwarded
    assert!(client.get_requests().iter().all(|r| r.method == "GET"));
}

#[tokio::test]
async fn test_backend_unreachable_after_ready_is_bad_gateway() {
    let client = MockHttpClient::with_handler(|req| {
        if req.method == "GET" {
            Ok(json_response(StatusCode::OK, "{}"))
        } else {
            Err("connection reset by peer".to_string())
        }
    });
    let (server, _, _) = setup(client);

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "qwen3-coder", "messages": []}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json();
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("qwen3-coder.service")
    );
}

#[tokio::test]
async fn test_backend_error_status_passed_through() {
    let client = MockHttpClient::with_handler(|req| {
        if req.method == "GET" {
            Ok(json_response(StatusCode::OK, "{}"))
        } else {
            Ok(json_response(
                StatusCode::BAD_REQUEST,
                r#"{"error": {"message": "context length exceeded"}}"#,
            ))
        }
    });
    let (server, _, _) = setup(client);

    let response = server
        .post("/v1/chat/completions")
        .json(&json!({"model": "qwen3-coder", "messages": []}))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["message"], "context length exceeded");
}
