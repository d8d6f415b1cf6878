//! llm-switch - a model-switching proxy for inference servers sharing one GPU
//!
//! Several model servers are configured as supervisor units, but only one fits in accelerator
//! memory at a time. Clients talk to a single OpenAI-compatible endpoint; the proxy stops
//! whichever unit is resident, starts the one serving the requested model, waits until it
//! answers its health check, forwards the request and repairs malformed tool calls in the
//! reply.

use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderValue, StatusCode, header};
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub mod client;
pub mod config;
pub mod errors;
pub mod forwarder;
pub mod handlers;
pub mod json_repair;
pub mod model_switcher;
pub mod models;
pub mod registry;
pub mod response_normalizer;

use client::{HttpClient, HyperClient};
use config::Config;
use errors::SwitchError;
use forwarder::Forwarder;
use handlers::{chat_completions, models as models_handler};
use model_switcher::{HealthProber, ModelSwitcher, ProcessSupervisor, SystemdSupervisor};
use registry::ModelRegistry;
use response_normalizer::ResponseNormalizer;

/// The main application state: the registry, the switcher guarding the GPU and the forwarder
#[derive(Debug)]
pub struct AppState<T: HttpClient> {
    pub registry: Arc<ModelRegistry>,
    pub switcher: ModelSwitcher,
    pub forwarder: Forwarder<T>,
    /// Replace the backend's `model` field with the id the client asked for
    pub rewrite_model: bool,
}

impl<T: HttpClient> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            switcher: self.switcher.clone(),
            forwarder: self.forwarder.clone(),
            rewrite_model: self.rewrite_model,
        }
    }
}

/// A buffered chat completion, normalized when the backend succeeded
#[derive(Debug, Clone)]
pub struct ChatCompletionReply {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
    pub degraded: bool,
}

impl AppState<HyperClient> {
    /// Build the production stack: systemd units, pooled hyper client
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let registry = Arc::new(config.build_registry()?);
        let supervisor = Arc::new(SystemdSupervisor::new(
            config.supervisor.systemctl.clone(),
            config.supervisor.user,
        ));
        let http_client = Arc::new(client::create_hyper_client());
        Ok(Self::with_parts(registry, supervisor, http_client, config))
    }
}

impl<T: HttpClient + 'static> AppState<T> {
    /// Assemble the state from explicit parts (useful for testing)
    pub fn with_parts(
        registry: Arc<ModelRegistry>,
        supervisor: Arc<dyn ProcessSupervisor>,
        http_client: Arc<T>,
        config: &Config,
    ) -> Self {
        let settings = &config.switch;
        let prober = HealthProber::new(Arc::clone(&http_client))
            .with_path(settings.readiness_path.clone())
            .with_interval(settings.probe_interval())
            .with_call_timeout(settings.probe_timeout());
        let switcher = ModelSwitcher::new(
            Arc::clone(&registry),
            supervisor,
            Arc::new(prober),
            settings.switcher_config(),
        );
        let forwarder = Forwarder::new(http_client, settings.forward_timeout());

        Self {
            registry,
            switcher,
            forwarder,
            rewrite_model: settings.rewrite_model,
        }
    }

    /// Ids of every configured model
    pub fn list_models(&self) -> Vec<String> {
        self.registry.list_models()
    }

    /// Activate the backend for `model_id`, forward `body` to it and normalize the reply.
    pub async fn handle_chat_completion(
        &self,
        model_id: &str,
        body: Value,
    ) -> Result<ChatCompletionReply, SwitchError> {
        let lease = self.switcher.acquire(model_id).await?;
        let raw = self.forwarder.forward(lease.state(), body).await?;
        drop(lease);

        let content_type = raw.headers.get(header::CONTENT_TYPE).cloned();
        if !raw.status.is_success() {
            warn!(model = %model_id, status = %raw.status, "Backend returned an error status");
            return Ok(ChatCompletionReply {
                status: raw.status,
                content_type,
                body: raw.body,
                degraded: false,
            });
        }

        let normalizer = ResponseNormalizer {
            original_model: self.rewrite_model.then(|| model_id.to_string()),
        };
        let normalized = normalizer.normalize(raw.body);

        Ok(ChatCompletionReply {
            status: raw.status,
            content_type,
            body: normalized.body,
            degraded: normalized.degraded,
        })
    }
}

/// Build the main router for the proxy
/// This creates routes for:
/// - `/v1/models` - Returns configured models
/// - `/v1/chat/completions` - Switches to the requested model and forwards
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/models", get(models_handler))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}

#[doc(hidden)]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    type Handler =
        dyn Fn(&MockRequest) -> Result<axum::response::Response, String> + Send + Sync;

    /// Records every request and answers through a handler closure.
    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        handler: Arc<Handler>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    pub fn json_response(status: StatusCode, body: &str) -> axum::response::Response {
        axum::response::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    impl MockHttpClient {
        /// Answer every request with the same status and body.
        pub fn new(status: StatusCode, body: &str) -> Self {
            let body = body.to_string();
            Self::with_handler(move |_| Ok(json_response(status, &body)))
        }

        /// Fail every request at the transport level.
        pub fn failing(reason: &str) -> Self {
            let reason = reason.to_string();
            Self::with_handler(move |_| Err(reason.clone()))
        }

        pub fn with_handler(
            handler: impl Fn(&MockRequest) -> Result<axum::response::Response, String>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                handler: Arc::new(handler),
            }
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("handler", &"<closure>")
                .finish()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            // Extract request details
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            // Read body
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            let mock_request = MockRequest {
                method,
                uri,
                headers,
                body,
            };
            let result = (self.handler)(&mock_request);
            self.requests.lock().unwrap().push(mock_request);

            result.map_err(|reason| reason.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_switcher::SupervisorError;
    use crate::registry::ModelEntry;
    use async_trait::async_trait;
    use axum_test::TestServer;
    use serde_json::json;
    use std::sync::Mutex;
    use test_utils::{MockHttpClient, json_response};

    #[derive(Debug, Default)]
    struct RecordingSupervisor {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessSupervisor for RecordingSupervisor {
        async fn start(&self, unit: &str) -> Result<(), SupervisorError> {
            self.calls.lock().unwrap().push(format!("start {unit}"));
            Ok(())
        }

        async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
            self.calls.lock().unwrap().push(format!("stop {unit}"));
            Ok(())
        }

        async fn is_active(&self, _unit: &str) -> Result<bool, SupervisorError> {
            Ok(false)
        }
    }

    fn test_config() -> Config {
        serde_json::from_value(json!({
            "server": {"backend_url": "http://localhost:3004"},
            "models": {
                "coder": "coder.service",
                "thinking": "thinking.service"
            },
            "switch": {"ready_timeout_secs": 1, "probe_interval_ms": 10}
        }))
        .unwrap()
    }

    fn state_with(
        client: MockHttpClient,
    ) -> (AppState<MockHttpClient>, Arc<RecordingSupervisor>, Arc<MockHttpClient>) {
        let config = test_config();
        let registry = Arc::new(config.build_registry().unwrap());
        let supervisor = Arc::new(RecordingSupervisor::default());
        let client = Arc::new(client);
        let state = AppState::with_parts(
            registry,
            Arc::clone(&supervisor) as Arc<dyn ProcessSupervisor>,
            Arc::clone(&client),
            &config,
        );
        (state, supervisor, client)
    }

    /// Healthy on GET, answers completions with `completion`.
    fn backend(completion: &'static str) -> MockHttpClient {
        MockHttpClient::with_handler(move |req| {
            if req.method == "GET" {
                Ok(json_response(StatusCode::OK, r#"{"status": "ok"}"#))
            } else {
                Ok(json_response(StatusCode::OK, completion))
            }
        })
    }

    #[tokio::test]
    async fn test_list_models() {
        let (state, supervisor, _) = state_with(backend("{}"));
        assert_eq!(state.list_models(), vec!["coder", "thinking"]);

        let server = TestServer::new(build_router(state)).unwrap();
        let response = server.get("/v1/models").await;
        assert_eq!(response.status_code(), 200);

        let body: serde_json::Value = response.json();
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "coder");
        assert_eq!(body["data"][1]["object"], "model");
        assert!(supervisor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handle_chat_completion_switches_and_normalizes() {
        let (state, supervisor, client) = state_with(backend(
            r#"{"model":"x","choices":[{"message":{"content":"sure","tool_calls":[{"id":"c1","function":{"name":"f","arguments":"{\"a\": 1"}}]}}]}"#,
        ));

        let reply = state
            .handle_chat_completion("coder", json!({"model": "coder", "stream": true}))
            .await
            .unwrap();

        assert_eq!(reply.status, StatusCode::OK);
        assert!(!reply.degraded);
        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert!(body["choices"][0]["message"]["content"].is_null());
        assert_eq!(
            body["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"],
            r#"{"a":1}"#
        );

        assert_eq!(
            *supervisor.calls.lock().unwrap(),
            vec!["start coder.service".to_string()]
        );
        let requests = client.get_requests();
        let post = requests.iter().find(|r| r.method == "POST").unwrap();
        assert_eq!(post.uri, "http://localhost:3004/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_backend_error_status_passed_through() {
        let client = MockHttpClient::with_handler(|req| {
            if req.method == "GET" {
                Ok(json_response(StatusCode::OK, "{}"))
            } else {
                Ok(json_response(StatusCode::BAD_REQUEST, r#"{"error": "context too long"}"#))
            }
        });
        let (state, _, _) = state_with(client);

        let reply = state
            .handle_chat_completion("coder", json!({"model": "coder"}))
            .await
            .unwrap();

        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.body, Bytes::from_static(br#"{"error": "context too long"}"#));
    }

    #[tokio::test]
    async fn test_model_rewrite_when_enabled() {
        let (mut state, _, _) = state_with(backend(
            r#"{"model":"/models/qwen.gguf","choices":[{"message":{"content":"hi"}}]}"#,
        ));
        state.rewrite_model = true;

        let reply = state
            .handle_chat_completion("coder", json!({"model": "coder"}))
            .await
            .unwrap();

        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body["model"], "coder");
    }

    #[tokio::test]
    async fn test_registry_entries_from_config() {
        let registry = test_config().build_registry().unwrap();
        assert_eq!(
            registry.resolve("thinking").unwrap(),
            &ModelEntry::builder()
                .model_id("thinking".to_string())
                .unit_name("thinking.service".to_string())
                .base_url("http://localhost:3004".parse().unwrap())
                .build()
        );
    }
}
