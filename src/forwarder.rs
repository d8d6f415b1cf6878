/// Forwards chat completion requests to the active backend and buffers the full reply.
///
/// Streaming is always switched off on the way out: the normalizer needs the complete payload
/// to repair tool calls.
use crate::client::HttpClient;
use crate::errors::SwitchError;
use crate::model_switcher::ActiveBackendState;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument};

const CHAT_COMPLETIONS_PATH: &str = "v1/chat/completions";

/// The backend's reply, fully read.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct Forwarder<C: HttpClient> {
    client: Arc<C>,
    timeout: Duration,
}

impl<C: HttpClient> Clone for Forwarder<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            timeout: self.timeout,
        }
    }
}

impl<C: HttpClient> Forwarder<C> {
    pub fn new(client: Arc<C>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Send `body` to the active backend and read the whole response.
    ///
    /// Fails with [`SwitchError::BackendUnreachable`] on any transport error, including the
    /// transport timeout. Non-2xx statuses are not errors here.
    #[instrument(skip(self, active, body), fields(unit = ?active.unit_name))]
    pub async fn forward(
        &self,
        active: &ActiveBackendState,
        mut body: Value,
    ) -> Result<RawResponse, SwitchError> {
        let unit = active.unit_name.clone().unwrap_or_default();
        let unreachable_error = |reason: String| SwitchError::BackendUnreachable {
            unit: unit.clone(),
            reason,
        };

        let base_url = active
            .base_url
            .as_ref()
            .ok_or_else(|| unreachable_error("no active backend".to_string()))?;
        let upstream = base_url
            .join(CHAT_COMPLETIONS_PATH)
            .map_err(|e| unreachable_error(format!("invalid backend url: {}", e)))?;

        force_non_streaming(&mut body);
        let payload = serde_json::to_vec(&body)
            .map_err(|e| unreachable_error(format!("encode failed: {}", e)))?;

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(upstream.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, payload.len());
        // Update the host header to match the backend
        if let Some(host) = upstream.host_str() {
            let host_value = match upstream.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            builder = builder.header(header::HOST, host_value);
        }
        let request = builder
            .body(axum::body::Body::from(payload))
            .map_err(|e| unreachable_error(format!("failed to build request: {}", e)))?;

        debug!(url = %upstream, "Forwarding request");

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| e.to_string())?;
            let (parts, body) = response.into_parts();
            let body = axum::body::to_bytes(body, usize::MAX)
                .await
                .map_err(|e| format!("failed to read body: {}", e))?;
            Ok::<_, String>(RawResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => {
                debug!(status = %response.status, bytes = response.body.len(), "Backend replied");
                Ok(response)
            }
            Ok(Err(reason)) => {
                error!(url = %upstream, error = %reason, "Error forwarding request to backend");
                Err(unreachable_error(reason))
            }
            Err(_) => {
                error!(url = %upstream, timeout = ?self.timeout, "Backend did not reply in time");
                Err(unreachable_error(format!("no reply within {:?}", self.timeout)))
            }
        }
    }
}

/// Force `"stream": false` and drop options that only apply to streams.
fn force_non_streaming(body: &mut Value) {
    if let Some(object) = body.as_object_mut() {
        object.insert("stream".to_string(), Value::Bool(false));
        object.remove("stream_options");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockHttpClient;
    use serde_json::json;

    fn active(url: &str) -> ActiveBackendState {
        ActiveBackendState {
            unit_name: Some("coder.service".to_string()),
            base_url: Some(url.parse().unwrap()),
            ready: true,
            last_switched_at: None,
        }
    }

    #[tokio::test]
    async fn test_forces_non_streaming() {
        let client = Arc::new(MockHttpClient::new(StatusCode::OK, r#"{"choices": []}"#));
        let forwarder = Forwarder::new(Arc::clone(&client), Duration::from_secs(5));

        let body = json!({
            "model": "coder",
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": [{"role": "user", "content": "Hi"}]
        });
        let response = forwarder
            .forward(&active("http://localhost:3004"), body)
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(br#"{"choices": []}"#));

        let requests = client.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].uri, "http://localhost:3004/v1/chat/completions");

        let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["stream"], false);
        assert!(sent.get("stream_options").is_none());
        assert_eq!(sent["messages"][0]["content"], "Hi");

        let host = requests[0]
            .headers
            .iter()
            .find(|(key, _)| key == "host")
            .map(|(_, value)| value.as_str());
        assert_eq!(host, Some("localhost:3004"));
    }

    #[tokio::test]
    async fn test_stream_added_when_absent() {
        let client = Arc::new(MockHttpClient::new(StatusCode::OK, "{}"));
        let forwarder = Forwarder::new(Arc::clone(&client), Duration::from_secs(5));

        forwarder
            .forward(&active("http://localhost:3004"), json!({"model": "coder"}))
            .await
            .unwrap();

        let sent: Value = serde_json::from_slice(&client.get_requests()[0].body).unwrap();
        assert_eq!(sent["stream"], false);
    }

    #[tokio::test]
    async fn test_error_status_is_returned_not_raised() {
        let client = Arc::new(MockHttpClient::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error": "oom"}"#,
        ));
        let forwarder = Forwarder::new(client, Duration::from_secs(5));

        let response = forwarder
            .forward(&active("http://localhost:3004"), json!({}))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_transport_failure_is_unreachable() {
        let client = Arc::new(MockHttpClient::failing("connection refused"));
        let forwarder = Forwarder::new(client, Duration::from_secs(5));

        let result = forwarder
            .forward(&active("http://localhost:3004"), json!({}))
            .await;

        assert!(matches!(
            result,
            Err(SwitchError::BackendUnreachable { ref unit, ref reason })
                if unit == "coder.service" && reason.contains("connection refused")
        ));
    }

    #[tokio::test]
    async fn test_no_active_backend() {
        let client = Arc::new(MockHttpClient::new(StatusCode::OK, "{}"));
        let forwarder = Forwarder::new(Arc::clone(&client), Duration::from_secs(5));

        let result = forwarder
            .forward(&ActiveBackendState::default(), json!({}))
            .await;

        assert!(matches!(result, Err(SwitchError::BackendUnreachable { .. })));
        assert!(client.get_requests().is_empty());
    }
}
