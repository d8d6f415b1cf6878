/// Axum handlers for the proxy server
use crate::client::HttpClient;
use crate::errors::ProxyError;
use crate::models::ListModelResponse;
use crate::{AppState, ChatCompletionReply};
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, info, instrument};

const MODEL_OVERRIDE_HEADER: &str = "model-override";

/// Set on responses whose tool call arguments had to be replaced
pub const DEGRADED_HEADER: &str = "x-llm-switch-degraded";

/// Switch to the requested model if needed, then forward the completion request to it
#[instrument(skip(state, headers, body))]
pub async fn chat_completions<T: HttpClient + 'static>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    if body.is_empty() {
        return Err(ProxyError::BadRequest("No data provided".to_string()));
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| ProxyError::BadRequest("Invalid JSON".to_string()))?;

    // Order of precedence for the model:
    // 1. supplied as a header (model-override)
    // 2. Available in the request body as JSON
    let model = match headers.get(MODEL_OVERRIDE_HEADER) {
        Some(value) => {
            let model = value
                .to_str()
                .map_err(|_| ProxyError::BadRequest("Invalid model-override header".to_string()))?;
            debug!("Using model override from header: {}", model);
            model.to_string()
        }
        None => payload
            .get("model")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProxyError::BadRequest("Missing model field".to_string()))?
            .to_string(),
    };

    info!("Received request for model: {}", model);

    let reply = state.handle_chat_completion(&model, payload).await?;
    Ok(reply_response(reply))
}

fn reply_response(reply: ChatCompletionReply) -> Response {
    let mut response = (reply.status, reply.body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        reply
            .content_type
            .unwrap_or_else(|| HeaderValue::from_static("application/json")),
    );
    if reply.degraded {
        headers.insert(DEGRADED_HEADER, HeaderValue::from_static("true"));
    }
    response
}

#[instrument(skip(state))]
pub async fn models<T: HttpClient + 'static>(State(state): State<AppState<T>>) -> impl IntoResponse {
    Json(ListModelResponse::from_registry(&state.registry))
}
