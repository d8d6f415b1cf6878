use crate::json_repair::{self, MalformedToolArguments};
use axum::body::Bytes;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Placeholder used when tool call arguments are missing or cannot be repaired
const EMPTY_ARGUMENTS: &str = "{}";

/// A chat completion ready to hand back to the client
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResponse {
    pub body: Bytes,
    /// Tool calls seen across all choices
    pub tool_calls: usize,
    /// Tool calls whose arguments were rewritten into valid JSON
    pub repaired: usize,
    /// At least one tool call had irreparable arguments and now carries `{}`
    pub degraded: bool,
}

/// Response normalizer for non-streaming chat completion responses
///
/// Makes backend output safe for strict OpenAI clients by:
/// - Repairing tool call `arguments` that are not valid JSON
/// - Forcing `content` to `null` on any message that carries tool calls
/// - Optionally rewriting the model field to match the client's original request
///
/// Message content is never inspected. When nothing needs changing the original bytes are
/// returned untouched. Otherwise the body is re-encoded with its key order kept; string values
/// stay equal but their escaping may differ from the backend's.
#[derive(Debug, Clone, Default)]
pub struct ResponseNormalizer {
    /// The model name originally requested by the client
    pub original_model: Option<String>,
}

impl ResponseNormalizer {
    pub fn normalize(&self, raw: Bytes) -> NormalizedResponse {
        let mut outcome = NormalizedResponse {
            body: Bytes::new(),
            tool_calls: 0,
            repaired: 0,
            degraded: false,
        };

        let mut completion: Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Backend response is not JSON, passing through");
                outcome.body = raw;
                return outcome;
            }
        };

        let mut modified = false;

        if let Some(choices) = completion.get_mut("choices").and_then(Value::as_array_mut) {
            for message in choices
                .iter_mut()
                .filter_map(|choice| choice.get_mut("message"))
                .filter_map(Value::as_object_mut)
            {
                modified |= normalize_message(message, &mut outcome);
            }
        }

        if let Some(ref original) = self.original_model
            && let Some(model) = completion.get_mut("model")
            && model.as_str() != Some(original.as_str())
        {
            *model = Value::String(original.clone());
            modified = true;
        }

        if !modified {
            outcome.body = raw;
            return outcome;
        }

        outcome.body = match serde_json::to_vec(&completion) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "Failed to serialize normalized response, passing through");
                raw
            }
        };

        if outcome.degraded {
            warn!(
                tool_calls = outcome.tool_calls,
                repaired = outcome.repaired,
                "Degraded response: tool call arguments replaced with empty object"
            );
        }
        outcome
    }
}

/// Returns true if the message was changed.
fn normalize_message(message: &mut Map<String, Value>, outcome: &mut NormalizedResponse) -> bool {
    let Some(calls) = message
        .get_mut("tool_calls")
        .and_then(Value::as_array_mut)
        .filter(|calls| !calls.is_empty())
    else {
        return false;
    };

    let mut modified = false;
    for call in calls.iter_mut() {
        outcome.tool_calls += 1;
        let id = call.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        let Some(function) = call.get_mut("function").and_then(Value::as_object_mut) else {
            continue;
        };
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let replacement = match function.get("arguments") {
            Some(Value::String(raw)) if raw.trim().is_empty() => Some(EMPTY_ARGUMENTS.to_string()),
            Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
                Ok(_) => None,
                Err(_) => Some(repair_arguments(raw, &id, &name, outcome)),
            },
            // Some backends emit the object itself instead of a JSON string
            Some(Value::Object(_) | Value::Array(_)) => {
                function.get("arguments").map(Value::to_string)
            }
            Some(_) | None => Some(EMPTY_ARGUMENTS.to_string()),
        };

        if let Some(arguments) = replacement {
            function.insert("arguments".to_string(), Value::String(arguments));
            modified = true;
        }
    }

    // Strict clients expect no content alongside tool calls
    if message.get("content").is_some_and(|content| !content.is_null()) {
        debug!("Nulling content on message with tool calls");
        modified = true;
    }
    if !message.contains_key("content") {
        modified = true;
    }
    message.insert("content".to_string(), Value::Null);

    modified
}

fn repair_arguments(raw: &str, id: &str, name: &str, outcome: &mut NormalizedResponse) -> String {
    match json_repair::repair(raw) {
        Ok(value) => {
            info!(tool = %name, call_id = %id, "Repaired JSON in tool call arguments");
            outcome.repaired += 1;
            value.to_string()
        }
        Err(MalformedToolArguments { reason }) => {
            warn!(tool = %name, call_id = %id, reason = %reason, "Tool call arguments irreparable");
            outcome.degraded = true;
            EMPTY_ARGUMENTS.to_string()
        }
    }
}
