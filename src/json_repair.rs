//! Best-effort repair of almost-JSON emitted by models in tool call arguments
//!
//! Local models regularly cut off the last brace, leave a trailing comma, or wrap the object in a
//! markdown fence. [`repair`] fixes those superficial problems and parses the result. It does not
//! guess at anything structural: text that is still invalid after the pass is rejected.

use serde_json::Value;

/// Arguments that could not be parsed even after repair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed tool arguments: {reason}")]
pub struct MalformedToolArguments {
    pub reason: String,
}

/// Parse `raw` as JSON, repairing it first if needed.
pub fn repair(raw: &str) -> Result<Value, MalformedToolArguments> {
    let text = strip_code_fence(raw.trim());
    if let Ok(value) = serde_json::from_str(text) {
        return Ok(value);
    }

    let start = text
        .find(['{', '['])
        .ok_or_else(|| MalformedToolArguments {
            reason: "no object or array found".to_string(),
        })?;

    let balanced = balance(&text[start..]);
    serde_json::from_str(&balanced).map_err(|e| MalformedToolArguments {
        reason: e.to_string(),
    })
}

/// Remove a surrounding ```json ... ``` fence if present.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop the info string ("json") up to the end of the first line
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Walk the text once, dropping trailing separators and closing whatever is left open.
fn balance(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if closers.last() != Some(&c) {
                    // stray or mismatched closer
                    continue;
                }
                trim_trailing_separator(&mut out);
                closers.pop();
                out.push(c);
                if closers.is_empty() {
                    // top-level value is complete, ignore anything after it
                    return out;
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    trim_trailing_separator(&mut out);
    if out.ends_with(':') {
        out.push_str("null");
    }

    while let Some(closer) = closers.pop() {
        trim_trailing_separator(&mut out);
        out.push(closer);
    }
    out
}

fn trim_trailing_separator(out: &mut String) {
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    if out.ends_with(',') {
        out.pop();
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
    }
}
