//! Error classification and the user-facing sanitizing filter.
//!
//! Every error that reaches a UI-facing event goes through [`user_error`] or
//! [`user_error_from`] first, so raw backend detail is never displayed and
//! quota exhaustion can be surfaced distinctly from ordinary failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Shown instead of the raw message whenever a quota error is detected.
pub const QUOTA_MESSAGE: &str = "API quota exhausted, please contact sales to replace your key";

/// Shown for transport failures.
pub const NETWORK_MESSAGE: &str = "Network error, please check the connection and retry";

/// Shown when the backend gave no usable message.
pub const GENERIC_FAILURE_MESSAGE: &str = "Generation failed, please try again later";

// Matched against the lowercased message with all whitespace removed.
const QUOTA_PATTERNS: &[&str] = &[
    "tokenquotaexhausted",
    "remainquota=0",
    "quotaexhausted",
    "insufficientquota",
    "ratelimit",
];

/// Structured error shape handed to UI callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserError {
    pub message: String,
    pub is_quota_error: bool,
}

impl UserError {
    pub fn new(message: impl Into<String>, is_quota_error: bool) -> Self {
        Self {
            message: message.into(),
            is_quota_error,
        }
    }
}

/// Whether `message` reports an exhausted token quota or rate limit.
pub fn is_quota_exhausted(message: &str) -> bool {
    let compact: String = message
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    QUOTA_PATTERNS.iter().any(|p| compact.contains(p))
}

/// Whether an HTTP status indicates the account cannot generate any more.
pub fn is_quota_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429)
}

/// Extract a message from a JSON error body.
///
/// Accepts a bare string, `{"error": {"message"|"msg": ..}}`, or
/// `{"message"|"error"|"msg": ..}`. Unknown shapes fall back to the JSON text.
pub fn extract_message(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(obj) => {
            if let Some(inner) = obj.get("error").and_then(|e| e.as_object()) {
                return inner
                    .get("message")
                    .or_else(|| inner.get("msg"))
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| Value::Object(inner.clone()).to_string());
            }
            ["message", "error", "msg"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
                .map(String::from)
                .unwrap_or_else(|| body.to_string())
        }
        other => other.to_string(),
    }
}

/// Sanitize a raw error message for display.
pub fn user_error(raw: &str) -> UserError {
    if is_quota_exhausted(raw) {
        return UserError::new(QUOTA_MESSAGE, true);
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        UserError::new(GENERIC_FAILURE_MESSAGE, false)
    } else {
        UserError::new(trimmed, false)
    }
}

/// Sanitize a crate error for display, taking the HTTP status into account.
pub fn user_error_from(err: &SyncError) -> UserError {
    match err {
        SyncError::Http { status, body } => {
            let raw = serde_json::from_str::<Value>(body)
                .map(|v| extract_message(&v))
                .unwrap_or_else(|_| body.clone());
            if is_quota_status(*status) || mentions_status(&raw, 429) {
                UserError::new(QUOTA_MESSAGE, true)
            } else {
                user_error(&raw)
            }
        }
        SyncError::Network { .. } => UserError::new(NETWORK_MESSAGE, false),
        other => user_error(&other.to_string()),
    }
}

/// Whether `raw` carries `status` as a standalone number.
fn mentions_status(raw: &str, status: u16) -> bool {
    let code = status.to_string();
    raw.split(|c: char| !c.is_ascii_digit()).any(|token| token == code)
}
