use chrono::{DateTime, Utc};
use serde_json::json;

use crate::eligibility::parse_utc;
use crate::ipc::error::err;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new("precondition_failed", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn db(code: &'static str, e: impl std::fmt::Display) -> Self {
        Self::new(code, e.to_string())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub fn get_required_bool(params: &serde_json::Value, key: &str) -> Result<bool, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_required_time(
    params: &serde_json::Value,
    key: &str,
) -> Result<DateTime<Utc>, HandlerErr> {
    let raw = get_required_str(params, key)?;
    parse_utc(&raw).ok_or_else(|| {
        HandlerErr::bad_params(format!("{} must be an RFC 3339 timestamp", key))
            .with_details(json!({ "value": raw }))
    })
}

/// Evaluation instant for derivations. Callers may pin `now` explicitly;
/// absent, the wall clock is used.
pub fn now_param(params: &serde_json::Value) -> Result<DateTime<Utc>, HandlerErr> {
    match params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => parse_utc(raw)
            .ok_or_else(|| HandlerErr::bad_params("now must be an RFC 3339 timestamp")),
        None => Ok(Utc::now()),
    }
}
