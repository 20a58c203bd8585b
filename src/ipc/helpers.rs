use rusqlite::Connection;
use serde_json::{Map, Value};

use super::error::HandlerError;
use super::types::AppState;

pub fn db(state: &AppState) -> Result<&Connection, HandlerError> {
    state.db.as_ref().ok_or(HandlerError::NoWorkspace)
}

pub fn require_str(params: &Value, key: &str) -> Result<String, HandlerError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerError::BadParams(format!("missing {key}")))
}

pub fn opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn opt_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

pub fn opt_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

pub fn require_obj(params: &Value, key: &str) -> Result<Map<String, Value>, HandlerError> {
    params
        .get(key)
        .and_then(|v| v.as_object())
        .cloned()
        .ok_or_else(|| HandlerError::BadParams(format!("missing object {key}")))
}

pub fn str_list(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}
