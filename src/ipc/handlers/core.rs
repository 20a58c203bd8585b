use std::path::PathBuf;

use serde_json::json;

use crate::atomic::TxMode;
use crate::db;
use crate::ipc::error::{respond, HandlerError};
use crate::ipc::helpers::{opt_str, require_str};
use crate::ipc::types::{AppState, Request};

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "health" => health(state),
        "workspace.select" => select_workspace(state, req),
        _ => return None,
    };
    Some(respond(&req.id, out))
}

fn health(state: &AppState) -> Result<serde_json::Value, HandlerError> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state
            .workspace
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
    }))
}

fn select_workspace(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let path = PathBuf::from(require_str(&req.params, "path")?);
    let tx_mode = match opt_str(&req.params, "txMode") {
        Some(token) => TxMode::from_token(&token)
            .ok_or_else(|| HandlerError::BadParams(format!("unknown txMode '{token}'")))?,
        None => TxMode::Auto,
    };

    let conn = db::open_db(&path)
        .map_err(|e| HandlerError::BadParams(format!("could not open workspace: {e:?}")))?;
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    state.tx_mode = tx_mode;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}
