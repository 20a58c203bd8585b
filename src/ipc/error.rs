use serde_json::json;
use tracing::error;

use crate::error::WorkflowError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Everything a handler can fail with.
pub enum HandlerError {
    BadParams(String),
    NoWorkspace,
    AlreadyExists(String),
    Workflow(WorkflowError),
}

impl From<WorkflowError> for HandlerError {
    fn from(e: WorkflowError) -> Self {
        HandlerError::Workflow(e)
    }
}

impl From<rusqlite::Error> for HandlerError {
    fn from(e: rusqlite::Error) -> Self {
        HandlerError::Workflow(WorkflowError::Storage(e))
    }
}

pub fn respond(id: &str, out: Result<serde_json::Value, HandlerError>) -> serde_json::Value {
    match out {
        Ok(result) => ok(id, result),
        Err(HandlerError::BadParams(msg)) => err(id, "bad_params", msg, None),
        Err(HandlerError::NoWorkspace) => {
            err(id, "no_workspace", "select a workspace first", None)
        }
        Err(HandlerError::AlreadyExists(msg)) => err(id, "already_exists", msg, None),
        Err(HandlerError::Workflow(e)) => {
            if matches!(
                e,
                WorkflowError::Storage(_) | WorkflowError::TransactionUnsupported
            ) {
                // Raw storage detail stays out of the protocol.
                error!(request = id, error = %e, "workflow operation failed");
            }
            err(id, e.code(), e.public_message(), e.details())
        }
    }
}
