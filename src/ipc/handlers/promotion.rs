use crate::authz::PolicySnapshot;
use crate::ipc::error::{respond, HandlerError};
use crate::ipc::helpers::{db, require_str};
use crate::ipc::types::{AppState, Request};
use crate::workflow::promote::promote;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "assignments.promote" => do_promote(state, req),
        _ => return None,
    };
    Some(respond(&req.id, out))
}

fn do_promote(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let assignment_id = require_str(&req.params, "assignmentId")?;
    let actor_id = require_str(&req.params, "actorId")?;
    let next_level = require_str(&req.params, "nextLevel")?;

    let policy = PolicySnapshot::load(conn)?;
    let outcome = promote(
        conn,
        state.tx_mode,
        &assignment_id,
        &actor_id,
        &next_level,
        &policy,
    )?;
    Ok(outcome.to_json())
}
