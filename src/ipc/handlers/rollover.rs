use serde_json::json;

use crate::authz::PolicySnapshot;
use crate::ipc::error::{respond, HandlerError};
use crate::ipc::helpers::{db, require_str, str_list};
use crate::ipc::types::{AppState, Request};
use crate::model::now_utc;
use crate::workflow::rollover::{apply_rollover, rollover_patch};

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "rollover.apply" => apply(state, req),
        "rollover.patch" => patch(req),
        _ => return None,
    };
    Some(respond(&req.id, out))
}

fn apply(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let assignment_ids = str_list(&req.params, "assignmentIds");
    let target_year_id = require_str(&req.params, "targetYearId")?;
    let actor_id = require_str(&req.params, "actorId")?;

    let policy = PolicySnapshot::load(conn)?;
    let outcome = apply_rollover(
        conn,
        state.tx_mode,
        &assignment_ids,
        &target_year_id,
        &actor_id,
        &policy,
    )?;
    Ok(json!({
        "rolled": outcome.rolled,
        "skipped": outcome.skipped,
    }))
}

/// Pure preview of the field-reset patch a rollover would apply.
fn patch(req: &Request) -> Result<serde_json::Value, HandlerError> {
    let target_year_id = require_str(&req.params, "targetYearId")?;
    let actor_by = require_str(&req.params, "actorBy")?;
    Ok(json!({ "patch": rollover_patch(&target_year_id, &actor_by, &now_utc()) }))
}
