use serde_json::json;

use crate::authz::PolicySnapshot;
use crate::ipc::error::{respond, HandlerError};
use crate::ipc::helpers::{db, opt_str, require_str};
use crate::ipc::types::{AppState, Request};
use crate::model::SignatureType;
use crate::period::{self, PeriodType};
use crate::workflow::sign::{sign, unsign, SignParams, UnsignParams};

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "assignments.sign" => do_sign(state, req),
        "assignments.unsign" => do_unsign(state, req),
        "periods.compute" => compute_period(req),
        "periods.parse" => parse_period(req),
        _ => return None,
    };
    Some(respond(&req.id, out))
}

fn do_sign(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let raw_type = require_str(&req.params, "type")?;
    let sig_type = SignatureType::parse(&raw_type)
        .ok_or_else(|| HandlerError::BadParams(format!("unknown signature type '{raw_type}'")))?;
    let period_type = match opt_str(&req.params, "periodType") {
        Some(token) => Some(PeriodType::from_token(&token).ok_or_else(|| {
            HandlerError::BadParams(format!("unknown period type '{token}'"))
        })?),
        None => None,
    };

    let params = SignParams {
        assignment_id: require_str(&req.params, "assignmentId")?,
        actor_id: require_str(&req.params, "actorId")?,
        sig_type,
        period_type,
        period_id: opt_str(&req.params, "periodId"),
        school_year_id: opt_str(&req.params, "schoolYearId"),
    };

    let policy = PolicySnapshot::load(conn)?;
    let created = sign(conn, state.tx_mode, &params, &policy)?;
    Ok(json!({ "signature": created.to_json() }))
}

fn do_unsign(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let sig_type = match opt_str(&req.params, "type") {
        Some(raw) => Some(SignatureType::parse(&raw).ok_or_else(|| {
            HandlerError::BadParams(format!("unknown signature type '{raw}'"))
        })?),
        None => None,
    };

    let params = UnsignParams {
        assignment_id: require_str(&req.params, "assignmentId")?,
        actor_id: require_str(&req.params, "actorId")?,
        sig_type,
        period_id: opt_str(&req.params, "periodId"),
        level: opt_str(&req.params, "level"),
    };

    let policy = PolicySnapshot::load(conn)?;
    let removed = unsign(conn, state.tx_mode, &params, &policy)?;
    Ok(json!({ "removed": removed }))
}

fn compute_period(req: &Request) -> Result<serde_json::Value, HandlerError> {
    let year_id = require_str(&req.params, "schoolYearId")?;
    let raw = require_str(&req.params, "periodType")?;
    let period_type = PeriodType::from_token(&raw)
        .ok_or_else(|| HandlerError::BadParams(format!("unknown period type '{raw}'")))?;
    let id = period::compute(&year_id, period_type)?;
    Ok(json!({ "periodId": id }))
}

fn parse_period(req: &Request) -> Result<serde_json::Value, HandlerError> {
    let id = require_str(&req.params, "periodId")?;
    Ok(match period::parse(&id) {
        Some((year_id, period_type)) => json!({
            "schoolYearId": year_id,
            "periodType": period_type.token(),
        }),
        None => json!(null),
    })
}
