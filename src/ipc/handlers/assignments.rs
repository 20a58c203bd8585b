use serde_json::json;

use crate::authz::PolicySnapshot;
use crate::error::is_unique_violation;
use crate::ipc::error::{respond, HandlerError};
use crate::ipc::helpers::{db, opt_i64, opt_str, require_obj, require_str, str_list};
use crate::ipc::types::{AppState, Request};
use crate::model::{new_id, now_utc, Assignment, AssignmentStatus, SchoolYear, Signature};
use crate::workflow::edit;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "assignments.create" => create(state, req),
        "assignments.get" => get(state, req),
        "assignments.updateData" => update_data(state, req),
        "assignments.setStatus" => set_status(state, req),
        "assignments.completeSemester" => complete_semester(state, req),
        _ => return None,
    };
    Some(respond(&req.id, out))
}

fn create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let template_id = require_str(&req.params, "templateId")?;
    let student_id = require_str(&req.params, "studentId")?;
    let year_id = match opt_str(&req.params, "schoolYearId") {
        Some(y) => y,
        None => SchoolYear::active(conn)?
            .map(|y| y.id)
            .ok_or_else(|| {
                HandlerError::BadParams("missing schoolYearId and no active school year".into())
            })?,
    };

    let id = new_id();
    let inserted = conn.execute(
        "INSERT INTO assignments(id, template_id, student_id, school_year_id, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &template_id, &student_id, &year_id, now_utc()),
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            // One assignment per (template, student).
            return Err(HandlerError::AlreadyExists(
                "assignment already exists for this template and student".into(),
            ));
        }
        Err(e) => return Err(e.into()),
    }

    for teacher_id in str_list(&req.params, "teacherIds") {
        conn.execute(
            "INSERT OR IGNORE INTO assignment_teachers(assignment_id, teacher_id) VALUES(?, ?)",
            (&id, &teacher_id),
        )?;
    }
    Ok(json!({ "assignmentId": id }))
}

fn get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let assignment_id = require_str(&req.params, "assignmentId")?;
    let assignment = Assignment::load(conn, &assignment_id)?;
    let teachers = Assignment::assigned_teachers(conn, &assignment_id)?;
    let signatures: Vec<_> = Signature::list_for_assignment(conn, &assignment_id)?
        .iter()
        .map(Signature::to_json)
        .collect();

    let mut stmt = conn.prepare(
        "SELECT id, actor_id, action, details, at
         FROM change_log WHERE assignment_id = ? ORDER BY at, id",
    )?;
    let change_log = stmt
        .query_map([&assignment_id], |r| {
            let details: Option<String> = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "actorId": r.get::<_, String>(1)?,
                "action": r.get::<_, String>(2)?,
                "details": details
                    .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok()),
                "at": r.get::<_, String>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "assignment": assignment.to_json(),
        "teachers": teachers,
        "signatures": signatures,
        "changeLog": change_log,
    }))
}

fn update_data(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let assignment_id = require_str(&req.params, "assignmentId")?;
    let actor_id = require_str(&req.params, "actorId")?;
    let patch = require_obj(&req.params, "patch")?;
    let expected_version = opt_i64(&req.params, "expectedVersion");

    let policy = PolicySnapshot::load(conn)?;
    let updated = edit::update_data(
        conn,
        &assignment_id,
        &actor_id,
        &patch,
        expected_version,
        &policy,
    )?;
    Ok(json!({ "assignment": updated.to_json() }))
}

fn set_status(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let assignment_id = require_str(&req.params, "assignmentId")?;
    let actor_id = require_str(&req.params, "actorId")?;
    let raw_status = require_str(&req.params, "status")?;
    let status = AssignmentStatus::parse(&raw_status)
        .ok_or_else(|| HandlerError::BadParams(format!("unknown status '{raw_status}'")))?;
    let expected_version = opt_i64(&req.params, "expectedVersion");

    let policy = PolicySnapshot::load(conn)?;
    let updated = edit::set_status(
        conn,
        &assignment_id,
        &actor_id,
        status,
        expected_version,
        &policy,
    )?;
    Ok(json!({ "assignment": updated.to_json() }))
}

fn complete_semester(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let assignment_id = require_str(&req.params, "assignmentId")?;
    let actor_id = require_str(&req.params, "actorId")?;
    let semester = opt_i64(&req.params, "semester")
        .ok_or_else(|| HandlerError::BadParams("missing semester".into()))?;
    let expected_version = opt_i64(&req.params, "expectedVersion");

    let policy = PolicySnapshot::load(conn)?;
    let updated = edit::complete_semester(
        conn,
        &assignment_id,
        &actor_id,
        semester,
        expected_version,
        &policy,
    )?;
    Ok(json!({ "assignment": updated.to_json() }))
}
