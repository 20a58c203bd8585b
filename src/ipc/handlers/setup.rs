//! Seeding surface for the collaborating process: school years, classes,
//! actors, students, enrollments, templates and policy settings. Raw CRUD
//! listing is deliberately not offered here.

use serde_json::json;

use crate::ipc::error::{respond, HandlerError};
use crate::ipc::helpers::{db, opt_bool, opt_i64, opt_str, require_str, str_list};
use crate::ipc::types::{AppState, Request};
use crate::model::new_id;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let out = match req.method.as_str() {
        "setup.schoolYear" => school_year(state, req),
        "setup.actor" => actor(state, req),
        "setup.class" => class(state, req),
        "setup.student" => student(state, req),
        "setup.supervision" => supervision(state, req),
        "setup.levelScope" => level_scope(state, req),
        "setup.enrollment" => enrollment(state, req),
        "setup.template" => template(state, req),
        "setup.setting" => setting(state, req),
        _ => return None,
    };
    Some(respond(&req.id, out))
}

fn school_year(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let name = require_str(&req.params, "name")?;
    let id = opt_str(&req.params, "id").unwrap_or_else(new_id);
    let active = opt_bool(&req.params, "active").unwrap_or(false);

    if active {
        conn.execute("UPDATE school_years SET active = 0", [])?;
    }
    conn.execute(
        "INSERT INTO school_years(id, name, sequence, starts_on, ends_on, active)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            &name,
            opt_i64(&req.params, "sequence"),
            opt_str(&req.params, "startsOn"),
            opt_str(&req.params, "endsOn"),
            active,
        ),
    )?;
    Ok(json!({ "schoolYearId": id }))
}

fn actor(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let name = require_str(&req.params, "displayName")?;
    let role = opt_str(&req.params, "role").unwrap_or_else(|| "teacher".to_string());
    let id = opt_str(&req.params, "id").unwrap_or_else(new_id);
    conn.execute(
        "INSERT INTO actors(id, display_name, role) VALUES(?, ?, ?)",
        (&id, &name, &role),
    )?;
    Ok(json!({ "actorId": id }))
}

fn class(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let year_id = require_str(&req.params, "schoolYearId")?;
    let name = require_str(&req.params, "name")?;
    let level = opt_str(&req.params, "level").unwrap_or_default();
    let id = new_id();
    conn.execute(
        "INSERT INTO classes(id, school_year_id, name, level) VALUES(?, ?, ?, ?)",
        (&id, &year_id, &name, &level),
    )?;
    for teacher_id in str_list(&req.params, "teacherIds") {
        conn.execute(
            "INSERT OR IGNORE INTO class_teachers(class_id, teacher_id) VALUES(?, ?)",
            (&id, &teacher_id),
        )?;
    }
    Ok(json!({ "classId": id }))
}

fn student(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let last = require_str(&req.params, "lastName")?;
    let first = require_str(&req.params, "firstName")?;
    let id = new_id();
    conn.execute(
        "INSERT INTO students(id, last_name, first_name) VALUES(?, ?, ?)",
        (&id, &last, &first),
    )?;
    Ok(json!({ "studentId": id }))
}

fn supervision(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let supervisor_id = require_str(&req.params, "supervisorId")?;
    let teacher_id = require_str(&req.params, "teacherId")?;
    conn.execute(
        "INSERT OR IGNORE INTO supervisions(supervisor_id, teacher_id) VALUES(?, ?)",
        (&supervisor_id, &teacher_id),
    )?;
    Ok(json!({ "ok": true }))
}

fn level_scope(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let supervisor_id = require_str(&req.params, "supervisorId")?;
    let level = require_str(&req.params, "level")?;
    conn.execute(
        "INSERT OR IGNORE INTO level_scopes(supervisor_id, level) VALUES(?, ?)",
        (&supervisor_id, &level),
    )?;
    Ok(json!({ "ok": true }))
}

fn enrollment(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let student_id = require_str(&req.params, "studentId")?;
    let class_id = require_str(&req.params, "classId")?;
    let year_id: Option<String> = {
        use rusqlite::OptionalExtension;
        conn.query_row(
            "SELECT school_year_id FROM classes WHERE id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()?
    };
    let Some(year_id) = year_id else {
        return Err(HandlerError::BadParams("unknown classId".into()));
    };
    let id = new_id();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO enrollments(id, student_id, class_id, school_year_id, status)
         VALUES(?, ?, ?, ?, 'active')",
        (&id, &student_id, &class_id, &year_id),
    )?;
    if inserted == 0 {
        return Err(HandlerError::AlreadyExists(
            "student is already enrolled for this school year".into(),
        ));
    }
    Ok(json!({ "enrollmentId": id }))
}

fn template(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let name = require_str(&req.params, "name")?;
    let version = opt_i64(&req.params, "version").unwrap_or(1);
    let fields = req
        .params
        .get("fields")
        .cloned()
        .unwrap_or_else(|| json!([]));
    if !fields.is_array() {
        return Err(HandlerError::BadParams("fields must be an array".into()));
    }
    let id = new_id();
    conn.execute(
        "INSERT INTO templates(id, name, version, fields) VALUES(?, ?, ?, ?)",
        (&id, &name, version, fields.to_string()),
    )?;
    Ok(json!({ "templateId": id }))
}

fn setting(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerError> {
    let conn = db(state)?;
    let key = require_str(&req.params, "key")?;
    let value = require_str(&req.params, "value")?;
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (&key, &value),
    )?;
    Ok(json!({ "ok": true }))
}
