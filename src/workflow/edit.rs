//! Optimistic-concurrency edits of a single assignment.
//!
//! Every mutation here is issued as one conditional UPDATE that increments
//! `data_version` atomically with the rest of the patch. When the caller
//! supplies `expected_version` and the conditional write matches zero rows,
//! the caller gets [`WorkflowError::Conflict`] carrying the current record so
//! it can merge and retry. Without `expected_version` the write is
//! unconditional but still increments the counter.

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::warn;

use crate::authz::{self, PolicySnapshot};
use crate::datamap;
use crate::error::WorkflowError;
use crate::model::{now_utc, Assignment, AssignmentStatus};

pub fn update_data(
    conn: &Connection,
    assignment_id: &str,
    actor_id: &str,
    patch: &Map<String, Value>,
    expected_version: Option<i64>,
    policy: &PolicySnapshot,
) -> Result<Assignment, WorkflowError> {
    let assignment = Assignment::load(conn, assignment_id)?;
    if !authz::can_act(conn, actor_id, &assignment, None, policy)? {
        return Err(WorkflowError::NotAuthorized);
    }

    let fields = datamap::load_template_fields(conn, &assignment.template_id)?;
    datamap::validate_patch(&fields, patch)?;

    if let Some(v) = expected_version {
        if v != assignment.data_version {
            return Err(conflict(conn, assignment_id)?);
        }
    }

    let mut data = assignment.data.clone();
    for (key, value) in patch {
        if value.is_null() {
            data.remove(key);
        } else {
            data.insert(key.clone(), value.clone());
        }
    }

    let changed = conditional_write(
        conn,
        assignment_id,
        actor_id,
        expected_version,
        "data = ?",
        &[&Value::Object(data).to_string()],
    )?;
    if changed == 0 {
        return Err(conflict(conn, assignment_id)?);
    }
    Assignment::load(conn, assignment_id)
}

pub fn set_status(
    conn: &Connection,
    assignment_id: &str,
    actor_id: &str,
    new_status: AssignmentStatus,
    expected_version: Option<i64>,
    policy: &PolicySnapshot,
) -> Result<Assignment, WorkflowError> {
    let assignment = Assignment::load(conn, assignment_id)?;
    if !authz::can_act(conn, actor_id, &assignment, None, policy)? {
        return Err(WorkflowError::NotAuthorized);
    }

    if new_status == AssignmentStatus::Signed || assignment.status == AssignmentStatus::Signed {
        return Err(WorkflowError::InvalidArgument(
            "the signed status is managed by the sign/unsign operations".into(),
        ));
    }
    check_transition(&assignment, new_status, actor_id)?;

    if let Some(v) = expected_version {
        if v != assignment.data_version {
            return Err(conflict(conn, assignment_id)?);
        }
    }

    let changed = conditional_write(
        conn,
        assignment_id,
        actor_id,
        expected_version,
        "status = ?",
        &[new_status.as_str()],
    )?;
    if changed == 0 {
        return Err(conflict(conn, assignment_id)?);
    }
    Assignment::load(conn, assignment_id)
}

pub fn complete_semester(
    conn: &Connection,
    assignment_id: &str,
    actor_id: &str,
    semester: i64,
    expected_version: Option<i64>,
    policy: &PolicySnapshot,
) -> Result<Assignment, WorkflowError> {
    if semester != 1 && semester != 2 {
        return Err(WorkflowError::InvalidArgument(format!(
            "semester must be 1 or 2, got {semester}"
        )));
    }

    let assignment = Assignment::load(conn, assignment_id)?;
    if !authz::can_act(conn, actor_id, &assignment, None, policy)? {
        return Err(WorkflowError::NotAuthorized);
    }
    check_transition(&assignment, AssignmentStatus::Completed, actor_id)?;

    if let Some(v) = expected_version {
        if v != assignment.data_version {
            return Err(conflict(conn, assignment_id)?);
        }
    }

    let now = now_utc();
    let assign = if semester == 1 {
        "status = 'completed', completed_sem1 = 1, completed_sem1_at = ?"
    } else {
        "status = 'completed', completed_sem2 = 1, completed_sem2_at = ?"
    };
    let changed = conditional_write(
        conn,
        assignment_id,
        actor_id,
        expected_version,
        assign,
        &[&now],
    )?;
    if changed == 0 {
        return Err(conflict(conn, assignment_id)?);
    }
    Assignment::load(conn, assignment_id)
}

fn check_transition(
    assignment: &Assignment,
    to: AssignmentStatus,
    actor_id: &str,
) -> Result<(), WorkflowError> {
    if assignment.status.can_transition(to) {
        return Ok(());
    }
    warn!(
        assignment = %assignment.id,
        from = %assignment.status,
        to = %to,
        actor = actor_id,
        "illegal status transition requested"
    );
    Err(WorkflowError::InvalidArgument(format!(
        "illegal status transition {} -> {}",
        assignment.status, to
    )))
}

/// The single conditional-write shape every edit goes through.
fn conditional_write(
    conn: &Connection,
    assignment_id: &str,
    actor_id: &str,
    expected_version: Option<i64>,
    assign_clause: &str,
    assign_params: &[&str],
) -> Result<usize, WorkflowError> {
    let now = now_utc();
    let mut params: Vec<&dyn rusqlite::ToSql> = Vec::new();
    for p in assign_params {
        params.push(p);
    }
    params.push(&now);
    params.push(&actor_id);
    params.push(&assignment_id);

    let sql;
    let changed = if let Some(expected) = expected_version {
        sql = format!(
            "UPDATE assignments
             SET {assign_clause}, data_version = data_version + 1, updated_at = ?, updated_by = ?
             WHERE id = ? AND data_version = ?"
        );
        params.push(&expected);
        conn.execute(&sql, rusqlite::params_from_iter(params))?
    } else {
        sql = format!(
            "UPDATE assignments
             SET {assign_clause}, data_version = data_version + 1, updated_at = ?, updated_by = ?
             WHERE id = ?"
        );
        conn.execute(&sql, rusqlite::params_from_iter(params))?
    };
    Ok(changed)
}

fn conflict(conn: &Connection, assignment_id: &str) -> Result<WorkflowError, WorkflowError> {
    let current = Assignment::load(conn, assignment_id)?;
    Ok(WorkflowError::Conflict {
        current: current.to_json(),
    })
}
