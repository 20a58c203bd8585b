//! Authorization resolution.
//!
//! Supervision is expressed through several independent, possibly stale
//! indirections. Any single check alone produces false negatives in real
//! deployments, so `can_act` evaluates them as an ordered OR and
//! short-circuits on the first grant:
//!
//! 1. the actor is one of the assignment's assigned teachers;
//! 2. the actor directly supervises an assigned teacher;
//! 3. the actor supervises a teacher of any class the student is (or was,
//!    within the given school year) enrolled in;
//! 4. the actor's level scope includes the level of the student's class;
//! 5. the actor is the one who most recently promoted the student into the
//!    current school year.
//!
//! Policy toggles come from an explicit settings snapshot, never from ambient
//! configuration read mid-check.

use rusqlite::{Connection, OptionalExtension};

use crate::error::WorkflowError;
use crate::model::{Assignment, Student};

#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    /// Actors with the admin role skip relationship checks entirely.
    pub admin_bypass: bool,
    /// When set, only the direct paths (assigned teacher, direct supervision)
    /// grant access.
    pub restrict_to_assigned: bool,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        PolicySnapshot {
            admin_bypass: true,
            restrict_to_assigned: false,
        }
    }
}

impl PolicySnapshot {
    pub fn load(conn: &Connection) -> Result<PolicySnapshot, WorkflowError> {
        let mut policy = PolicySnapshot::default();
        if let Some(v) = read_setting(conn, "admin_bypass")? {
            policy.admin_bypass = is_truthy(&v);
        }
        if let Some(v) = read_setting(conn, "restrict_to_assigned")? {
            policy.restrict_to_assigned = is_truthy(&v);
        }
        Ok(policy)
    }
}

fn read_setting(conn: &Connection, key: &str) -> Result<Option<String>, WorkflowError> {
    let v = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get::<_, String>(0)
        })
        .optional()?;
    Ok(v)
}

fn is_truthy(v: &str) -> bool {
    matches!(v, "1" | "true" | "yes" | "on")
}

pub fn can_act(
    conn: &Connection,
    actor_id: &str,
    assignment: &Assignment,
    school_year_id: Option<&str>,
    policy: &PolicySnapshot,
) -> Result<bool, WorkflowError> {
    if policy.admin_bypass && actor_role(conn, actor_id)?.as_deref() == Some("admin") {
        return Ok(true);
    }

    if is_assigned_teacher(conn, actor_id, &assignment.id)? {
        return Ok(true);
    }
    if supervises_assigned_teacher(conn, actor_id, &assignment.id)? {
        return Ok(true);
    }

    if policy.restrict_to_assigned {
        return Ok(false);
    }

    let year = school_year_id.unwrap_or(&assignment.school_year_id);
    if supervises_class_teacher(conn, actor_id, &assignment.student_id, year)? {
        return Ok(true);
    }
    if level_scope_covers_student(conn, actor_id, &assignment.student_id)? {
        return Ok(true);
    }
    promoted_student_into_year(conn, actor_id, &assignment.student_id, year)
}

fn actor_role(conn: &Connection, actor_id: &str) -> Result<Option<String>, WorkflowError> {
    let role = conn
        .query_row("SELECT role FROM actors WHERE id = ?", [actor_id], |r| {
            r.get::<_, String>(0)
        })
        .optional()?;
    Ok(role)
}

fn is_assigned_teacher(
    conn: &Connection,
    actor_id: &str,
    assignment_id: &str,
) -> Result<bool, WorkflowError> {
    exists(
        conn,
        "SELECT 1 FROM assignment_teachers WHERE assignment_id = ? AND teacher_id = ?",
        &[assignment_id, actor_id],
    )
}

fn supervises_assigned_teacher(
    conn: &Connection,
    actor_id: &str,
    assignment_id: &str,
) -> Result<bool, WorkflowError> {
    exists(
        conn,
        "SELECT 1
         FROM supervisions sv
         JOIN assignment_teachers at ON at.teacher_id = sv.teacher_id
         WHERE sv.supervisor_id = ? AND at.assignment_id = ?",
        &[actor_id, assignment_id],
    )
}

fn supervises_class_teacher(
    conn: &Connection,
    actor_id: &str,
    student_id: &str,
    school_year_id: &str,
) -> Result<bool, WorkflowError> {
    exists(
        conn,
        "SELECT 1
         FROM supervisions sv
         JOIN class_teachers ct ON ct.teacher_id = sv.teacher_id
         JOIN enrollments e ON e.class_id = ct.class_id
         WHERE sv.supervisor_id = ? AND e.student_id = ? AND e.school_year_id = ?",
        &[actor_id, student_id, school_year_id],
    )
}

fn level_scope_covers_student(
    conn: &Connection,
    actor_id: &str,
    student_id: &str,
) -> Result<bool, WorkflowError> {
    let level: Option<String> = conn
        .query_row(
            "SELECT c.level
             FROM enrollments e
             JOIN classes c ON c.id = e.class_id
             WHERE e.student_id = ? AND e.status = 'active'
             LIMIT 1",
            [student_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(level) = level.filter(|l| !l.is_empty()) else {
        return Ok(false);
    };
    exists(
        conn,
        "SELECT 1 FROM level_scopes WHERE supervisor_id = ? AND level = ?",
        &[actor_id, &level],
    )
}

fn promoted_student_into_year(
    conn: &Connection,
    actor_id: &str,
    student_id: &str,
    school_year_id: &str,
) -> Result<bool, WorkflowError> {
    let student = match Student::load(conn, student_id) {
        Ok(s) => s,
        Err(WorkflowError::NotFound(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    // The promotion that created the student's current-year enrollment names
    // the target year, not the year it was signed in.
    let by_entry = student
        .promotions
        .iter()
        .rev()
        .find(|p| {
            p.get("toSchoolYearId").and_then(|v| v.as_str()) == Some(school_year_id)
                || p.get("schoolYearId").and_then(|v| v.as_str()) == Some(school_year_id)
        })
        .and_then(|p| p.get("promotedBy"))
        .and_then(|v| v.as_str());
    Ok(by_entry == Some(actor_id))
}

fn exists(conn: &Connection, sql: &str, params: &[&str]) -> Result<bool, WorkflowError> {
    let found = conn
        .query_row(sql, rusqlite::params_from_iter(params.iter()), |r| {
            r.get::<_, i64>(0)
        })
        .optional()?;
    Ok(found.is_some())
}
