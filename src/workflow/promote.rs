//! Promotion of a student to the next level and school year.
//!
//! The promotion snapshots the assignment with its context, flips the current
//! enrollment to `promoted`, creates the next-year enrollment and appends the
//! promotion provenance to both the student and the assignment data map — all
//! in one unit of work. Rollover is deliberately NOT applied here: the
//! assignment keeps referencing the current school year until the explicit
//! administrative year switch, so teacher-facing progress views stay stable.

use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::atomic::{TxMode, Undo, UnitOfWork};
use crate::authz::{self, PolicySnapshot};
use crate::error::WorkflowError;
use crate::model::{
    insert_change, new_id, now_utc, Assignment, Enrollment, SchoolYear, Signature, SignatureType,
    Student,
};
use crate::period::{self, PeriodType};

#[derive(Debug, Clone)]
pub struct PromoteOutcome {
    pub snapshot_id: String,
    pub next_enrollment_id: String,
    pub next_school_year_id: String,
    pub from_level: String,
    pub to_level: String,
}

impl PromoteOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "snapshotId": self.snapshot_id,
            "nextEnrollmentId": self.next_enrollment_id,
            "nextSchoolYearId": self.next_school_year_id,
            "fromLevel": self.from_level,
            "toLevel": self.to_level,
        })
    }
}

pub fn promote(
    conn: &Connection,
    mode: TxMode,
    assignment_id: &str,
    actor_id: &str,
    next_level: &str,
    policy: &PolicySnapshot,
) -> Result<PromoteOutcome, WorkflowError> {
    if next_level.is_empty() {
        return Err(WorkflowError::InvalidArgument(
            "next level must not be empty".into(),
        ));
    }

    let assignment = Assignment::load(conn, assignment_id)?;
    let student = Student::load(conn, &assignment.student_id)?;

    // Current level and year come from the active enrollment, not the
    // assignment row.
    let Some(active) = Enrollment::active_for_student(conn, &student.id)? else {
        return Err(WorkflowError::CurrentYearUnknown);
    };
    if active.level.is_empty() {
        return Err(WorkflowError::CurrentYearUnknown);
    }
    let current_year = SchoolYear::load(conn, &active.enrollment.school_year_id)?;

    let period_id = period::compute(&current_year.id, PeriodType::EndOfYear)?;
    let signed_by_actor = Signature::find_matching(
        conn,
        &assignment.id,
        SignatureType::EndOfYear,
        &period_id,
        &active.level,
    )?
    .map(|s| s.signed_by == actor_id)
    .unwrap_or(false);
    if !signed_by_actor {
        return Err(WorkflowError::NotSignedByYou);
    }

    if !authz::can_act(conn, actor_id, &assignment, Some(&current_year.id), policy)? {
        return Err(WorkflowError::NotAuthorized);
    }

    if student.promotion_for_year(&current_year.id).is_some() {
        return Err(WorkflowError::AlreadyPromoted);
    }

    let next_year = resolve_next_year(conn, &current_year)?;

    let (unit, outcome) = build_promote_unit(
        conn,
        &assignment,
        &student,
        &active,
        &current_year,
        &next_year,
        actor_id,
        next_level,
        &period_id,
    )?;
    unit.run(conn, mode)?;
    Ok(outcome)
}

/// Next-year strategies, tried strictly in order; the first hit wins:
/// sequence number, year-name arithmetic, earliest year starting after the
/// current year ends.
fn resolve_next_year(
    conn: &Connection,
    current: &SchoolYear,
) -> Result<SchoolYear, WorkflowError> {
    if let Some(seq) = current.sequence {
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM school_years WHERE sequence = ? LIMIT 1",
                [seq + 1],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = found {
            return SchoolYear::load(conn, &id);
        }
    }

    if let Some(next_name) = next_year_name(&current.name) {
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM school_years WHERE name = ? LIMIT 1",
                [&next_name],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = found {
            return SchoolYear::load(conn, &id);
        }
    }

    if let Some(ends_on) = &current.ends_on {
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM school_years
                 WHERE starts_on IS NOT NULL AND starts_on > ?
                 ORDER BY starts_on ASC LIMIT 1",
                [ends_on],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = found {
            return SchoolYear::load(conn, &id);
        }
    }

    Err(WorkflowError::NoNextYear)
}

/// "2025-2026" -> "2026-2027", "2025/2026" -> "2026/2027", "2025" -> "2026".
fn next_year_name(name: &str) -> Option<String> {
    for sep in ['-', '/'] {
        if let Some((a, b)) = name.split_once(sep) {
            let (a, b) = (a.trim().parse::<i64>().ok()?, b.trim().parse::<i64>().ok()?);
            return Some(format!("{}{}{}", a + 1, sep, b + 1));
        }
    }
    name.trim().parse::<i64>().ok().map(|y| (y + 1).to_string())
}

#[allow(clippy::too_many_arguments)]
fn build_promote_unit(
    conn: &Connection,
    assignment: &Assignment,
    student: &Student,
    active: &crate::model::ActiveEnrollment,
    current_year: &SchoolYear,
    next_year: &SchoolYear,
    actor_id: &str,
    next_level: &str,
    period_id: &str,
) -> Result<(UnitOfWork, PromoteOutcome), WorkflowError> {
    let now = now_utc();
    let snapshot_id = new_id();
    let log_id = new_id();

    // Deep copy of the assignment and its context, frozen at this milestone.
    let template_version: i64 = conn
        .query_row(
            "SELECT version FROM templates WHERE id = ?",
            [&assignment.template_id],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(1);
    let signatures: Vec<Value> = Signature::list_for_assignment(conn, &assignment.id)?
        .iter()
        .map(Signature::to_json)
        .collect();
    let snapshot_data = json!({
        "assignment": assignment.to_json(),
        "student": student.to_json(),
        "enrollment": {
            "id": active.enrollment.id,
            "classId": active.enrollment.class_id,
            "schoolYearId": active.enrollment.school_year_id,
            "status": active.enrollment.status,
        },
        "signatures": signatures,
        "className": active.class_name,
    })
    .to_string();
    let snapshot_meta = json!({
        "templateVersion": template_version,
        "dataVersion": assignment.data_version,
        "signaturePeriodId": period_id,
        "schoolYearId": current_year.id,
        "level": active.level,
        "reason": "promotion",
        "archivedAt": now,
    })
    .to_string();

    // Reuse an existing next-year enrollment when one is already there.
    let existing_next: Option<String> = conn
        .query_row(
            "SELECT id FROM enrollments WHERE student_id = ? AND school_year_id = ?",
            (&student.id, &next_year.id),
            |r| r.get(0),
        )
        .optional()?;
    let next_enrollment_id = existing_next
        .clone()
        .unwrap_or_else(new_id);

    let promotion_entry = json!({
        "schoolYearId": current_year.id,
        "toSchoolYearId": next_year.id,
        "date": now,
        "fromLevel": active.level,
        "toLevel": next_level,
        "promotedBy": actor_id,
    });

    let outcome = PromoteOutcome {
        snapshot_id: snapshot_id.clone(),
        next_enrollment_id: next_enrollment_id.clone(),
        next_school_year_id: next_year.id.clone(),
        from_level: active.level.clone(),
        to_level: next_level.to_string(),
    };

    let unit = UnitOfWork::new()
        .step("create-snapshot", {
            let (sid, aid, stid, yid) = (
                snapshot_id.clone(),
                assignment.id.clone(),
                student.id.clone(),
                current_year.id.clone(),
            );
            let (data, meta, created_at) = (snapshot_data, snapshot_meta, now.clone());
            move |conn: &Connection| {
                conn.execute(
                    "INSERT INTO snapshots(id, assignment_id, student_id, school_year_id, data, meta, created_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?)",
                    (&sid, &aid, &stid, &yid, &data, &meta, &created_at),
                )?;
                let sid = sid.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute("DELETE FROM snapshots WHERE id = ?", [&sid])?;
                    Ok(())
                }) as Undo)
            }
        })
        .step("mark-enrollment-promoted", {
            let eid = active.enrollment.id.clone();
            move |conn: &Connection| {
                let prior: String = conn.query_row(
                    "SELECT status FROM enrollments WHERE id = ?",
                    [&eid],
                    |r| r.get(0),
                )?;
                conn.execute(
                    "UPDATE enrollments SET status = 'promoted' WHERE id = ?",
                    [&eid],
                )?;
                let eid = eid.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute(
                        "UPDATE enrollments SET status = ? WHERE id = ?",
                        (&prior, &eid),
                    )?;
                    Ok(())
                }) as Undo)
            }
        })
        .step("create-next-enrollment", {
            let (eid, stid, cid, yid) = (
                next_enrollment_id.clone(),
                student.id.clone(),
                active.enrollment.class_id.clone(),
                next_year.id.clone(),
            );
            let already_exists = existing_next.is_some();
            move |conn: &Connection| {
                if already_exists {
                    // Idempotent: a next-year enrollment is already in place.
                    return Ok(crate::atomic::no_undo());
                }
                conn.execute(
                    "INSERT INTO enrollments(id, student_id, class_id, school_year_id, status)
                     VALUES(?, ?, ?, ?, 'active')",
                    (&eid, &stid, &cid, &yid),
                )?;
                let eid = eid.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute("DELETE FROM enrollments WHERE id = ?", [&eid])?;
                    Ok(())
                }) as Undo)
            }
        })
        .step("append-student-promotion", {
            let (stid, yid, entry) = (
                student.id.clone(),
                current_year.id.clone(),
                promotion_entry.clone(),
            );
            move |conn: &Connection| {
                let prior: String = conn.query_row(
                    "SELECT promotions FROM students WHERE id = ?",
                    [&stid],
                    |r| r.get(0),
                )?;
                let mut list = match serde_json::from_str::<Value>(&prior) {
                    Ok(Value::Array(a)) => a,
                    _ => Vec::new(),
                };
                // Re-check inside the unit: a racing promote may have landed
                // since the pre-check.
                let duplicate = list.iter().any(|p| {
                    p.get("schoolYearId").and_then(|v| v.as_str()) == Some(yid.as_str())
                });
                if duplicate {
                    return Err(WorkflowError::AlreadyPromoted);
                }
                list.push(entry.clone());
                conn.execute(
                    "UPDATE students SET promotions = ? WHERE id = ?",
                    (Value::Array(list).to_string(), &stid),
                )?;
                let stid = stid.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute(
                        "UPDATE students SET promotions = ? WHERE id = ?",
                        (&prior, &stid),
                    )?;
                    Ok(())
                }) as Undo)
            }
        })
        .step("record-on-assignment", {
            let (aid, actor, entry) = (
                assignment.id.clone(),
                actor_id.to_string(),
                promotion_entry.clone(),
            );
            move |conn: &Connection| {
                let a = Assignment::load(conn, &aid)?;
                let prior_data = Value::Object(a.data.clone()).to_string();
                let prior_version = a.data_version;

                let mut data = a.data;
                let records = data
                    .entry("promotions".to_string())
                    .or_insert_with(|| Value::Array(vec![]));
                if let Value::Array(list) = records {
                    list.push(entry.clone());
                }
                conn.execute(
                    "UPDATE assignments
                     SET data = ?, data_version = data_version + 1, updated_at = ?, updated_by = ?
                     WHERE id = ?",
                    (Value::Object(data).to_string(), now_utc(), &actor, &aid),
                )?;

                let aid = aid.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute(
                        "UPDATE assignments SET data = ?, data_version = ? WHERE id = ?",
                        (&prior_data, prior_version, &aid),
                    )?;
                    Ok(())
                }) as Undo)
            }
        })
        .step("change-log", {
            let (aid, actor) = (assignment.id.clone(), actor_id.to_string());
            let details = json!({
                "fromLevel": active.level,
                "toLevel": next_level,
                "nextSchoolYearId": next_year.id,
            });
            let log_id = log_id.clone();
            move |conn: &Connection| {
                insert_change(conn, &log_id, &aid, &actor, "promote", &details)?;
                let log_id = log_id.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute("DELETE FROM change_log WHERE id = ?", [&log_id])?;
                    Ok(())
                }) as Undo)
            }
        });

    Ok((unit, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::TxMode;
    use crate::testutil::*;
    use crate::workflow::sign::{sign, SignParams};

    fn sign_end_of_year(conn: &Connection, f: &Fixture) {
        force_completed(conn, &f.assignment_id);
        sign(
            conn,
            TxMode::Auto,
            &SignParams {
                assignment_id: f.assignment_id.clone(),
                actor_id: f.supervisor_id.clone(),
                sig_type: SignatureType::EndOfYear,
                period_type: None,
                period_id: None,
                school_year_id: None,
            },
            &PolicySnapshot::default(),
        )
        .unwrap();
    }

    #[test]
    fn promote_without_own_end_of_year_signature_fails() {
        let conn = mem_conn();
        let f = seed_school(&conn);
        force_completed(&conn, &f.assignment_id);
        let policy = PolicySnapshot::default();

        let err = promote(&conn, TxMode::Auto, &f.assignment_id, &f.supervisor_id, "MS", &policy)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotSignedByYou));
    }

    #[test]
    fn promote_happy_path_commits_every_entity() {
        let conn = mem_conn();
        let f = seed_school(&conn);
        sign_end_of_year(&conn, &f);
        let policy = PolicySnapshot::default();

        let before = Assignment::load(&conn, &f.assignment_id).unwrap();
        let outcome = promote(&conn, TxMode::Auto, &f.assignment_id, &f.supervisor_id, "MS", &policy)
            .unwrap();
        assert_eq!(outcome.from_level, "PS");
        assert_eq!(outcome.to_level, "MS");
        assert_eq!(outcome.next_school_year_id, f.next_year_id);

        // Snapshot is a deep copy frozen at the milestone.
        let (snap_data, snap_meta): (String, String) = conn
            .query_row(
                "SELECT data, meta FROM snapshots WHERE id = ?",
                [&outcome.snapshot_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        let snap: Value = serde_json::from_str(&snap_data).unwrap();
        assert_eq!(snap["assignment"]["dataVersion"], json!(before.data_version));
        let meta: Value = serde_json::from_str(&snap_meta).unwrap();
        assert_eq!(meta["reason"], "promotion");
        assert_eq!(meta["level"], "PS");

        // Mutating the live assignment afterwards must not change the snapshot.
        conn.execute(
            "UPDATE assignments SET data = '{\"text:remarks\":\"later\"}' WHERE id = ?",
            [&f.assignment_id],
        )
        .unwrap();
        let (snap_data2,): (String,) = conn
            .query_row(
                "SELECT data FROM snapshots WHERE id = ?",
                [&outcome.snapshot_id],
                |r| Ok((r.get(0)?,)),
            )
            .unwrap();
        assert_eq!(snap_data, snap_data2);

        // Prior enrollment promoted, new active one for the next year.
        let prior_status: String = conn
            .query_row(
                "SELECT status FROM enrollments WHERE student_id = ? AND school_year_id = ?",
                (&f.student_id, &f.year_id),
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(prior_status, "promoted");
        let next_status: String = conn
            .query_row(
                "SELECT status FROM enrollments WHERE student_id = ? AND school_year_id = ?",
                (&f.student_id, &f.next_year_id),
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(next_status, "active");

        // Exactly one promotion entry with toLevel=MS.
        let student = Student::load(&conn, &f.student_id).unwrap();
        assert_eq!(student.promotions.len(), 1);
        assert_eq!(student.promotions[0]["toLevel"], "MS");
        assert_eq!(student.promotions[0]["promotedBy"], json!(f.supervisor_id));

        // The assignment still references the current year: no rollover here.
        let after = Assignment::load(&conn, &f.assignment_id).unwrap();
        assert_eq!(after.school_year_id, f.year_id);
        assert_eq!(after.data_version, before.data_version + 1);
    }

    #[test]
    fn promote_twice_in_the_same_year_is_rejected() {
        let conn = mem_conn();
        let f = seed_school(&conn);
        sign_end_of_year(&conn, &f);
        let policy = PolicySnapshot::default();

        promote(&conn, TxMode::Auto, &f.assignment_id, &f.supervisor_id, "MS", &policy).unwrap();
        let err = promote(&conn, TxMode::Auto, &f.assignment_id, &f.supervisor_id, "MS", &policy)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyPromoted));
    }

    #[test]
    fn promote_with_no_next_year_fails() {
        let conn = mem_conn();
        let f = seed_school(&conn);
        sign_end_of_year(&conn, &f);
        conn.execute("DELETE FROM school_years WHERE id = ?", [&f.next_year_id])
            .unwrap();
        let policy = PolicySnapshot::default();

        let err = promote(&conn, TxMode::Auto, &f.assignment_id, &f.supervisor_id, "MS", &policy)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoNextYear));
    }

    #[test]
    fn promote_without_active_enrollment_fails() {
        let conn = mem_conn();
        let f = seed_school(&conn);
        sign_end_of_year(&conn, &f);
        conn.execute(
            "UPDATE enrollments SET status = 'promoted' WHERE student_id = ?",
            [&f.student_id],
        )
        .unwrap();
        let policy = PolicySnapshot::default();

        let err = promote(&conn, TxMode::Auto, &f.assignment_id, &f.supervisor_id, "MS", &policy)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::CurrentYearUnknown));
    }

    #[test]
    fn failure_mid_promotion_rolls_back_every_entity() {
        let conn = mem_conn();
        let f = seed_school(&conn);
        sign_end_of_year(&conn, &f);

        let assignment = Assignment::load(&conn, &f.assignment_id).unwrap();
        let student = Student::load(&conn, &f.student_id).unwrap();
        let active = Enrollment::active_for_student(&conn, &f.student_id)
            .unwrap()
            .unwrap();
        let current_year = SchoolYear::load(&conn, &f.year_id).unwrap();
        let next_year = SchoolYear::load(&conn, &f.next_year_id).unwrap();
        let period_id = period::compute(&f.year_id, PeriodType::EndOfYear).unwrap();

        let (unit, _outcome) = build_promote_unit(
            &conn,
            &assignment,
            &student,
            &active,
            &current_year,
            &next_year,
            &f.supervisor_id,
            "MS",
            &period_id,
        )
        .unwrap();
        let err = unit
            .step("boom", |_conn: &Connection| {
                Err(WorkflowError::Storage(rusqlite::Error::InvalidQuery))
            })
            .run(&conn, TxMode::Sequential)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Storage(_)));

        // Full rollback: no snapshot, enrollment still active, promotions
        // unchanged, no promotion record on the assignment.
        let snapshots: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM snapshots WHERE student_id = ?",
                [&f.student_id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(snapshots, 0);
        let status: String = conn
            .query_row(
                "SELECT status FROM enrollments WHERE student_id = ? AND school_year_id = ?",
                (&f.student_id, &f.year_id),
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(status, "active");
        let next_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM enrollments WHERE student_id = ? AND school_year_id = ?",
                (&f.student_id, &f.next_year_id),
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(next_count, 0);
        assert!(Student::load(&conn, &f.student_id)
            .unwrap()
            .promotions
            .is_empty());
        let after = Assignment::load(&conn, &f.assignment_id).unwrap();
        assert_eq!(after.data_version, assignment.data_version);
        assert!(!after.data.contains_key("promotions"));
    }

    #[test]
    fn next_year_resolution_falls_back_in_order() {
        let conn = mem_conn();
        // Sequence wins when present.
        let y1 = seed_year(&conn, "2025-2026", 1, "2025-09-01", "2026-07-04", true);
        let y2 = seed_year(&conn, "2026-2027", 2, "2026-09-01", "2027-07-03", false);
        let current = SchoolYear::load(&conn, &y1).unwrap();
        assert_eq!(resolve_next_year(&conn, &current).unwrap().id, y2);

        // Name arithmetic when the sequence chain is broken.
        conn.execute("UPDATE school_years SET sequence = NULL", [])
            .unwrap();
        let current = SchoolYear::load(&conn, &y1).unwrap();
        assert_eq!(resolve_next_year(&conn, &current).unwrap().id, y2);

        // Date ordering as the last resort.
        conn.execute(
            "UPDATE school_years SET name = 'après' WHERE id = ?",
            [&y2],
        )
        .unwrap();
        let current = SchoolYear::load(&conn, &y1).unwrap();
        assert_eq!(resolve_next_year(&conn, &current).unwrap().id, y2);
    }

    #[test]
    fn year_name_arithmetic_handles_common_shapes() {
        assert_eq!(next_year_name("2025-2026").as_deref(), Some("2026-2027"));
        assert_eq!(next_year_name("2025/2026").as_deref(), Some("2026/2027"));
        assert_eq!(next_year_name("2025").as_deref(), Some("2026"));
        assert_eq!(next_year_name("maternelle"), None);
    }
}
