//! Year rollover: carrying an assignment into a new school year.
//!
//! Rollover resets workflow state while the `data` map is never touched —
//! that is what distinguishes a rollover from an overwrite. The outgoing
//! year's completion state is first captured into the assignment's `archives`
//! map so history cannot be silently lost.

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::atomic::{TxMode, Undo, UnitOfWork};
use crate::authz::{self, PolicySnapshot};
use crate::error::WorkflowError;
use crate::model::{insert_change, new_id, now_utc, Assignment, SchoolYear};

/// The field-reset patch applied when an assignment tied to a different
/// school year is reassigned to `target_year_id`. Pure.
pub fn rollover_patch(target_year_id: &str, actor_by: &str, now: &str) -> Value {
    json!({
        "schoolYearId": target_year_id,
        "status": "draft",
        "completedSem1": false,
        "completedSem1At": null,
        "completedSem2": false,
        "completedSem2At": null,
        "updatedAt": now,
        "updatedBy": actor_by,
    })
}

/// Captures the outgoing year's completion state before the rollover patch
/// overwrites it. Pure; returns the archives-map key and entry.
pub fn archive_patch(assignment: &Assignment, from_year_id: &str) -> (String, Value) {
    (
        from_year_id.to_string(),
        json!({
            "status": assignment.status.as_str(),
            "completedSem1": assignment.completed_sem1,
            "completedSem1At": assignment.completed_sem1_at,
            "completedSem2": assignment.completed_sem2,
            "completedSem2At": assignment.completed_sem2_at,
            "archivedAt": now_utc(),
        }),
    )
}

#[derive(Debug, Clone)]
pub struct RolloverOutcome {
    pub rolled: Vec<String>,
    pub skipped: Vec<String>,
}

/// Carries the given assignments into `target_year_id` inside one unit of
/// work; a bulk rollover is atomic across records. Assignments already tied
/// to the target year are reported as skipped.
pub fn apply_rollover(
    conn: &Connection,
    mode: TxMode,
    assignment_ids: &[String],
    target_year_id: &str,
    actor_id: &str,
    policy: &PolicySnapshot,
) -> Result<RolloverOutcome, WorkflowError> {
    if assignment_ids.is_empty() {
        return Err(WorkflowError::InvalidArgument(
            "no assignments to roll over".into(),
        ));
    }
    SchoolYear::load(conn, target_year_id)?;

    let mut unit = UnitOfWork::new();
    let mut rolled = Vec::new();
    let mut skipped = Vec::new();

    for assignment_id in assignment_ids {
        let assignment = Assignment::load(conn, assignment_id)?;
        if assignment.school_year_id == target_year_id {
            skipped.push(assignment_id.clone());
            continue;
        }
        if !authz::can_act(conn, actor_id, &assignment, None, policy)? {
            return Err(WorkflowError::NotAuthorized);
        }
        rolled.push(assignment_id.clone());

        unit = unit
            .step("rollover-assignment", {
                let (aid, target, actor) = (
                    assignment_id.clone(),
                    target_year_id.to_string(),
                    actor_id.to_string(),
                );
                move |conn: &Connection| {
                    let a = Assignment::load(conn, &aid)?;
                    let prior = a.to_json();

                    let (key, entry) = archive_patch(&a, &a.school_year_id);
                    let mut archives = a.archives.clone();
                    archives.insert(key, entry);

                    // Workflow state resets; the data column is not touched.
                    conn.execute(
                        "UPDATE assignments
                         SET school_year_id = ?, status = 'draft',
                             completed_sem1 = 0, completed_sem1_at = NULL,
                             completed_sem2 = 0, completed_sem2_at = NULL,
                             archives = ?, data_version = data_version + 1,
                             updated_at = ?, updated_by = ?
                         WHERE id = ?",
                        (
                            &target,
                            Value::Object(archives).to_string(),
                            now_utc(),
                            &actor,
                            &aid,
                        ),
                    )?;

                    let aid = aid.clone();
                    Ok(Box::new(move |conn: &Connection| {
                        conn.execute(
                            "UPDATE assignments
                             SET school_year_id = ?, status = ?,
                                 completed_sem1 = ?, completed_sem1_at = ?,
                                 completed_sem2 = ?, completed_sem2_at = ?,
                                 archives = ?, data_version = ?,
                                 updated_at = ?, updated_by = ?
                             WHERE id = ?",
                            rusqlite::params![
                                prior["schoolYearId"].as_str(),
                                prior["status"].as_str(),
                                prior["completedSem1"].as_bool(),
                                prior["completedSem1At"].as_str(),
                                prior["completedSem2"].as_bool(),
                                prior["completedSem2At"].as_str(),
                                prior["archives"].to_string(),
                                prior["dataVersion"].as_i64(),
                                prior["updatedAt"].as_str(),
                                prior["updatedBy"].as_str(),
                                &aid,
                            ],
                        )?;
                        Ok(())
                    }) as Undo)
                }
            })
            .step("change-log", {
                let (aid, actor, target) = (
                    assignment_id.clone(),
                    actor_id.to_string(),
                    target_year_id.to_string(),
                );
                let log_id = new_id();
                move |conn: &Connection| {
                    let details = json!({ "targetSchoolYearId": target });
                    insert_change(conn, &log_id, &aid, &actor, "rollover", &details)?;
                    let log_id = log_id.clone();
                    Ok(Box::new(move |conn: &Connection| {
                        conn.execute("DELETE FROM change_log WHERE id = ?", [&log_id])?;
                        Ok(())
                    }) as Undo)
                }
            });
    }

    if !rolled.is_empty() {
        unit.run(conn, mode)?;
    }
    Ok(RolloverOutcome { rolled, skipped })
}
