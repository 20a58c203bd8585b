//! Sign / unsign workflows.
//!
//! The signature table is the single source of truth for "has this been
//! signed"; its UNIQUE(assignment, type, period, level) constraint arbitrates
//! concurrent signers. Both operations run through a [`UnitOfWork`] so the
//! signature row, the assignment update and the change-log entry commit or
//! roll back together.

use rusqlite::Connection;
use serde_json::json;
use tracing::warn;

use crate::atomic::{no_undo, TxMode, Undo, UnitOfWork};
use crate::authz::{self, PolicySnapshot};
use crate::error::{is_unique_violation, WorkflowError};
use crate::model::{
    insert_change, new_id, now_utc, Assignment, AssignmentStatus, Enrollment, SchoolYear,
    Signature, SignatureType,
};
use crate::period::{self, PeriodType};

pub struct SignParams {
    pub assignment_id: String,
    pub actor_id: String,
    pub sig_type: SignatureType,
    pub period_type: Option<PeriodType>,
    pub period_id: Option<String>,
    pub school_year_id: Option<String>,
}

pub fn sign(
    conn: &Connection,
    mode: TxMode,
    p: &SignParams,
    policy: &PolicySnapshot,
) -> Result<Signature, WorkflowError> {
    let assignment = Assignment::load(conn, &p.assignment_id)?;

    let school_year_id = match &p.school_year_id {
        Some(y) => y.clone(),
        None => SchoolYear::active(conn)?
            .map(|y| y.id)
            .unwrap_or_else(|| assignment.school_year_id.clone()),
    };

    let period_type = match (&p.period_id, p.period_type) {
        (Some(id), _) => {
            period::parse(id)
                .map(|(_, t)| t)
                .ok_or_else(|| {
                    WorkflowError::InvalidArgument(format!(
                        "unrecognized signature period id '{id}'"
                    ))
                })?
        }
        (None, Some(t)) => t,
        (None, None) => match p.sig_type {
            SignatureType::Standard => PeriodType::Sem1,
            SignatureType::EndOfYear => PeriodType::EndOfYear,
        },
    };
    let period_id = match &p.period_id {
        Some(id) => id.clone(),
        None => period::compute(&school_year_id, period_type)?,
    };

    match period_type {
        PeriodType::Sem1 => {
            if !assignment.completed_sem1 {
                return Err(WorkflowError::NotCompletedSem1);
            }
        }
        PeriodType::Sem2 | PeriodType::EndOfYear => {
            if !assignment.completed_sem2 {
                return Err(WorkflowError::NotCompletedSem2);
            }
        }
    }

    if !authz::can_act(conn, &p.actor_id, &assignment, Some(&school_year_id), policy)? {
        return Err(WorkflowError::NotAuthorized);
    }

    if !matches!(
        assignment.status,
        AssignmentStatus::Completed | AssignmentStatus::Signed
    ) {
        warn!(
            assignment = %assignment.id,
            status = %assignment.status,
            "sign requested outside the completed/signed states"
        );
        return Err(WorkflowError::InvalidArgument(format!(
            "illegal status transition {} -> signed",
            assignment.status
        )));
    }

    let level = Enrollment::active_for_student(conn, &assignment.student_id)?
        .map(|e| e.level)
        .unwrap_or_default();

    if Signature::find_matching(conn, &assignment.id, p.sig_type, &period_id, &level)?.is_some()
    {
        return Err(WorkflowError::AlreadySigned);
    }

    let (unit, created) = build_sign_unit(&assignment, &p.actor_id, p.sig_type, &period_id, &level);
    unit.run(conn, mode)?;
    Ok(created)
}

/// Builds the sign step list. Split from [`sign`] so tests can append a
/// failing step and observe compensation.
pub(crate) fn build_sign_unit(
    assignment: &Assignment,
    actor_id: &str,
    sig_type: SignatureType,
    period_id: &str,
    level: &str,
) -> (UnitOfWork, Signature) {
    let created = Signature {
        id: new_id(),
        assignment_id: assignment.id.clone(),
        sig_type,
        period_id: period_id.to_string(),
        level: level.to_string(),
        signed_by: actor_id.to_string(),
        signed_at: now_utc(),
    };
    let log_id = new_id();

    let unit = UnitOfWork::new()
        .step("recheck-signature", {
            // Defends against a racer landing between the pre-check and the
            // write.
            let (aid, pid, lvl) = (
                assignment.id.clone(),
                period_id.to_string(),
                level.to_string(),
            );
            move |conn: &Connection| {
                if Signature::find_matching(conn, &aid, sig_type, &pid, &lvl)?.is_some() {
                    return Err(WorkflowError::AlreadySigned);
                }
                Ok(no_undo())
            }
        })
        .step("insert-signature", {
            let s = created.clone();
            move |conn: &Connection| {
                let inserted = conn.execute(
                    "INSERT INTO signatures(id, assignment_id, type, period_id, level, signed_by, signed_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?)",
                    (
                        &s.id,
                        &s.assignment_id,
                        s.sig_type.as_str(),
                        &s.period_id,
                        &s.level,
                        &s.signed_by,
                        &s.signed_at,
                    ),
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => {
                        // Read-on-conflict: the racing winner's row is what
                        // exists now, so this is a duplicate, not a failure.
                        return match Signature::find_matching(
                            conn, &s.assignment_id, s.sig_type, &s.period_id, &s.level,
                        )? {
                            Some(_) => Err(WorkflowError::AlreadySigned),
                            None => Err(e.into()),
                        };
                    }
                    Err(e) => return Err(e.into()),
                }
                let sig_id = s.id.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute("DELETE FROM signatures WHERE id = ?", [&sig_id])?;
                    Ok(())
                }) as Undo)
            }
        })
        .step("update-assignment", {
            let (aid, actor) = (assignment.id.clone(), actor_id.to_string());
            move |conn: &Connection| {
                let (prior_status, prior_version, prior_updated_at, prior_updated_by) = conn
                    .query_row(
                        "SELECT status, data_version, updated_at, updated_by
                         FROM assignments WHERE id = ?",
                        [&aid],
                        |r| {
                            Ok((
                                r.get::<_, String>(0)?,
                                r.get::<_, i64>(1)?,
                                r.get::<_, Option<String>>(2)?,
                                r.get::<_, Option<String>>(3)?,
                            ))
                        },
                    )?;
                conn.execute(
                    "UPDATE assignments
                     SET status = 'signed', data_version = data_version + 1,
                         updated_at = ?, updated_by = ?
                     WHERE id = ?",
                    (now_utc(), &actor, &aid),
                )?;
                let aid = aid.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute(
                        "UPDATE assignments
                         SET status = ?, data_version = ?, updated_at = ?, updated_by = ?
                         WHERE id = ?",
                        (
                            &prior_status,
                            prior_version,
                            &prior_updated_at,
                            &prior_updated_by,
                            &aid,
                        ),
                    )?;
                    Ok(())
                }) as Undo)
            }
        })
        .step("change-log", {
            let (aid, actor, details) = (
                assignment.id.clone(),
                actor_id.to_string(),
                json!({
                    "type": sig_type.as_str(),
                    "signaturePeriodId": period_id,
                    "level": level,
                }),
            );
            let log_id = log_id.clone();
            move |conn: &Connection| {
                insert_change(conn, &log_id, &aid, &actor, "sign", &details)?;
                let log_id = log_id.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute("DELETE FROM change_log WHERE id = ?", [&log_id])?;
                    Ok(())
                }) as Undo)
            }
        });

    (unit, created)
}

pub struct UnsignParams {
    pub assignment_id: String,
    pub actor_id: String,
    pub sig_type: Option<SignatureType>,
    pub period_id: Option<String>,
    pub level: Option<String>,
}

pub fn unsign(
    conn: &Connection,
    mode: TxMode,
    p: &UnsignParams,
    policy: &PolicySnapshot,
) -> Result<usize, WorkflowError> {
    let assignment = Assignment::load(conn, &p.assignment_id)?;
    if !authz::can_act(conn, &p.actor_id, &assignment, None, policy)? {
        return Err(WorkflowError::NotAuthorized);
    }

    let matching = select_matching(conn, p)?;
    if matching.is_empty() {
        return Err(WorkflowError::NotFound("signature"));
    }
    let removes_end_of_year = matching
        .iter()
        .any(|s| s.sig_type == SignatureType::EndOfYear);
    let removed = matching.len();
    let log_id = new_id();

    let unit = UnitOfWork::new()
        .step("delete-signatures", {
            let sigs = matching.clone();
            move |conn: &Connection| {
                for s in &sigs {
                    conn.execute("DELETE FROM signatures WHERE id = ?", [&s.id])?;
                }
                let sigs = sigs.clone();
                Ok(Box::new(move |conn: &Connection| {
                    for s in &sigs {
                        conn.execute(
                            "INSERT OR IGNORE INTO signatures(id, assignment_id, type, period_id, level, signed_by, signed_at)
                             VALUES(?, ?, ?, ?, ?, ?, ?)",
                            (
                                &s.id,
                                &s.assignment_id,
                                s.sig_type.as_str(),
                                &s.period_id,
                                &s.level,
                                &s.signed_by,
                                &s.signed_at,
                            ),
                        )?;
                    }
                    Ok(())
                }) as Undo)
            }
        })
        .step("update-assignment", {
            let (aid, actor) = (assignment.id.clone(), p.actor_id.clone());
            move |conn: &Connection| {
                let a = Assignment::load(conn, &aid)?;
                let prior_data = serde_json::Value::Object(a.data.clone()).to_string();
                let prior_status = a.status;
                let prior_version = a.data_version;

                let mut data = a.data;
                if removes_end_of_year {
                    strip_promotions_by(&mut data, &actor);
                }

                // Deletes above already ran, so the count reflects what remains.
                let remaining = Signature::count_for_assignment(conn, &aid)?;
                let status = if remaining == 0 {
                    AssignmentStatus::Completed
                } else {
                    a.status
                };

                conn.execute(
                    "UPDATE assignments
                     SET status = ?, data = ?, data_version = data_version + 1,
                         updated_at = ?, updated_by = ?
                     WHERE id = ?",
                    (
                        status.as_str(),
                        serde_json::Value::Object(data).to_string(),
                        now_utc(),
                        &actor,
                        &aid,
                    ),
                )?;

                let aid = aid.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute(
                        "UPDATE assignments SET status = ?, data = ?, data_version = ? WHERE id = ?",
                        (prior_status.as_str(), &prior_data, prior_version, &aid),
                    )?;
                    Ok(())
                }) as Undo)
            }
        })
        .step("change-log", {
            let (aid, actor) = (assignment.id.clone(), p.actor_id.clone());
            let details = json!({ "removed": removed });
            let log_id = log_id.clone();
            move |conn: &Connection| {
                insert_change(conn, &log_id, &aid, &actor, "unsign", &details)?;
                let log_id = log_id.clone();
                Ok(Box::new(move |conn: &Connection| {
                    conn.execute("DELETE FROM change_log WHERE id = ?", [&log_id])?;
                    Ok(())
                }) as Undo)
            }
        });

    unit.run(conn, mode)?;
    Ok(removed)
}

fn select_matching(
    conn: &Connection,
    p: &UnsignParams,
) -> Result<Vec<Signature>, WorkflowError> {
    let all = Signature::list_for_assignment(conn, &p.assignment_id)?;
    Ok(all
        .into_iter()
        .filter(|s| {
            p.sig_type.map_or(true, |t| s.sig_type == t)
                && p.period_id
                    .as_deref()
                    .map_or(true, |pid| s.period_id == pid || s.is_legacy())
                && p.level.as_deref().map_or(true, |l| s.level == l)
        })
        .collect())
}

/// Removes promotion records attributed to this actor from the data map.
fn strip_promotions_by(data: &mut serde_json::Map<String, serde_json::Value>, actor_id: &str) {
    if let Some(serde_json::Value::Array(entries)) = data.get_mut("promotions") {
        entries.retain(|e| e.get("promotedBy").and_then(|v| v.as_str()) != Some(actor_id));
        if entries.is_empty() {
            data.remove("promotions");
        }
    }
}
