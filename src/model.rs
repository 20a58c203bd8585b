use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::WorkflowError;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentStatus {
    Draft,
    InProgress,
    Completed,
    Signed,
}

impl AssignmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Draft => "draft",
            AssignmentStatus::InProgress => "in_progress",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Signed => "signed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(AssignmentStatus::Draft),
            "in_progress" => Some(AssignmentStatus::InProgress),
            "completed" => Some(AssignmentStatus::Completed),
            "signed" => Some(AssignmentStatus::Signed),
            _ => None,
        }
    }

    /// Legal transitions form a chain: draft ↔ in_progress ↔ completed ↔ signed.
    /// `signed` is only reachable from `completed`. Anything else is a defect.
    pub fn can_transition(self, to: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Draft, InProgress)
                | (InProgress, Draft)
                | (InProgress, Completed)
                | (Completed, InProgress)
                | (Completed, Signed)
                | (Signed, Completed)
        )
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub id: String,
    pub template_id: String,
    pub student_id: String,
    pub school_year_id: String,
    pub status: AssignmentStatus,
    pub completed_sem1: bool,
    pub completed_sem1_at: Option<String>,
    pub completed_sem2: bool,
    pub completed_sem2_at: Option<String>,
    pub data_version: i64,
    pub data: Map<String, Value>,
    pub archives: Map<String, Value>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub updated_by: Option<String>,
}

impl Assignment {
    pub fn load(conn: &Connection, id: &str) -> Result<Assignment, WorkflowError> {
        let row = conn
            .query_row(
                "SELECT id, template_id, student_id, school_year_id, status,
                        completed_sem1, completed_sem1_at, completed_sem2, completed_sem2_at,
                        data_version, data, archives, created_at, updated_at, updated_by
                 FROM assignments WHERE id = ?",
                [id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, bool>(5)?,
                        r.get::<_, Option<String>>(6)?,
                        r.get::<_, bool>(7)?,
                        r.get::<_, Option<String>>(8)?,
                        r.get::<_, i64>(9)?,
                        r.get::<_, String>(10)?,
                        r.get::<_, String>(11)?,
                        r.get::<_, Option<String>>(12)?,
                        r.get::<_, Option<String>>(13)?,
                        r.get::<_, Option<String>>(14)?,
                    ))
                },
            )
            .optional()?;

        let Some(row) = row else {
            return Err(WorkflowError::NotFound("assignment"));
        };

        let status = AssignmentStatus::parse(&row.4).ok_or_else(|| {
            WorkflowError::InvalidArgument(format!("stored status '{}' is unknown", row.4))
        })?;

        Ok(Assignment {
            id: row.0,
            template_id: row.1,
            student_id: row.2,
            school_year_id: row.3,
            status,
            completed_sem1: row.5,
            completed_sem1_at: row.6,
            completed_sem2: row.7,
            completed_sem2_at: row.8,
            data_version: row.9,
            data: parse_json_object(&row.10),
            archives: parse_json_object(&row.11),
            created_at: row.12,
            updated_at: row.13,
            updated_by: row.14,
        })
    }

    pub fn assigned_teachers(conn: &Connection, id: &str) -> Result<Vec<String>, WorkflowError> {
        let mut stmt = conn.prepare(
            "SELECT teacher_id FROM assignment_teachers WHERE assignment_id = ? ORDER BY teacher_id",
        )?;
        let ids = stmt
            .query_map([id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "templateId": self.template_id,
            "studentId": self.student_id,
            "schoolYearId": self.school_year_id,
            "status": self.status.as_str(),
            "completedSem1": self.completed_sem1,
            "completedSem1At": self.completed_sem1_at,
            "completedSem2": self.completed_sem2,
            "completedSem2At": self.completed_sem2_at,
            "dataVersion": self.data_version,
            "data": Value::Object(self.data.clone()),
            "archives": Value::Object(self.archives.clone()),
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
            "updatedBy": self.updated_by,
        })
    }
}

fn parse_json_object(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(m)) => m,
        _ => Map::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Standard,
    EndOfYear,
}

impl SignatureType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureType::Standard => "standard",
            SignatureType::EndOfYear => "end_of_year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(SignatureType::Standard),
            "end_of_year" => Some(SignatureType::EndOfYear),
            _ => None,
        }
    }
}

type SignatureParts = (String, String, String, String, String, String, String);

#[derive(Debug, Clone)]
pub struct Signature {
    pub id: String,
    pub assignment_id: String,
    pub sig_type: SignatureType,
    /// Empty string marks a legacy signature recorded before period
    /// identities existed. A legacy signature matches any period of its type.
    pub period_id: String,
    pub level: String,
    pub signed_by: String,
    pub signed_at: String,
}

impl Signature {
    pub fn is_legacy(&self) -> bool {
        self.period_id.is_empty()
    }

    /// Finds a signature for (assignment, type, period, level). A stored
    /// legacy row (empty period) or level-less row (empty level) matches too.
    pub fn find_matching(
        conn: &Connection,
        assignment_id: &str,
        sig_type: SignatureType,
        period_id: &str,
        level: &str,
    ) -> Result<Option<Signature>, WorkflowError> {
        let row = conn
            .query_row(
                "SELECT id, assignment_id, type, period_id, level, signed_by, signed_at
                 FROM signatures
                 WHERE assignment_id = ? AND type = ?
                   AND (period_id = ? OR period_id = '')
                   AND (level = ? OR level = '')
                 LIMIT 1",
                (assignment_id, sig_type.as_str(), period_id, level),
                Signature::row_parts,
            )
            .optional()?;
        row.map(Signature::from_parts).transpose()
    }

    pub fn list_for_assignment(
        conn: &Connection,
        assignment_id: &str,
    ) -> Result<Vec<Signature>, WorkflowError> {
        let mut stmt = conn.prepare(
            "SELECT id, assignment_id, type, period_id, level, signed_by, signed_at
             FROM signatures WHERE assignment_id = ? ORDER BY signed_at, id",
        )?;
        let parts = stmt
            .query_map([assignment_id], Signature::row_parts)?
            .collect::<Result<Vec<_>, _>>()?;
        parts.into_iter().map(Signature::from_parts).collect()
    }

    pub fn count_for_assignment(
        conn: &Connection,
        assignment_id: &str,
    ) -> Result<i64, WorkflowError> {
        let n = conn.query_row(
            "SELECT COUNT(*) FROM signatures WHERE assignment_id = ?",
            [assignment_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    fn row_parts(r: &rusqlite::Row<'_>) -> rusqlite::Result<SignatureParts> {
        Ok((
            r.get(0)?,
            r.get(1)?,
            r.get(2)?,
            r.get(3)?,
            r.get(4)?,
            r.get(5)?,
            r.get(6)?,
        ))
    }

    fn from_parts(parts: SignatureParts) -> Result<Signature, WorkflowError> {
        let (id, assignment_id, raw_type, period_id, level, signed_by, signed_at) = parts;
        let Some(sig_type) = SignatureType::parse(&raw_type) else {
            warn!(signature = %id, raw = %raw_type, "stored signature type is unknown");
            return Err(WorkflowError::InvalidArgument(format!(
                "stored signature type '{raw_type}' is unknown"
            )));
        };
        Ok(Signature {
            id,
            assignment_id,
            sig_type,
            period_id,
            level,
            signed_by,
            signed_at,
        })
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "assignmentId": self.assignment_id,
            "type": self.sig_type.as_str(),
            "signaturePeriodId": self.period_id,
            "level": self.level,
            "signedBy": self.signed_by,
            "signedAt": self.signed_at,
            "legacy": self.is_legacy(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SchoolYear {
    pub id: String,
    pub name: String,
    pub sequence: Option<i64>,
    pub starts_on: Option<String>,
    pub ends_on: Option<String>,
    pub active: bool,
}

impl SchoolYear {
    pub fn load(conn: &Connection, id: &str) -> Result<SchoolYear, WorkflowError> {
        conn.query_row(
            "SELECT id, name, sequence, starts_on, ends_on, active FROM school_years WHERE id = ?",
            [id],
            SchoolYear::from_row,
        )
        .optional()?
        .ok_or(WorkflowError::NotFound("school year"))
    }

    pub fn active(conn: &Connection) -> Result<Option<SchoolYear>, WorkflowError> {
        let row = conn
            .query_row(
                "SELECT id, name, sequence, starts_on, ends_on, active
                 FROM school_years WHERE active = 1 LIMIT 1",
                [],
                SchoolYear::from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SchoolYear> {
        Ok(SchoolYear {
            id: r.get(0)?,
            name: r.get(1)?,
            sequence: r.get(2)?,
            starts_on: r.get(3)?,
            ends_on: r.get(4)?,
            active: r.get(5)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Enrollment {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub school_year_id: String,
    pub status: String,
}

/// Active enrollment joined with its class level and name.
#[derive(Debug, Clone)]
pub struct ActiveEnrollment {
    pub enrollment: Enrollment,
    pub level: String,
    pub class_name: String,
}

impl Enrollment {
    pub fn active_for_student(
        conn: &Connection,
        student_id: &str,
    ) -> Result<Option<ActiveEnrollment>, WorkflowError> {
        let row = conn
            .query_row(
                "SELECT e.id, e.student_id, e.class_id, e.school_year_id, e.status,
                        c.level, c.name
                 FROM enrollments e
                 JOIN classes c ON c.id = e.class_id
                 WHERE e.student_id = ? AND e.status = 'active'
                 LIMIT 1",
                [student_id],
                |r| {
                    Ok(ActiveEnrollment {
                        enrollment: Enrollment {
                            id: r.get(0)?,
                            student_id: r.get(1)?,
                            class_id: r.get(2)?,
                            school_year_id: r.get(3)?,
                            status: r.get(4)?,
                        },
                        level: r.get(5)?,
                        class_name: r.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[derive(Debug, Clone)]
pub struct Student {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    pub promotions: Vec<Value>,
}

impl Student {
    pub fn load(conn: &Connection, id: &str) -> Result<Student, WorkflowError> {
        let row = conn
            .query_row(
                "SELECT id, last_name, first_name, promotions FROM students WHERE id = ?",
                [id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, last_name, first_name, raw)) = row else {
            return Err(WorkflowError::NotFound("student"));
        };
        let promotions = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(a)) => a,
            _ => Vec::new(),
        };
        Ok(Student {
            id,
            last_name,
            first_name,
            promotions,
        })
    }

    /// Latest promotion entry recorded for the given school year, if any.
    pub fn promotion_for_year(&self, school_year_id: &str) -> Option<&Value> {
        self.promotions
            .iter()
            .rev()
            .find(|p| p.get("schoolYearId").and_then(|v| v.as_str()) == Some(school_year_id))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "lastName": self.last_name,
            "firstName": self.first_name,
            "promotions": self.promotions,
        })
    }
}

/// Appends a change-log row under a caller-generated id so unit-of-work
/// steps can compensate by deleting it.
pub fn insert_change(
    conn: &Connection,
    id: &str,
    assignment_id: &str,
    actor_id: &str,
    action: &str,
    details: &Value,
) -> Result<(), WorkflowError> {
    conn.execute(
        "INSERT INTO change_log(id, assignment_id, actor_id, action, details, at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            id,
            assignment_id,
            actor_id,
            action,
            details.to_string(),
            now_utc(),
        ),
    )?;
    Ok(())
}
