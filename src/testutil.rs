//! Shared fixtures for unit tests. Compiled only under `cfg(test)`.

use rusqlite::Connection;
use serde_json::json;

use crate::db;
use crate::model::new_id;

pub fn mem_conn() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    db::init_schema(&conn).unwrap();
    conn
}

pub struct Fixture {
    pub year_id: String,
    pub next_year_id: String,
    pub class_id: String,
    pub teacher_id: String,
    pub supervisor_id: String,
    pub student_id: String,
    pub template_id: String,
    pub assignment_id: String,
}

/// A minimal school: an active year 2025-2026 plus its successor, one PS
/// class with a teacher, a supervised teacher, one enrolled student and one
/// draft assignment assigned to the teacher.
pub fn seed_school(conn: &Connection) -> Fixture {
    let year_id = seed_year(conn, "2025-2026", 1, "2025-09-01", "2026-07-04", true);
    let next_year_id = seed_year(conn, "2026-2027", 2, "2026-09-01", "2027-07-03", false);

    let teacher_id = seed_actor(conn, "Teacher One", "teacher");
    let supervisor_id = seed_actor(conn, "Supervisor One", "supervisor");
    link_supervision(conn, &supervisor_id, &teacher_id);

    let class_id = seed_class(conn, &year_id, "PS A", "PS");
    link_class_teacher(conn, &class_id, &teacher_id);

    let student_id = seed_student(conn, "Martin", "Lea");
    enroll(conn, &student_id, &class_id, &year_id);

    let template_id = seed_template(
        conn,
        "Carnet de suivi",
        1,
        json!([
            { "key": "text:remarks", "kind": "free_text" },
            { "key": "lang:greeting", "kind": "language_toggle" },
            { "key": "choice:progress", "kind": "dropdown" },
            { "key": "row:motor-skills", "kind": "table_row" }
        ]),
    );

    let assignment_id = seed_assignment(conn, &template_id, &student_id, &year_id);
    link_assignment_teacher(conn, &assignment_id, &teacher_id);

    Fixture {
        year_id,
        next_year_id,
        class_id,
        teacher_id,
        supervisor_id,
        student_id,
        template_id,
        assignment_id,
    }
}

pub fn seed_year(
    conn: &Connection,
    name: &str,
    sequence: i64,
    starts_on: &str,
    ends_on: &str,
    active: bool,
) -> String {
    let id = new_id();
    conn.execute(
        "INSERT INTO school_years(id, name, sequence, starts_on, ends_on, active)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, name, sequence, starts_on, ends_on, active),
    )
    .unwrap();
    id
}

pub fn seed_actor(conn: &Connection, name: &str, role: &str) -> String {
    let id = new_id();
    conn.execute(
        "INSERT INTO actors(id, display_name, role) VALUES(?, ?, ?)",
        (&id, name, role),
    )
    .unwrap();
    id
}

pub fn seed_class(conn: &Connection, year_id: &str, name: &str, level: &str) -> String {
    let id = new_id();
    conn.execute(
        "INSERT INTO classes(id, school_year_id, name, level) VALUES(?, ?, ?, ?)",
        (&id, year_id, name, level),
    )
    .unwrap();
    id
}

pub fn seed_student(conn: &Connection, last: &str, first: &str) -> String {
    let id = new_id();
    conn.execute(
        "INSERT INTO students(id, last_name, first_name) VALUES(?, ?, ?)",
        (&id, last, first),
    )
    .unwrap();
    id
}

pub fn enroll(conn: &Connection, student_id: &str, class_id: &str, year_id: &str) -> String {
    let id = new_id();
    conn.execute(
        "INSERT INTO enrollments(id, student_id, class_id, school_year_id, status)
         VALUES(?, ?, ?, ?, 'active')",
        (&id, student_id, class_id, year_id),
    )
    .unwrap();
    id
}

pub fn seed_template(
    conn: &Connection,
    name: &str,
    version: i64,
    fields: serde_json::Value,
) -> String {
    let id = new_id();
    conn.execute(
        "INSERT INTO templates(id, name, version, fields) VALUES(?, ?, ?, ?)",
        (&id, name, version, fields.to_string()),
    )
    .unwrap();
    id
}

pub fn seed_assignment(
    conn: &Connection,
    template_id: &str,
    student_id: &str,
    year_id: &str,
) -> String {
    let id = new_id();
    conn.execute(
        "INSERT INTO assignments(id, template_id, student_id, school_year_id, created_at)
         VALUES(?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, template_id, student_id, year_id),
    )
    .unwrap();
    id
}

pub fn link_assignment_teacher(conn: &Connection, assignment_id: &str, teacher_id: &str) {
    conn.execute(
        "INSERT INTO assignment_teachers(assignment_id, teacher_id) VALUES(?, ?)",
        (assignment_id, teacher_id),
    )
    .unwrap();
}

pub fn link_class_teacher(conn: &Connection, class_id: &str, teacher_id: &str) {
    conn.execute(
        "INSERT INTO class_teachers(class_id, teacher_id) VALUES(?, ?)",
        (class_id, teacher_id),
    )
    .unwrap();
}

pub fn link_supervision(conn: &Connection, supervisor_id: &str, teacher_id: &str) {
    conn.execute(
        "INSERT INTO supervisions(supervisor_id, teacher_id) VALUES(?, ?)",
        (supervisor_id, teacher_id),
    )
    .unwrap();
}

pub fn grant_level_scope(conn: &Connection, supervisor_id: &str, level: &str) {
    conn.execute(
        "INSERT INTO level_scopes(supervisor_id, level) VALUES(?, ?)",
        (supervisor_id, level),
    )
    .unwrap();
}

/// Marks both semesters complete and moves the status to `completed`
/// through the legal chain, bypassing the workflow layer.
pub fn force_completed(conn: &Connection, assignment_id: &str) {
    conn.execute(
        "UPDATE assignments
         SET status = 'completed',
             completed_sem1 = 1, completed_sem1_at = '2026-01-15T10:00:00Z',
             completed_sem2 = 1, completed_sem2_at = '2026-06-15T10:00:00Z'
         WHERE id = ?",
        [assignment_id],
    )
    .unwrap();
}
