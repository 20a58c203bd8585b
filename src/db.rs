use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("carnet.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates the schema idempotently. Public so tests can run against an
/// in-memory connection.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS actors(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'teacher'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sequence INTEGER,
            starts_on TEXT,
            ends_on TEXT,
            active INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            level TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(school_year_id) REFERENCES school_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_year ON classes(school_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_teachers(
            class_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            PRIMARY KEY(class_id, teacher_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(teacher_id) REFERENCES actors(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_teachers_teacher ON class_teachers(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS supervisions(
            supervisor_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            PRIMARY KEY(supervisor_id, teacher_id),
            FOREIGN KEY(supervisor_id) REFERENCES actors(id),
            FOREIGN KEY(teacher_id) REFERENCES actors(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_supervisions_teacher ON supervisions(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS level_scopes(
            supervisor_id TEXT NOT NULL,
            level TEXT NOT NULL,
            PRIMARY KEY(supervisor_id, level),
            FOREIGN KEY(supervisor_id) REFERENCES actors(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            promotions TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            UNIQUE(student_id, school_year_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(school_year_id) REFERENCES school_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_class ON enrollments(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS templates(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            fields TEXT NOT NULL DEFAULT '[]'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            template_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            completed_sem1 INTEGER NOT NULL DEFAULT 0,
            completed_sem1_at TEXT,
            completed_sem2 INTEGER NOT NULL DEFAULT 0,
            completed_sem2_at TEXT,
            data_version INTEGER NOT NULL DEFAULT 1,
            data TEXT NOT NULL DEFAULT '{}',
            archives TEXT NOT NULL DEFAULT '{}',
            created_at TEXT,
            updated_at TEXT,
            updated_by TEXT,
            UNIQUE(template_id, student_id),
            FOREIGN KEY(template_id) REFERENCES templates(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(school_year_id) REFERENCES school_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_student ON assignments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_year ON assignments(school_year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_teachers(
            assignment_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            PRIMARY KEY(assignment_id, teacher_id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(teacher_id) REFERENCES actors(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignment_teachers_teacher ON assignment_teachers(teacher_id)",
        [],
    )?;

    // period_id = '' marks a legacy signature that predates period identities.
    // The UNIQUE constraint is the single arbiter for concurrent signers.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS signatures(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            type TEXT NOT NULL,
            period_id TEXT NOT NULL DEFAULT '',
            level TEXT NOT NULL DEFAULT '',
            signed_by TEXT NOT NULL,
            signed_at TEXT NOT NULL,
            UNIQUE(assignment_id, type, period_id, level),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_signatures_assignment ON signatures(assignment_id)",
        [],
    )?;

    // Write-once by convention; rows are never updated after creation.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS snapshots(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            school_year_id TEXT NOT NULL,
            data TEXT NOT NULL,
            meta TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_student ON snapshots(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_assignment ON snapshots(assignment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_log(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            actor_id TEXT NOT NULL,
            action TEXT NOT NULL,
            details TEXT,
            at TEXT NOT NULL,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_change_log_assignment ON change_log(assignment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}
