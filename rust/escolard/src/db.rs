use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "escolard.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            birth_date TEXT,
            admission_date TEXT,
            status TEXT NOT NULL DEFAULT 'REGULAR',
            created_by TEXT NOT NULL,
            updated_by TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_last_name ON students(last_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_book_folios(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            book TEXT NOT NULL,
            folio TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_book_folios_student ON student_book_folios(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cycles(
            id TEXT PRIMARY KEY,
            year INTEGER NOT NULL UNIQUE,
            start_date TEXT,
            end_date TEXT,
            in_progress INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS orientations(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            cycle_id TEXT NOT NULL,
            grade_level TEXT NOT NULL,
            division TEXT NOT NULL,
            shift TEXT NOT NULL DEFAULT '',
            orientation_id TEXT,
            FOREIGN KEY(cycle_id) REFERENCES cycles(id),
            FOREIGN KEY(orientation_id) REFERENCES orientations(id),
            UNIQUE(cycle_id, grade_level, division, shift)
        )",
        [],
    )?;
    ensure_courses_orientation_id(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_cycle ON courses(cycle_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            grade_level TEXT,
            orientation TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            condition TEXT NOT NULL DEFAULT 'REGULAR',
            enrolled_on TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(student_id, course_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            instance TEXT NOT NULL,
            score REAL NOT NULL,
            recorded_at TEXT NOT NULL,
            recorded_by TEXT NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(enrollment_id, subject_id, semester, instance)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_enrollment ON grades(enrollment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject ON grades(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS period_params(
            cycle_id TEXT NOT NULL,
            instance TEXT NOT NULL,
            semester INTEGER NOT NULL,
            closed INTEGER NOT NULL DEFAULT 0,
            closed_at TEXT,
            closed_by TEXT,
            PRIMARY KEY(cycle_id, instance, semester),
            FOREIGN KEY(cycle_id) REFERENCES cycles(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            date TEXT NOT NULL,
            present INTEGER NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            UNIQUE(enrollment_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date)",
        [],
    )?;

    Ok(())
}

/// Workspaces created before orientations became a table stored a free-text
/// `orientation` on courses. The old column is left in place and unused.
fn ensure_courses_orientation_id(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "courses", "orientation_id")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE courses ADD COLUMN orientation_id TEXT REFERENCES orientations(id)",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_delete(conn: &Connection, key: &str) -> anyhow::Result<()> {
    conn.execute("DELETE FROM settings WHERE key = ?", [key])?;
    Ok(())
}
