use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};

pub const DB_FILE_NAME: &str = "credilocker.sqlite3";

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE_NAME)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!("failed to create workspace {}", workspace.to_string_lossy())
    })?;
    let conn = Connection::open(db_path(workspace))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            department TEXT,
            academic_year TEXT,
            teacher_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES profiles(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS profiles(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL CHECK(role IN ('teacher', 'student')),
            full_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE COLLATE NOCASE,
            roll_no TEXT,
            class_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_profiles_class ON profiles(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS field_project_documents(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            doc_kind TEXT NOT NULL,
            file_name TEXT NOT NULL,
            storage_path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'submitted',
            remark TEXT,
            uploaded_at TEXT NOT NULL,
            reviewed_at TEXT,
            FOREIGN KEY(student_id) REFERENCES profiles(id),
            UNIQUE(student_id, doc_kind)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_field_project_documents_student ON field_project_documents(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cep_requirements(
            class_id TEXT PRIMARY KEY,
            min_hours REAL NOT NULL,
            deadline TEXT,
            tiers_json TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cep_entries(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            activity_name TEXT NOT NULL,
            activity_date TEXT NOT NULL,
            hours REAL NOT NULL,
            description TEXT,
            proof_path TEXT,
            proof_sha256 TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            remark TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cep_entries_student ON cep_entries(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activities(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            activity_date TEXT NOT NULL,
            start_time TEXT,
            venue TEXT,
            points INTEGER NOT NULL,
            created_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(created_by) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_classes(
            activity_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            PRIMARY KEY(activity_id, class_id),
            FOREIGN KEY(activity_id) REFERENCES activities(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_classes_class ON activity_classes(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS activity_attendance(
            activity_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('present', 'absent', 'excused')),
            marked_at TEXT NOT NULL,
            PRIMARY KEY(activity_id, student_id),
            FOREIGN KEY(activity_id) REFERENCES activities(id),
            FOREIGN KEY(student_id) REFERENCES profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_attendance_student ON activity_attendance(student_id)",
        [],
    )?;

    // Workspaces created before activities carried a venue need the column added.
    ensure_activities_venue(&conn)?;

    Ok(conn)
}

fn ensure_activities_venue(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "activities", "venue")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE activities ADD COLUMN venue TEXT", [])?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s).with_context(|| {
            format!("settings value for {} is not valid JSON", key)
        })?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
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
