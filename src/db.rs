use rusqlite::{Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::time::Duration;

pub const DB_FILE: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'teacher',
            password_salt TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            order_revision INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            token TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_teacher ON sessions(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            place TEXT NOT NULL,
            schedule_date TEXT NOT NULL,
            schedule_time TEXT,
            sort_order INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_groups_teacher ON groups(teacher_id)",
        [],
    )?;

    // Groups gained free-text "days" and "year" after the first release.
    ensure_groups_schedule_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_groups_teacher_sort ON groups(teacher_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL,
            national_id TEXT NOT NULL,
            birth_date TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(group_id) REFERENCES groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group ON students(group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group_national_id ON students(group_id, national_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            date TEXT NOT NULL,
            present INTEGER NOT NULL,
            notes TEXT,
            marked_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(group_id) REFERENCES groups(id),
            FOREIGN KEY(marked_by) REFERENCES teachers(id),
            UNIQUE(student_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_group_date ON attendance(group_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    // Orders written by older builds may have gaps or duplicates.
    compact_all_group_orders(&conn)?;

    Ok(conn)
}

fn ensure_groups_schedule_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "groups", "days")? {
        conn.execute("ALTER TABLE groups ADD COLUMN days TEXT", [])?;
    }
    if !table_has_column(conn, "groups", "year")? {
        conn.execute("ALTER TABLE groups ADD COLUMN year TEXT", [])?;
    }
    Ok(())
}

fn compact_all_group_orders(conn: &Connection) -> anyhow::Result<()> {
    let mut stmt = conn.prepare("SELECT id FROM teachers ORDER BY rowid")?;
    let teacher_ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for tid in teacher_ids {
        compact_group_order(conn, &tid)?;
    }
    Ok(())
}

/// Rewrites a teacher's group sort orders to `0..n-1`, keeping relative order.
pub fn compact_group_order(conn: &Connection, teacher_id: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT id, sort_order FROM groups WHERE teacher_id = ? ORDER BY sort_order, name, rowid",
    )?;
    let rows = stmt
        .query_map([teacher_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (i, (gid, current)) in rows.iter().enumerate() {
        if *current != i as i64 {
            conn.execute(
                "UPDATE groups SET sort_order = ? WHERE id = ?",
                (i as i64, gid),
            )?;
        }
    }
    Ok(())
}

pub fn bump_order_revision(conn: &Connection, teacher_id: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "UPDATE teachers SET order_revision = order_revision + 1 WHERE id = ?",
        [teacher_id],
    )?;
    conn.query_row(
        "SELECT order_revision FROM teachers WHERE id = ?",
        [teacher_id],
        |r| r.get(0),
    )
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
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &text),
    )?;
    Ok(())
}

pub fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == ErrorCode::DatabaseBusy || f.code == ErrorCode::DatabaseLocked
    )
}

/// Runs `op` up to `attempts` times while SQLite reports the database as busy.
pub fn with_busy_retry<T>(
    attempts: u32,
    delay: Duration,
    mut op: impl FnMut() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let mut tries = 0u32;
    loop {
        tries += 1;
        match op() {
            Err(e) if is_busy(&e) && tries < attempts => {
                tracing::debug!(attempt = tries, "database busy, retrying");
                std::thread::sleep(delay);
            }
            other => return other,
        }
    }
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
