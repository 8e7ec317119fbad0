use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("classhub.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL,
            guardian_of TEXT,
            FOREIGN KEY(guardian_of) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_guardian ON users(guardian_of)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            context TEXT NOT NULL,
            status TEXT NOT NULL,
            start_at TEXT NOT NULL,
            end_at TEXT NOT NULL,
            primary_instructor_id TEXT NOT NULL,
            secondary_instructor_id TEXT,
            meeting_link TEXT,
            notes TEXT,
            cancellation_reason_id TEXT,
            reschedule_reason_id TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(primary_instructor_id) REFERENCES users(id),
            FOREIGN KEY(secondary_instructor_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_course ON sessions(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_participants(
            session_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(session_id, user_id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_participants_user ON session_participants(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            session_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role_in_session TEXT NOT NULL,
            present INTEGER NOT NULL,
            join_time TEXT,
            leave_time TEXT,
            PRIMARY KEY(session_id, user_id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_user ON attendance_records(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS recordings(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            title TEXT NOT NULL,
            url TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_recordings_session ON recordings(session_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reasons(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reasons_kind ON reasons(kind)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            session_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id)",
        [],
    )?;

    // Existing workspaces may predate the optimistic version column.
    ensure_sessions_version(&conn)?;

    Ok(conn)
}

fn ensure_sessions_version(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "sessions", "version")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE sessions ADD COLUMN version INTEGER NOT NULL DEFAULT 1",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Append one row to the event outbox. Consumers drain via events.list;
/// the emitting operation never waits on delivery.
pub fn event_emit(
    conn: &Connection,
    event_type: &str,
    session_id: &str,
    payload: &serde_json::Value,
    created_at: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO events(event_type, session_id, payload, created_at)
         VALUES(?, ?, ?, ?)",
        (
            event_type,
            session_id,
            serde_json::to_string(payload)?,
            created_at,
        ),
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
