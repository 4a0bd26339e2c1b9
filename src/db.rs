use log::{error, info};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::{Duration, Instant};

pub const DB_FILE_NAME: &str = "academy.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    let started_at = Instant::now();
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(e) => {
            error!(
                "event=db_open module=db status=error path={} error={}",
                db_path.display(),
                e
            );
            return Err(e.into());
        }
    };
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.busy_timeout(Duration::from_secs(5))?;

    create_schema(&conn)?;

    info!(
        "event=db_open module=db status=ok path={} duration_ms={}",
        db_path.display(),
        started_at.elapsed().as_millis()
    );
    Ok(conn)
}

#[cfg(test)]
pub fn open_db_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS academies(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            academy_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY(academy_id, key),
            FOREIGN KEY(academy_id) REFERENCES academies(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            academy_id TEXT NOT NULL,
            name TEXT NOT NULL,
            subject TEXT,
            color TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(academy_id) REFERENCES academies(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_academy ON teachers(academy_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            academy_id TEXT NOT NULL,
            name TEXT NOT NULL,
            school TEXT,
            grade TEXT,
            phone TEXT,
            parent_phone TEXT,
            memo TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(academy_id) REFERENCES academies(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_academy ON students(academy_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_blocks(
            id TEXT PRIMARY KEY,
            academy_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            student_id TEXT,
            group_id TEXT,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            room TEXT,
            detached INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(academy_id) REFERENCES academies(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_blocks_date ON schedule_blocks(academy_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_blocks_group ON schedule_blocks(group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_blocks_student ON schedule_blocks(student_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            academy_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            note TEXT,
            checked_at TEXT NOT NULL,
            PRIMARY KEY(student_id, date),
            FOREIGN KEY(academy_id) REFERENCES academies(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(academy_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feed_configs(
            id TEXT PRIMARY KEY,
            academy_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            activated_at TEXT,
            applied_at TEXT,
            deleted_at TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(academy_id) REFERENCES academies(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feed_configs_academy ON feed_configs(academy_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS option_sets(
            id TEXT PRIMARY KEY,
            config_id TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT NOT NULL,
            is_scored INTEGER NOT NULL DEFAULT 0,
            is_required INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(config_id) REFERENCES feed_configs(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_option_sets_config ON option_sets(config_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS options(
            id TEXT PRIMARY KEY,
            set_id TEXT NOT NULL,
            label TEXT NOT NULL,
            score REAL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(set_id) REFERENCES option_sets(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_options_set ON options(set_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feeds(
            id TEXT PRIMARY KEY,
            academy_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            date TEXT NOT NULL,
            config_id TEXT NOT NULL,
            memo TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(academy_id) REFERENCES academies(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(config_id) REFERENCES feed_configs(id),
            UNIQUE(student_id, teacher_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feeds_date ON feeds(academy_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feed_values(
            feed_id TEXT NOT NULL,
            option_set_id TEXT NOT NULL,
            option_id TEXT NOT NULL,
            PRIMARY KEY(feed_id, option_set_id),
            FOREIGN KEY(feed_id) REFERENCES feeds(id),
            FOREIGN KEY(option_set_id) REFERENCES option_sets(id),
            FOREIGN KEY(option_id) REFERENCES options(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feed_values_option ON feed_values(option_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS monthly_reports(
            id TEXT PRIMARY KEY,
            academy_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            month TEXT NOT NULL,
            summary_json TEXT NOT NULL,
            comment TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'draft',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            finalized_at TEXT,
            FOREIGN KEY(academy_id) REFERENCES academies(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, month)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_monthly_reports_month ON monthly_reports(academy_id, month)",
        [],
    )?;

    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    academy_id: &str,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE academy_id = ? AND key = ?",
            (academy_id, key),
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    academy_id: &str,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(academy_id, key, value_json)
         VALUES(?, ?, ?)
         ON CONFLICT(academy_id, key) DO UPDATE SET
           value_json = excluded.value_json",
        (academy_id, key, &text),
    )?;
    Ok(())
}
