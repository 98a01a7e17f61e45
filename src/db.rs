use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::schedule::{
    ClosureRule, ClosureScope, FixedHoliday, MakeupSession, SessionOverride, TimetableSlot,
    YearBounds,
};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("rollbook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates missing tables and applies additive migrations. Safe to run on
/// every open; also used directly against in-memory databases in tests.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_year ON classes(year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_slots(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            weekday INTEGER NOT NULL,
            subject_id TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            room TEXT,
            teacher TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_slots_class_term
         ON timetable_slots(class_id, term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS closure_rules(
            id TEXT PRIMARY KEY,
            year_id TEXT NOT NULL,
            scope TEXT NOT NULL,
            class_id TEXT,
            subject_id TEXT,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            window_start TEXT,
            window_end TEXT,
            label TEXT,
            FOREIGN KEY(year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_closure_rules_year ON closure_rules(year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_overrides(
            id TEXT PRIMARY KEY,
            year_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            date TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            reason TEXT,
            new_date TEXT,
            new_start TEXT,
            new_end TEXT,
            room TEXT,
            teacher TEXT,
            FOREIGN KEY(year_id) REFERENCES academic_years(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_overrides_year ON session_overrides(year_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_overrides_class_date
         ON session_overrides(class_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fixed_holidays(
            month INTEGER NOT NULL,
            day INTEGER NOT NULL,
            label TEXT NOT NULL,
            PRIMARY KEY(month, day)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_records(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            year_id TEXT NOT NULL,
            term INTEGER NOT NULL,
            date TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(class_id, term, date, subject_id, start_time, end_time)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_records_class_date
         ON session_records(class_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS absence_entries(
            id TEXT PRIMARY KEY,
            record_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            start_time TEXT,
            end_time TEXT,
            room TEXT,
            teacher TEXT,
            subject_label TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY(record_id) REFERENCES session_records(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(record_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_absence_entries_record ON absence_entries(record_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_absence_entries_student ON absence_entries(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS justifications(
            record_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            content TEXT NOT NULL,
            documents TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            decided_at TEXT,
            PRIMARY KEY(record_id, student_id),
            FOREIGN KEY(record_id) REFERENCES session_records(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            dedup_key TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Older workspaces predate these columns. Add if needed.
    ensure_timetable_slots_room_teacher(conn)?;
    ensure_justifications_documents(conn)?;

    Ok(())
}

fn ensure_timetable_slots_room_teacher(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "timetable_slots", "room")? {
        conn.execute("ALTER TABLE timetable_slots ADD COLUMN room TEXT", [])?;
    }
    if !table_has_column(conn, "timetable_slots", "teacher")? {
        conn.execute("ALTER TABLE timetable_slots ADD COLUMN teacher TEXT", [])?;
    }
    Ok(())
}

fn ensure_justifications_documents(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "justifications", "documents")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE justifications ADD COLUMN documents TEXT NOT NULL DEFAULT '[]'",
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

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

// ---- Reference-data loaders feeding the schedule engine ----

pub fn get_timetable(
    conn: &Connection,
    class_id: &str,
    term: i64,
) -> anyhow::Result<Vec<TimetableSlot>> {
    let mut stmt = conn.prepare(
        "SELECT t.weekday, t.subject_id, COALESCE(s.name, t.subject_id),
                t.start_time, t.end_time, t.room, t.teacher
         FROM timetable_slots t
         LEFT JOIN subjects s ON s.id = t.subject_id
         WHERE t.class_id = ? AND t.term = ?
         ORDER BY t.weekday, t.start_time, t.end_time",
    )?;
    let rows = stmt
        .query_map((class_id, term), |r| {
            Ok(TimetableSlot {
                weekday: r.get::<_, i64>(0)? as u32,
                subject_id: r.get(1)?,
                subject_label: r.get(2)?,
                start: r.get(3)?,
                end: r.get(4)?,
                room: r.get(5)?,
                teacher: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_makeup_sessions(
    conn: &Connection,
    class_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> anyhow::Result<Vec<MakeupSession>> {
    let mut stmt = conn.prepare(
        "SELECT o.date, o.subject_id, COALESCE(s.name, o.subject_id),
                o.start_time, o.end_time, o.room, o.teacher
         FROM session_overrides o
         LEFT JOIN subjects s ON s.id = o.subject_id
         WHERE o.kind = 'makeup' AND o.class_id = ? AND o.date >= ? AND o.date <= ?
         ORDER BY o.rowid",
    )?;
    let rows = stmt
        .query_map((class_id, from.to_string(), to.to_string()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (date, subject_id, subject_label, start, end, room, teacher) in rows {
        // Rows with unreadable dates are skipped rather than failing the read.
        let Some(date) = parse_date(&date) else {
            continue;
        };
        out.push(MakeupSession {
            date,
            subject_id,
            subject_label,
            start,
            end,
            room,
            teacher,
        });
    }
    Ok(out)
}

pub fn get_closures(conn: &Connection, year_id: &str) -> anyhow::Result<Vec<ClosureRule>> {
    let mut stmt = conn.prepare(
        "SELECT id, scope, class_id, subject_id, start_date, end_date,
                window_start, window_end, label
         FROM closure_rules
         WHERE year_id = ?
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([year_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, Option<String>>(7)?,
                r.get::<_, Option<String>>(8)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, scope, class_id, subject_id, start_date, end_date, window_start, window_end, label) in
        rows
    {
        let Some(scope) = ClosureScope::from_str(&scope) else {
            continue;
        };
        let (Some(start_date), Some(end_date)) = (parse_date(&start_date), parse_date(&end_date))
        else {
            continue;
        };
        out.push(ClosureRule {
            id,
            scope,
            class_id,
            subject_id,
            start_date,
            end_date,
            start_time: window_start,
            end_time: window_end,
            label,
        });
    }
    Ok(out)
}

pub fn get_overrides(conn: &Connection, year_id: &str) -> anyhow::Result<Vec<SessionOverride>> {
    struct Row {
        kind: String,
        class_id: String,
        subject_id: String,
        subject_label: String,
        date: String,
        start: String,
        end: String,
        reason: Option<String>,
        new_date: Option<String>,
        new_start: Option<String>,
        new_end: Option<String>,
        room: Option<String>,
        teacher: Option<String>,
    }

    let mut stmt = conn.prepare(
        "SELECT o.kind, o.class_id, o.subject_id, COALESCE(s.name, o.subject_id),
                o.date, o.start_time, o.end_time, o.reason,
                o.new_date, o.new_start, o.new_end, o.room, o.teacher
         FROM session_overrides o
         LEFT JOIN subjects s ON s.id = o.subject_id
         WHERE o.year_id = ?
         ORDER BY o.rowid",
    )?;
    let rows = stmt
        .query_map([year_id], |r| {
            Ok(Row {
                kind: r.get(0)?,
                class_id: r.get(1)?,
                subject_id: r.get(2)?,
                subject_label: r.get(3)?,
                date: r.get(4)?,
                start: r.get(5)?,
                end: r.get(6)?,
                reason: r.get(7)?,
                new_date: r.get(8)?,
                new_start: r.get(9)?,
                new_end: r.get(10)?,
                room: r.get(11)?,
                teacher: r.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(date) = parse_date(&row.date) else {
            continue;
        };
        match row.kind.as_str() {
            "cancel" => out.push(SessionOverride::Cancel {
                class_id: row.class_id,
                subject_id: row.subject_id,
                date,
                start: row.start,
                end: row.end,
                reason: row.reason,
            }),
            "reschedule" => {
                let Some(new_date) = row.new_date.as_deref().and_then(parse_date) else {
                    continue;
                };
                out.push(SessionOverride::Reschedule {
                    class_id: row.class_id,
                    subject_id: row.subject_id,
                    date,
                    start: row.start,
                    end: row.end,
                    new_date,
                    new_start: row.new_start.unwrap_or_default(),
                    new_end: row.new_end.unwrap_or_default(),
                });
            }
            "makeup" => out.push(SessionOverride::Makeup {
                class_id: row.class_id,
                subject_id: row.subject_id,
                subject_label: row.subject_label,
                date,
                start: row.start,
                end: row.end,
                room: row.room,
                teacher: row.teacher,
            }),
            _ => {}
        }
    }
    Ok(out)
}

pub fn get_holidays(conn: &Connection) -> anyhow::Result<Vec<FixedHoliday>> {
    let mut stmt =
        conn.prepare("SELECT month, day, label FROM fixed_holidays ORDER BY month, day")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(FixedHoliday {
                month: r.get::<_, i64>(0)? as u32,
                day: r.get::<_, i64>(1)? as u32,
                label: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_year_bounds(conn: &Connection, year_id: &str) -> anyhow::Result<Option<YearBounds>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT start_date, end_date FROM academic_years WHERE id = ?",
            [year_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((start, end)) = row else {
        return Ok(None);
    };
    let (Some(start), Some(end)) = (parse_date(&start), parse_date(&end)) else {
        return Ok(None);
    };
    Ok(Some(YearBounds { start, end }))
}

pub fn get_roster(conn: &Connection, class_id: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM students WHERE class_id = ? ORDER BY sort_order")?;
    let rows = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Academic year a class belongs to; None when the class is unknown.
pub fn class_year(conn: &Connection, class_id: &str) -> anyhow::Result<Option<String>> {
    Ok(conn
        .query_row("SELECT year_id FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?)
}

// ---- Settings (small JSON values keyed by dotted names) ----

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

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(&raw)?))
}
