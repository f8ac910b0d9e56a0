use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("routine.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            UNIQUE(school_id, name),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_academic_years_school ON academic_years(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(school_id, name),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_school ON classes(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(class_id, name),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_class ON sections(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            UNIQUE(school_id, name),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_school ON subjects(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_school ON teachers(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            section_id TEXT,
            name TEXT NOT NULL,
            roll_no TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_school ON students(school_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_section ON students(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS time_slots(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            slot_type TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_time_slots_school ON time_slots(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS routine_templates(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            day_of_week TEXT NOT NULL,
            time_slot_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            remarks TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(time_slot_id) REFERENCES time_slots(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    // One active entry per slot coordinate; inactive rows stay behind as history.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_routine_templates_key
         ON routine_templates(school_id, academic_year_id, class_id, section_id, day_of_week, time_slot_id)
         WHERE active = 1",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_routine_templates_section
         ON routine_templates(class_id, section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_routine_templates_teacher
         ON routine_templates(teacher_id, day_of_week)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS daily_sessions(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            academic_year_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            session_date TEXT NOT NULL,
            time_slot_id TEXT NOT NULL,
            routine_template_id TEXT,
            subject_override_id TEXT,
            teacher_override_id TEXT,
            status TEXT NOT NULL DEFAULT 'SCHEDULED',
            attendance_marked INTEGER NOT NULL DEFAULT 0,
            remarks TEXT,
            updated_at TEXT,
            UNIQUE(school_id, class_id, section_id, session_date, time_slot_id),
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(academic_year_id) REFERENCES academic_years(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(time_slot_id) REFERENCES time_slots(id),
            FOREIGN KEY(routine_template_id) REFERENCES routine_templates(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_daily_sessions_date ON daily_sessions(session_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_daily_sessions_template
         ON daily_sessions(routine_template_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_daily_sessions_section_date
         ON daily_sessions(class_id, section_id, session_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            daily_session_id TEXT,
            target_kind TEXT NOT NULL,
            target_id TEXT NOT NULL,
            attendance_date TEXT NOT NULL,
            status TEXT NOT NULL,
            remarks TEXT,
            marked_at TEXT NOT NULL,
            marked_by TEXT NOT NULL,
            FOREIGN KEY(daily_session_id) REFERENCES daily_sessions(id),
            FOREIGN KEY(marked_by) REFERENCES teachers(id)
        )",
        [],
    )?;
    // One record per (session, person). NULL session ids are distinct to
    // SQLite, so session-less staff records dedupe per (person, date) instead.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_session_target
         ON attendance_records(daily_session_id, target_id)
         WHERE daily_session_id IS NOT NULL",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_target_date
         ON attendance_records(target_id, attendance_date)
         WHERE daily_session_id IS NULL",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_target ON attendance_records(target_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_session ON attendance_records(daily_session_id)",
        [],
    )?;

    // The actual-teacher column arrived after the first schema shipped, so
    // it is added here rather than in the CREATE TABLE above.
    ensure_sessions_actual_teacher(&conn)?;

    Ok(conn)
}

fn ensure_sessions_actual_teacher(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "daily_sessions", "actual_teacher_id")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE daily_sessions ADD COLUMN actual_teacher_id TEXT",
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
