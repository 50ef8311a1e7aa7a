use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            school_year TEXT NOT NULL,
            term TEXT NOT NULL,
            scheme_type TEXT NOT NULL DEFAULT 'deped_k12',
            weight_policy TEXT NOT NULL DEFAULT 'normalize',
            rounding_mode TEXT NOT NULL DEFAULT 'floor'
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_section_sort ON students(section_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS gradebook_components(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(section_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_components_section ON gradebook_components(section_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS weight_profiles(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            UNIQUE(section_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS component_weights(
            id TEXT PRIMARY KEY,
            weight_profile_id TEXT NOT NULL,
            component_id TEXT NOT NULL,
            weight_percent REAL NOT NULL,
            FOREIGN KEY(weight_profile_id) REFERENCES weight_profiles(id),
            FOREIGN KEY(component_id) REFERENCES gradebook_components(id),
            UNIQUE(weight_profile_id, component_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_component_weights_profile
         ON component_weights(weight_profile_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS graded_items(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            component_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            title TEXT NOT NULL,
            date TEXT,
            max_points REAL NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(component_id) REFERENCES gradebook_components(id),
            UNIQUE(section_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_graded_items_section ON graded_items(section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_graded_items_component ON graded_items(component_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS graded_scores(
            id TEXT PRIMARY KEY,
            graded_item_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            points REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            FOREIGN KEY(graded_item_id) REFERENCES graded_items(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(graded_item_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_graded_scores_item ON graded_scores(graded_item_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_graded_scores_student ON graded_scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transmutation_tables(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            UNIQUE(name, version)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transmutation_rows(
            table_id TEXT NOT NULL,
            initial_grade INTEGER NOT NULL,
            transmuted_grade REAL NOT NULL,
            PRIMARY KEY(table_id, initial_grade),
            FOREIGN KEY(table_id) REFERENCES transmutation_tables(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS computed_grades(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            weight_profile_id TEXT NOT NULL,
            initial_grade REAL NOT NULL,
            final_numeric_grade REAL NOT NULL,
            transmuted_grade REAL,
            breakdown TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(section_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_computed_grades_section ON computed_grades(section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_computed_grades_run ON computed_grades(run_id)",
        [],
    )?;

    Ok(conn)
}
