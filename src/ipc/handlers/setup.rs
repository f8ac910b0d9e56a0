use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, require_class, require_school, require_section, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn name_taken(
    conn: &Connection,
    sql: &str,
    scope_id: &str,
    name: &str,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(sql, (scope_id, name), |r| r.get::<_, String>(0))
        .optional()
        .map_err(HandlerErr::db)
}

fn school_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let existing: Option<String> = conn
        .query_row("SELECT id FROM schools WHERE name = ?", [&name], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if let Some(id) = existing {
        return Err(HandlerErr::conflict(
            "school name already exists",
            Some(json!({ "entity": "school", "conflictingId": id })),
        ));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute("INSERT INTO schools(id, name) VALUES(?, ?)", (&id, &name))
        .map_err(HandlerErr::db)?;
    Ok(json!({ "schoolId": id, "name": name }))
}

fn school_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, active FROM schools ORDER BY name")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "active": r.get::<_, i64>(2)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "schools": rows }))
}

fn academic_year_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let name = get_required_str(params, "name")?;
    require_school(conn, &school_id)?;
    if let Some(id) = name_taken(
        conn,
        "SELECT id FROM academic_years WHERE school_id = ? AND name = ?",
        &school_id,
        &name,
    )? {
        return Err(HandlerErr::conflict(
            "academic year already exists for this school",
            Some(json!({ "entity": "academicYear", "conflictingId": id })),
        ));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO academic_years(id, school_id, name) VALUES(?, ?, ?)",
        (&id, &school_id, &name),
    )
    .map_err(HandlerErr::db)?;
    Ok(json!({ "academicYearId": id, "name": name }))
}

fn academic_year_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let mut stmt = conn
        .prepare("SELECT id, name, active FROM academic_years WHERE school_id = ? ORDER BY name")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "active": r.get::<_, i64>(2)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "academicYears": rows }))
}

fn class_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let name = get_required_str(params, "name")?;
    require_school(conn, &school_id)?;
    if let Some(id) = name_taken(
        conn,
        "SELECT id FROM classes WHERE school_id = ? AND name = ?",
        &school_id,
        &name,
    )? {
        return Err(HandlerErr::conflict(
            "class name already exists for this school",
            Some(json!({ "entity": "class", "conflictingId": id })),
        ));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, school_id, name) VALUES(?, ?, ?)",
        (&id, &school_id, &name),
    )
    .map_err(HandlerErr::db)?;
    Ok(json!({ "classId": id, "name": name }))
}

fn class_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name,
               (SELECT COUNT(*) FROM sections s WHERE s.class_id = c.id) AS section_count
             FROM classes c
             WHERE c.school_id = ?
             ORDER BY c.name",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "sectionCount": r.get::<_, i64>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "classes": rows }))
}

fn section_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = get_required_str(params, "name")?;
    require_class(conn, &class_id)?;
    if let Some(id) = name_taken(
        conn,
        "SELECT id FROM sections WHERE class_id = ? AND name = ?",
        &class_id,
        &name,
    )? {
        return Err(HandlerErr::conflict(
            "section name already exists for this class",
            Some(json!({ "entity": "section", "conflictingId": id })),
        ));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sections(id, class_id, name) VALUES(?, ?, ?)",
        (&id, &class_id, &name),
    )
    .map_err(HandlerErr::db)?;
    Ok(json!({ "sectionId": id, "name": name }))
}

fn section_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(conn, &class_id)?;
    let mut stmt = conn
        .prepare("SELECT id, name FROM sections WHERE class_id = ? ORDER BY name")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "sections": rows }))
}

fn subject_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let name = get_required_str(params, "name")?;
    let code = get_optional_str(params, "code");
    require_school(conn, &school_id)?;
    if let Some(id) = name_taken(
        conn,
        "SELECT id FROM subjects WHERE school_id = ? AND name = ?",
        &school_id,
        &name,
    )? {
        return Err(HandlerErr::conflict(
            "subject name already exists for this school",
            Some(json!({ "entity": "subject", "conflictingId": id })),
        ));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, school_id, name, code) VALUES(?, ?, ?, ?)",
        (&id, &school_id, &name, &code),
    )
    .map_err(HandlerErr::db)?;
    Ok(json!({ "subjectId": id, "name": name }))
}

fn subject_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let mut stmt = conn
        .prepare("SELECT id, name, code FROM subjects WHERE school_id = ? ORDER BY name")
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "code": r.get::<_, Option<String>>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "subjects": rows }))
}

fn teacher_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let name = get_required_str(params, "name")?;
    require_school(conn, &school_id)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teachers(id, school_id, name) VALUES(?, ?, ?)",
        (&id, &school_id, &name),
    )
    .map_err(HandlerErr::db)?;
    Ok(json!({ "teacherId": id, "name": name }))
}

fn teacher_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, active FROM teachers WHERE school_id = ? ORDER BY name",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&school_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "active": r.get::<_, i64>(2)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "teachers": rows }))
}

fn student_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let name = get_required_str(params, "name")?;
    let section_id = get_optional_str(params, "sectionId");
    let roll_no = get_optional_str(params, "rollNo");
    require_school(conn, &school_id)?;
    if let Some(sid) = section_id.as_deref() {
        require_section(conn, sid)?;
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, school_id, section_id, name, roll_no) VALUES(?, ?, ?, ?, ?)",
        (&id, &school_id, &section_id, &name, &roll_no),
    )
    .map_err(HandlerErr::db)?;
    Ok(json!({ "studentId": id, "name": name }))
}

fn student_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let section_id = get_required_str(params, "sectionId")?;
    require_section(conn, &section_id)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, name, roll_no, active
             FROM students
             WHERE section_id = ?
             ORDER BY name",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&section_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "rollNo": r.get::<_, Option<String>>(2)?,
                "active": r.get::<_, i64>(3)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "students": rows }))
}

fn dispatch(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Option<Result<serde_json::Value, HandlerErr>> {
    match method {
        "schools.create" => Some(school_create(conn, params)),
        "schools.list" => Some(school_list(conn)),
        "academicYears.create" => Some(academic_year_create(conn, params)),
        "academicYears.list" => Some(academic_year_list(conn, params)),
        "classes.create" => Some(class_create(conn, params)),
        "classes.list" => Some(class_list(conn, params)),
        "sections.create" => Some(section_create(conn, params)),
        "sections.list" => Some(section_list(conn, params)),
        "subjects.create" => Some(subject_create(conn, params)),
        "subjects.list" => Some(subject_list(conn, params)),
        "teachers.create" => Some(teacher_create(conn, params)),
        "teachers.list" => Some(teacher_list(conn, params)),
        "students.create" => Some(student_create(conn, params)),
        "students.list" => Some(student_list(conn, params)),
        _ => None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if dispatch_method(&req.method) {
        let Some(conn) = state.db.as_ref() else {
            return Some(err(&req.id, "no_workspace", "select a workspace first", None));
        };
        return dispatch(conn, &req.method, &req.params).map(|r| match r {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        });
    }
    None
}

fn dispatch_method(method: &str) -> bool {
    matches!(
        method,
        "schools.create"
            | "schools.list"
            | "academicYears.create"
            | "academicYears.list"
            | "classes.create"
            | "classes.list"
            | "sections.create"
            | "sections.list"
            | "subjects.create"
            | "subjects.list"
            | "teachers.create"
            | "teachers.list"
            | "students.create"
            | "students.list"
    )
}
