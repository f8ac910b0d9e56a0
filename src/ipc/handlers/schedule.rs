use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, now_rfc3339, require_academic_year, require_class,
    require_school, require_section, require_subject, require_teacher, require_time_slot,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::resolve::{self, DailyOverride, TemplateSlot};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

struct TemplateDisplay {
    slot_name: String,
    start_time: String,
    end_time: String,
    sort_order: i64,
    subject_name: String,
    teacher_name: String,
    remarks: Option<String>,
}

fn name_map(conn: &Connection, sql: &str, school_id: &str) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([school_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(rows.into_iter().collect())
}

fn load_day_template(
    conn: &Connection,
    school_id: &str,
    academic_year_id: &str,
    class_id: &str,
    section_id: &str,
    day_of_week: &str,
) -> Result<(Vec<TemplateSlot>, HashMap<String, TemplateDisplay>), HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT rt.id, rt.time_slot_id, rt.subject_id, rt.teacher_id,
                    ts.name, ts.start_time, ts.end_time, ts.sort_order,
                    sub.name, t.name, rt.remarks
             FROM routine_templates rt
             JOIN time_slots ts ON ts.id = rt.time_slot_id
             JOIN subjects sub ON sub.id = rt.subject_id
             JOIN teachers t ON t.id = rt.teacher_id
             WHERE rt.school_id = ? AND rt.academic_year_id = ?
               AND rt.class_id = ? AND rt.section_id = ? AND rt.day_of_week = ?
               AND rt.active = 1
             ORDER BY ts.sort_order",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(
            (school_id, academic_year_id, class_id, section_id, day_of_week),
            |r| {
                Ok((
                    TemplateSlot {
                        template_id: r.get(0)?,
                        time_slot_id: r.get(1)?,
                        subject_id: r.get(2)?,
                        teacher_id: r.get(3)?,
                    },
                    TemplateDisplay {
                        slot_name: r.get(4)?,
                        start_time: r.get(5)?,
                        end_time: r.get(6)?,
                        sort_order: r.get(7)?,
                        subject_name: r.get(8)?,
                        teacher_name: r.get(9)?,
                        remarks: r.get(10)?,
                    },
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut template = Vec::with_capacity(rows.len());
    let mut display = HashMap::new();
    for (slot, info) in rows {
        display.insert(slot.template_id.clone(), info);
        template.push(slot);
    }
    Ok((template, display))
}

fn load_day_sessions(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
    section_id: &str,
    date: &str,
) -> Result<Vec<DailyOverride>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, routine_template_id, subject_override_id, teacher_override_id,
                    actual_teacher_id, status, attendance_marked, remarks
             FROM daily_sessions
             WHERE school_id = ? AND class_id = ? AND section_id = ? AND session_date = ?",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map((school_id, class_id, section_id, date), |r| {
        Ok(DailyOverride {
            session_id: r.get(0)?,
            routine_template_id: r.get(1)?,
            subject_override_id: r.get(2)?,
            teacher_override_id: r.get(3)?,
            actual_teacher_id: r.get(4)?,
            status: r.get(5)?,
            attendance_marked: r.get::<_, i64>(6)? != 0,
            remarks: r.get(7)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn schedule_resolve_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let academic_year_id = get_required_str(params, "academicYearId")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let date_raw = get_required_str(params, "date")?;
    let date = resolve::parse_date(&date_raw)
        .ok_or_else(|| HandlerErr::bad_params("date must be YYYY-MM-DD"))?;

    require_school(conn, &school_id)?;
    require_academic_year(conn, &academic_year_id)?;
    require_class(conn, &class_id)?;
    require_section(conn, &section_id)?;

    let day_of_week = resolve::weekday_name(date);
    let (template, display) = load_day_template(
        conn,
        &school_id,
        &academic_year_id,
        &class_id,
        &section_id,
        day_of_week,
    )?;
    let overrides = load_day_sessions(conn, &school_id, &class_id, &section_id, &date_raw)?;
    let resolved = resolve::overlay_day(&template, &overrides);

    let subjects = name_map(conn, "SELECT id, name FROM subjects WHERE school_id = ?", &school_id)?;
    let teachers = name_map(conn, "SELECT id, name FROM teachers WHERE school_id = ?", &school_id)?;

    let rows: Vec<serde_json::Value> = resolved
        .iter()
        .map(|slot| {
            let info = display.get(&slot.template_id);
            let mut row = json!({
                "routineTemplateId": slot.template_id,
                "timeSlotId": slot.time_slot_id,
                "slotName": info.map(|i| i.slot_name.clone()),
                "startTime": info.map(|i| i.start_time.clone()),
                "endTime": info.map(|i| i.end_time.clone()),
                "sortOrder": info.map(|i| i.sort_order),
                "subjectId": slot.effective_subject_id,
                "subjectName": subjects.get(&slot.effective_subject_id),
                "teacherId": slot.effective_teacher_id,
                "teacherName": teachers.get(&slot.effective_teacher_id),
                "hasSession": slot.session.is_some(),
            });
            match &slot.session {
                Some(s) => {
                    row["sessionId"] = json!(s.session_id);
                    row["status"] = json!(s.status);
                    row["attendanceMarked"] = json!(s.attendance_marked);
                    row["actualTeacherId"] = json!(s.actual_teacher_id);
                    row["actualTeacherName"] = json!(s
                        .actual_teacher_id
                        .as_ref()
                        .and_then(|id| teachers.get(id)));
                    row["remarks"] = json!(s.remarks);
                }
                None => {
                    row["sessionId"] = serde_json::Value::Null;
                    row["remarks"] = json!(info.and_then(|i| i.remarks.clone()));
                }
            }
            row
        })
        .collect();

    Ok(json!({
        "date": date_raw,
        "dayOfWeek": day_of_week,
        "slots": rows
    }))
}

fn schedule_resolve_teacher_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let date_raw = get_required_str(params, "date")?;
    let date = resolve::parse_date(&date_raw)
        .ok_or_else(|| HandlerErr::bad_params("date must be YYYY-MM-DD"))?;
    require_teacher(conn, &teacher_id)?;

    let day_of_week = resolve::weekday_name(date);

    // A teacher's day is their template rows for the weekday, minus slots a
    // session reassigns away, plus slots a session reassigns onto them.
    let mut stmt = conn
        .prepare(
            "SELECT rt.id, rt.class_id, c.name, rt.section_id, sec.name,
                    rt.time_slot_id, ts.name, ts.start_time, ts.end_time, ts.sort_order,
                    rt.subject_id, rt.teacher_id,
                    ds.id, ds.subject_override_id, ds.teacher_override_id,
                    ds.actual_teacher_id, ds.status, ds.attendance_marked
             FROM routine_templates rt
             JOIN classes c ON c.id = rt.class_id
             JOIN sections sec ON sec.id = rt.section_id
             JOIN time_slots ts ON ts.id = rt.time_slot_id
             LEFT JOIN daily_sessions ds
               ON ds.routine_template_id = rt.id AND ds.session_date = ?
             WHERE rt.day_of_week = ? AND rt.active = 1
               AND (rt.teacher_id = ? OR ds.teacher_override_id = ?)
             ORDER BY ts.sort_order",
        )
        .map_err(HandlerErr::db)?;

    struct TeacherSlot {
        template_id: String,
        class_id: String,
        class_name: String,
        section_id: String,
        section_name: String,
        time_slot_id: String,
        slot_name: String,
        start_time: String,
        end_time: String,
        sort_order: i64,
        subject_id: String,
        template_teacher_id: String,
        session_id: Option<String>,
        subject_override_id: Option<String>,
        teacher_override_id: Option<String>,
        actual_teacher_id: Option<String>,
        status: Option<String>,
        attendance_marked: Option<i64>,
    }

    let rows = stmt
        .query_map((&date_raw, day_of_week, &teacher_id, &teacher_id), |r| {
            Ok(TeacherSlot {
                template_id: r.get(0)?,
                class_id: r.get(1)?,
                class_name: r.get(2)?,
                section_id: r.get(3)?,
                section_name: r.get(4)?,
                time_slot_id: r.get(5)?,
                slot_name: r.get(6)?,
                start_time: r.get(7)?,
                end_time: r.get(8)?,
                sort_order: r.get(9)?,
                subject_id: r.get(10)?,
                template_teacher_id: r.get(11)?,
                session_id: r.get(12)?,
                subject_override_id: r.get(13)?,
                teacher_override_id: r.get(14)?,
                actual_teacher_id: r.get(15)?,
                status: r.get(16)?,
                attendance_marked: r.get(17)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let slots: Vec<serde_json::Value> = rows
        .iter()
        .filter(|row| {
            let effective_teacher = resolve::effective(
                row.teacher_override_id.as_deref(),
                &row.template_teacher_id,
            );
            effective_teacher == teacher_id
        })
        .map(|row| {
            let effective_subject =
                resolve::effective(row.subject_override_id.as_deref(), &row.subject_id);
            json!({
                "routineTemplateId": row.template_id,
                "classId": row.class_id,
                "className": row.class_name,
                "sectionId": row.section_id,
                "sectionName": row.section_name,
                "timeSlotId": row.time_slot_id,
                "slotName": row.slot_name,
                "startTime": row.start_time,
                "endTime": row.end_time,
                "sortOrder": row.sort_order,
                "subjectId": effective_subject,
                "teacherId": teacher_id,
                "substitution": row.teacher_override_id.is_some(),
                "hasSession": row.session_id.is_some(),
                "sessionId": row.session_id,
                "status": row.status,
                "actualTeacherId": row.actual_teacher_id,
                "attendanceMarked": row.attendance_marked.map(|v| v != 0)
            })
        })
        .collect();

    Ok(json!({
        "date": date_raw,
        "dayOfWeek": day_of_week,
        "teacherId": teacher_id,
        "slots": slots
    }))
}

fn fetch_session(conn: &Connection, session_id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, school_id, academic_year_id, class_id, section_id, session_date,
                time_slot_id, routine_template_id, subject_override_id, teacher_override_id,
                actual_teacher_id, status, attendance_marked, remarks, updated_at
         FROM daily_sessions
         WHERE id = ?",
        [session_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "schoolId": r.get::<_, String>(1)?,
                "academicYearId": r.get::<_, String>(2)?,
                "classId": r.get::<_, String>(3)?,
                "sectionId": r.get::<_, String>(4)?,
                "date": r.get::<_, String>(5)?,
                "timeSlotId": r.get::<_, String>(6)?,
                "routineTemplateId": r.get::<_, Option<String>>(7)?,
                "subjectOverrideId": r.get::<_, Option<String>>(8)?,
                "teacherOverrideId": r.get::<_, Option<String>>(9)?,
                "actualTeacherId": r.get::<_, Option<String>>(10)?,
                "status": r.get::<_, String>(11)?,
                "attendanceMarked": r.get::<_, i64>(12)? != 0,
                "remarks": r.get::<_, Option<String>>(13)?,
                "updatedAt": r.get::<_, Option<String>>(14)?
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db)
}

fn parse_status(raw: &str) -> Result<String, HandlerErr> {
    let upper = raw.trim().to_ascii_uppercase();
    if resolve::SESSION_STATUSES.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(HandlerErr::bad_params(format!(
            "status must be one of {}",
            resolve::SESSION_STATUSES.join(", ")
        )))
    }
}

/// The only path that creates a DailySession row. Reads never do.
fn schedule_upsert_session(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let academic_year_id = get_required_str(params, "academicYearId")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let date_raw = get_required_str(params, "date")?;
    let time_slot_id = get_required_str(params, "timeSlotId")?;
    let routine_template_id = get_optional_str(params, "routineTemplateId");
    let subject_override_id = get_optional_str(params, "subjectOverrideId");
    let teacher_override_id = get_optional_str(params, "teacherOverrideId");
    let actual_teacher_id = get_optional_str(params, "actualTeacherId");
    let status = match get_optional_str(params, "status") {
        Some(raw) => Some(parse_status(&raw)?),
        None => None,
    };
    let remarks = get_optional_str(params, "remarks");

    if resolve::parse_date(&date_raw).is_none() {
        return Err(HandlerErr::bad_params("date must be YYYY-MM-DD"));
    }
    require_school(conn, &school_id)?;
    require_academic_year(conn, &academic_year_id)?;
    require_class(conn, &class_id)?;
    require_section(conn, &section_id)?;
    require_time_slot(conn, &time_slot_id)?;
    if let Some(rt) = routine_template_id.as_deref() {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM routine_templates WHERE id = ? AND active = 1",
                [rt],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db)?;
        if exists.is_none() {
            return Err(HandlerErr::not_found("routineTemplate", rt));
        }
    }
    if let Some(id) = subject_override_id.as_deref() {
        require_subject(conn, id)?;
    }
    if let Some(id) = teacher_override_id.as_deref() {
        require_teacher(conn, id)?;
    }
    if let Some(id) = actual_teacher_id.as_deref() {
        require_teacher(conn, id)?;
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM daily_sessions
             WHERE school_id = ? AND class_id = ? AND section_id = ?
               AND session_date = ? AND time_slot_id = ?",
            (&school_id, &class_id, &section_id, &date_raw, &time_slot_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;

    if existing.is_none() && routine_template_id.is_none() {
        // Ad-hoc session: nothing to fall back on, so both overrides are
        // required up front.
        if subject_override_id.is_none() || teacher_override_id.is_none() {
            return Err(HandlerErr::bad_params(
                "a session without routineTemplateId requires subjectOverrideId and teacherOverrideId",
            ));
        }
    }

    let session_id = match existing {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            // The unique key turns a lost creation race into an update.
            tx.execute(
                "INSERT INTO daily_sessions(
                    id, school_id, academic_year_id, class_id, section_id,
                    session_date, time_slot_id, routine_template_id, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(school_id, class_id, section_id, session_date, time_slot_id)
                 DO NOTHING",
                (
                    &id,
                    &school_id,
                    &academic_year_id,
                    &class_id,
                    &section_id,
                    &date_raw,
                    &time_slot_id,
                    &routine_template_id,
                    &now_rfc3339(),
                ),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "daily_sessions" })),
            })?;
            tx.query_row(
                "SELECT id FROM daily_sessions
                 WHERE school_id = ? AND class_id = ? AND section_id = ?
                   AND session_date = ? AND time_slot_id = ?",
                (&school_id, &class_id, &section_id, &date_raw, &time_slot_id),
                |r| r.get(0),
            )
            .map_err(HandlerErr::db)?
        }
    };

    if let Some(v) = subject_override_id.as_deref() {
        tx.execute(
            "UPDATE daily_sessions SET subject_override_id = ? WHERE id = ?",
            (v, &session_id),
        )
        .map_err(HandlerErr::db)?;
    }
    if let Some(v) = teacher_override_id.as_deref() {
        tx.execute(
            "UPDATE daily_sessions SET teacher_override_id = ? WHERE id = ?",
            (v, &session_id),
        )
        .map_err(HandlerErr::db)?;
    }
    if let Some(v) = actual_teacher_id.as_deref() {
        tx.execute(
            "UPDATE daily_sessions SET actual_teacher_id = ? WHERE id = ?",
            (v, &session_id),
        )
        .map_err(HandlerErr::db)?;
    }
    if let Some(v) = status.as_deref() {
        tx.execute(
            "UPDATE daily_sessions SET status = ? WHERE id = ?",
            (v, &session_id),
        )
        .map_err(HandlerErr::db)?;
    }
    if let Some(v) = remarks.as_deref() {
        tx.execute(
            "UPDATE daily_sessions SET remarks = ? WHERE id = ?",
            (v, &session_id),
        )
        .map_err(HandlerErr::db)?;
    }
    tx.execute(
        "UPDATE daily_sessions SET updated_at = ? WHERE id = ?",
        (&now_rfc3339(), &session_id),
    )
    .map_err(HandlerErr::db)?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let session = fetch_session(conn, &session_id)?
        .ok_or_else(|| HandlerErr::not_found("dailySession", &session_id))?;
    Ok(json!({ "session": session }))
}

fn schedule_set_session_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let status = parse_status(&get_required_str(params, "status")?)?;
    let remarks = get_optional_str(params, "remarks");

    // Transitions are deliberately unrestricted: any status may follow any
    // other. Sane-transition policy belongs to the caller.
    let updated = match remarks {
        Some(r) => conn
            .execute(
                "UPDATE daily_sessions SET status = ?, remarks = ?, updated_at = ? WHERE id = ?",
                (&status, &r, &now_rfc3339(), &session_id),
            )
            .map_err(HandlerErr::db)?,
        None => conn
            .execute(
                "UPDATE daily_sessions SET status = ?, updated_at = ? WHERE id = ?",
                (&status, &now_rfc3339(), &session_id),
            )
            .map_err(HandlerErr::db)?,
    };
    if updated == 0 {
        return Err(HandlerErr::not_found("dailySession", &session_id));
    }
    let session = fetch_session(conn, &session_id)?
        .ok_or_else(|| HandlerErr::not_found("dailySession", &session_id))?;
    Ok(json!({ "session": session }))
}

fn schedule_mark_attendance_completed(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let updated = conn
        .execute(
            "UPDATE daily_sessions SET attendance_marked = 1, updated_at = ? WHERE id = ?",
            (&now_rfc3339(), &session_id),
        )
        .map_err(HandlerErr::db)?;
    if updated == 0 {
        return Err(HandlerErr::not_found("dailySession", &session_id));
    }
    Ok(json!({ "ok": true }))
}

fn schedule_extra_sessions(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let date_raw = get_required_str(params, "date")?;
    if resolve::parse_date(&date_raw).is_none() {
        return Err(HandlerErr::bad_params("date must be YYYY-MM-DD"));
    }
    require_school(conn, &school_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT ds.id
             FROM daily_sessions ds
             JOIN time_slots ts ON ts.id = ds.time_slot_id
             WHERE ds.school_id = ? AND ds.session_date = ? AND ds.routine_template_id IS NULL
             ORDER BY ts.sort_order",
        )
        .map_err(HandlerErr::db)?;
    let ids = stmt
        .query_map((&school_id, &date_raw), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut sessions = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(s) = fetch_session(conn, &id)? {
            sessions.push(s);
        }
    }
    Ok(json!({ "date": date_raw, "sessions": sessions }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !matches!(
        req.method.as_str(),
        "schedule.resolveDay"
            | "schedule.resolveTeacherDay"
            | "schedule.upsertSession"
            | "schedule.setSessionStatus"
            | "schedule.markAttendanceCompleted"
            | "schedule.extraSessions"
    ) {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "schedule.resolveDay" => schedule_resolve_day(conn, &req.params),
        "schedule.resolveTeacherDay" => schedule_resolve_teacher_day(conn, &req.params),
        "schedule.upsertSession" => schedule_upsert_session(conn, &req.params),
        "schedule.setSessionStatus" => schedule_set_session_status(conn, &req.params),
        "schedule.markAttendanceCompleted" => schedule_mark_attendance_completed(conn, &req.params),
        "schedule.extraSessions" => schedule_extra_sessions(conn, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
