use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, now_rfc3339, require_academic_year, require_class,
    require_school, require_section, require_subject, require_teacher, require_time_slot,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::resolve;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct EntryRow {
    id: String,
    school_id: String,
    academic_year_id: String,
    class_id: String,
    section_id: String,
    day_of_week: String,
    time_slot_id: String,
    slot_name: String,
    start_time: String,
    end_time: String,
    sort_order: i64,
    subject_id: String,
    subject_name: String,
    teacher_id: String,
    teacher_name: String,
    remarks: Option<String>,
}

impl EntryRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "schoolId": self.school_id,
            "academicYearId": self.academic_year_id,
            "classId": self.class_id,
            "sectionId": self.section_id,
            "dayOfWeek": self.day_of_week,
            "timeSlotId": self.time_slot_id,
            "slotName": self.slot_name,
            "startTime": self.start_time,
            "endTime": self.end_time,
            "sortOrder": self.sort_order,
            "subjectId": self.subject_id,
            "subjectName": self.subject_name,
            "teacherId": self.teacher_id,
            "teacherName": self.teacher_name,
            "remarks": self.remarks
        })
    }
}

const ENTRY_SELECT: &str = "SELECT rt.id, rt.school_id, rt.academic_year_id, rt.class_id,
       rt.section_id, rt.day_of_week, rt.time_slot_id, ts.name, ts.start_time, ts.end_time,
       ts.sort_order, rt.subject_id, sub.name, rt.teacher_id, t.name, rt.remarks
  FROM routine_templates rt
  JOIN time_slots ts ON ts.id = rt.time_slot_id
  JOIN subjects sub ON sub.id = rt.subject_id
  JOIN teachers t ON t.id = rt.teacher_id";

fn map_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: r.get(0)?,
        school_id: r.get(1)?,
        academic_year_id: r.get(2)?,
        class_id: r.get(3)?,
        section_id: r.get(4)?,
        day_of_week: r.get(5)?,
        time_slot_id: r.get(6)?,
        slot_name: r.get(7)?,
        start_time: r.get(8)?,
        end_time: r.get(9)?,
        sort_order: r.get(10)?,
        subject_id: r.get(11)?,
        subject_name: r.get(12)?,
        teacher_id: r.get(13)?,
        teacher_name: r.get(14)?,
        remarks: r.get(15)?,
    })
}

fn fetch_entry(conn: &Connection, entry_id: &str) -> Result<Option<EntryRow>, HandlerErr> {
    let sql = format!("{} WHERE rt.id = ?", ENTRY_SELECT);
    conn.query_row(&sql, [entry_id], |r| map_entry(r))
        .optional()
        .map_err(HandlerErr::db)
}

fn routine_upsert(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let academic_year_id = get_required_str(params, "academicYearId")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let day_raw = get_required_str(params, "dayOfWeek")?;
    let time_slot_id = get_required_str(params, "timeSlotId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let remarks = get_optional_str(params, "remarks");

    let day_of_week = resolve::parse_day_of_week(&day_raw)
        .ok_or_else(|| HandlerErr::bad_params("dayOfWeek must be MONDAY..SUNDAY"))?;

    require_school(conn, &school_id)?;
    require_academic_year(conn, &academic_year_id)?;
    require_class(conn, &class_id)?;
    require_section(conn, &section_id)?;
    require_time_slot(conn, &time_slot_id)?;
    require_subject(conn, &subject_id)?;
    require_teacher(conn, &teacher_id)?;

    // Existing active entry for the exact key tuple is updated in place.
    // Teacher double-booking is deliberately not rejected here; callers use
    // routine.checkAvailability to surface conflicts for review.
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM routine_templates
             WHERE school_id = ? AND academic_year_id = ? AND class_id = ?
               AND section_id = ? AND day_of_week = ? AND time_slot_id = ?
               AND active = 1",
            (
                &school_id,
                &academic_year_id,
                &class_id,
                &section_id,
                day_of_week,
                &time_slot_id,
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;

    let now = now_rfc3339();
    let (entry_id, created) = match existing {
        Some(id) => {
            conn.execute(
                "UPDATE routine_templates
                 SET subject_id = ?, teacher_id = ?, remarks = ?, updated_at = ?
                 WHERE id = ?",
                (&subject_id, &teacher_id, &remarks, &now, &id),
            )
            .map_err(HandlerErr::db)?;
            (id, false)
        }
        None => {
            let id = Uuid::new_v4().to_string();
            // The partial unique index serializes concurrent creates of the
            // same key: a lost race falls through to the update arm.
            conn.execute(
                "INSERT INTO routine_templates(
                    id, school_id, academic_year_id, class_id, section_id,
                    day_of_week, time_slot_id, subject_id, teacher_id, remarks, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(school_id, academic_year_id, class_id, section_id, day_of_week, time_slot_id)
                 WHERE active = 1
                 DO UPDATE SET
                   subject_id = excluded.subject_id,
                   teacher_id = excluded.teacher_id,
                   remarks = excluded.remarks,
                   updated_at = excluded.updated_at",
                (
                    &id,
                    &school_id,
                    &academic_year_id,
                    &class_id,
                    &section_id,
                    day_of_week,
                    &time_slot_id,
                    &subject_id,
                    &teacher_id,
                    &remarks,
                    &now,
                ),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "routine_templates" })),
            })?;
            let saved: String = conn
                .query_row(
                    "SELECT id FROM routine_templates
                     WHERE school_id = ? AND academic_year_id = ? AND class_id = ?
                       AND section_id = ? AND day_of_week = ? AND time_slot_id = ?
                       AND active = 1",
                    (
                        &school_id,
                        &academic_year_id,
                        &class_id,
                        &section_id,
                        day_of_week,
                        &time_slot_id,
                    ),
                    |r| r.get(0),
                )
                .map_err(HandlerErr::db)?;
            let created = saved == id;
            (saved, created)
        }
    };

    let entry = fetch_entry(conn, &entry_id)?
        .ok_or_else(|| HandlerErr::not_found("routineTemplate", &entry_id))?;
    Ok(json!({ "created": created, "entry": entry.to_json() }))
}

fn routine_weekly(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let academic_year_id = get_required_str(params, "academicYearId")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;

    let sql = format!(
        "{} WHERE rt.school_id = ? AND rt.academic_year_id = ?
            AND rt.class_id = ? AND rt.section_id = ? AND rt.active = 1",
        ENTRY_SELECT
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let mut entries = stmt
        .query_map(
            (&school_id, &academic_year_id, &class_id, &section_id),
            |r| map_entry(r),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    entries.sort_by_key(|e| (resolve::day_sort_key(&e.day_of_week), e.sort_order));
    let rows: Vec<serde_json::Value> = entries.iter().map(EntryRow::to_json).collect();
    Ok(json!({ "entries": rows }))
}

fn routine_daily(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let academic_year_id = get_required_str(params, "academicYearId")?;
    let class_id = get_required_str(params, "classId")?;
    let section_id = get_required_str(params, "sectionId")?;
    let day_of_week = resolve::parse_day_of_week(&get_required_str(params, "dayOfWeek")?)
        .ok_or_else(|| HandlerErr::bad_params("dayOfWeek must be MONDAY..SUNDAY"))?;

    let sql = format!(
        "{} WHERE rt.school_id = ? AND rt.academic_year_id = ?
            AND rt.class_id = ? AND rt.section_id = ? AND rt.day_of_week = ?
            AND rt.active = 1
          ORDER BY ts.sort_order",
        ENTRY_SELECT
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let entries = stmt
        .query_map(
            (
                &school_id,
                &academic_year_id,
                &class_id,
                &section_id,
                day_of_week,
            ),
            |r| map_entry(r),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let rows: Vec<serde_json::Value> = entries.iter().map(EntryRow::to_json).collect();
    Ok(json!({ "dayOfWeek": day_of_week, "entries": rows }))
}

fn routine_by_teacher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let day_of_week = resolve::parse_day_of_week(&get_required_str(params, "dayOfWeek")?)
        .ok_or_else(|| HandlerErr::bad_params("dayOfWeek must be MONDAY..SUNDAY"))?;
    require_teacher(conn, &teacher_id)?;

    let sql = format!(
        "{} WHERE rt.teacher_id = ? AND rt.day_of_week = ? AND rt.active = 1
          ORDER BY ts.sort_order",
        ENTRY_SELECT
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let entries = stmt
        .query_map((&teacher_id, day_of_week), |r| map_entry(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let rows: Vec<serde_json::Value> = entries.iter().map(EntryRow::to_json).collect();
    Ok(json!({ "dayOfWeek": day_of_week, "entries": rows }))
}

fn routine_check_availability(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    let time_slot_id = get_required_str(params, "timeSlotId")?;
    let academic_year_id = get_required_str(params, "academicYearId")?;
    let day_of_week = match get_optional_str(params, "dayOfWeek") {
        Some(raw) => Some(
            resolve::parse_day_of_week(&raw)
                .ok_or_else(|| HandlerErr::bad_params("dayOfWeek must be MONDAY..SUNDAY"))?,
        ),
        None => None,
    };
    let exclude_class_id = get_optional_str(params, "excludeClassId");
    let exclude_section_id = get_optional_str(params, "excludeSectionId");

    require_school(conn, &school_id)?;
    require_teacher(conn, &teacher_id)?;
    require_time_slot(conn, &time_slot_id)?;

    let sql = format!(
        "{} WHERE rt.school_id = ? AND rt.teacher_id = ? AND rt.time_slot_id = ?
            AND rt.academic_year_id = ? AND rt.active = 1",
        ENTRY_SELECT
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let entries = stmt
        .query_map(
            (&school_id, &teacher_id, &time_slot_id, &academic_year_id),
            |r| map_entry(r),
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    // Updating an existing assignment must not conflict with itself.
    let conflicts: Vec<serde_json::Value> = entries
        .iter()
        .filter(|e| {
            day_of_week
                .map(|d| d == e.day_of_week.as_str())
                .unwrap_or(true)
        })
        .filter(|e| {
            !(exclude_class_id.as_deref() == Some(e.class_id.as_str())
                && exclude_section_id.as_deref() == Some(e.section_id.as_str()))
        })
        .map(EntryRow::to_json)
        .collect();

    Ok(json!({
        "available": conflicts.is_empty(),
        "conflicts": conflicts
    }))
}

fn routine_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let entry_id = get_required_str(params, "entryId")?;
    let updated = conn
        .execute(
            "UPDATE routine_templates SET active = 0, updated_at = ? WHERE id = ? AND active = 1",
            (&now_rfc3339(), &entry_id),
        )
        .map_err(HandlerErr::db)?;
    if updated == 0 {
        return Err(HandlerErr::not_found("routineTemplate", &entry_id));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !matches!(
        req.method.as_str(),
        "routine.upsert"
            | "routine.weekly"
            | "routine.daily"
            | "routine.byTeacher"
            | "routine.checkAvailability"
            | "routine.delete"
    ) {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "routine.upsert" => routine_upsert(conn, &req.params),
        "routine.weekly" => routine_weekly(conn, &req.params),
        "routine.daily" => routine_daily(conn, &req.params),
        "routine.byTeacher" => routine_by_teacher(conn, &req.params),
        "routine.checkAvailability" => routine_check_availability(conn, &req.params),
        "routine.delete" => routine_delete(conn, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
