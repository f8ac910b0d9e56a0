use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, now_rfc3339, require_teacher, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::resolve;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn record_json(
    id: &str,
    session_id: Option<&str>,
    target_kind: &str,
    target_id: &str,
    date: &str,
    status: &str,
    remarks: Option<&str>,
    marked_at: &str,
    marked_by: &str,
) -> serde_json::Value {
    json!({
        "id": id,
        "sessionId": session_id,
        "targetKind": target_kind,
        "targetId": target_id,
        "date": date,
        "status": status,
        "remarks": remarks,
        "markedAt": marked_at,
        "markedBy": marked_by
    })
}

fn classify_target(conn: &Connection, target_id: &str) -> Result<&'static str, HandlerErr> {
    let is_student: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND active = 1",
            [target_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if is_student.is_some() {
        return Ok("STUDENT");
    }
    let is_staff: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM teachers WHERE id = ? AND active = 1",
            [target_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if is_staff.is_some() {
        return Ok("STAFF");
    }
    Err(HandlerErr::not_found("target", target_id))
}

fn validate_status(kind: &str, raw: &str) -> Result<String, HandlerErr> {
    let upper = raw.trim().to_ascii_uppercase();
    let allowed: &[&str] = if kind == "STUDENT" {
        &resolve::STUDENT_ATTENDANCE_STATUSES
    } else {
        &resolve::STAFF_ATTENDANCE_STATUSES
    };
    if allowed.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(HandlerErr::bad_params(format!(
            "status for {} must be one of {}",
            kind.to_ascii_lowercase(),
            allowed.join(", ")
        )))
    }
}

/// Bulk marking is all-or-nothing: the first unresolvable target rolls the
/// whole batch back.
fn attendance_mark_bulk(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_optional_str(params, "sessionId");
    let marked_by = get_required_str(params, "markedBy")?;
    let Some(items) = params.get("items").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing items"));
    };
    if items.is_empty() {
        return Err(HandlerErr::bad_params("items must not be empty"));
    }

    require_teacher(conn, &marked_by)?;

    let attendance_date = match session_id.as_deref() {
        Some(sid) => {
            let date: Option<String> = conn
                .query_row(
                    "SELECT session_date FROM daily_sessions WHERE id = ?",
                    [sid],
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::db)?;
            date.ok_or_else(|| HandlerErr::not_found("dailySession", sid))?
        }
        None => {
            let raw = get_required_str(params, "date")?;
            if resolve::parse_date(&raw).is_none() {
                return Err(HandlerErr::bad_params("date must be YYYY-MM-DD"));
            }
            raw
        }
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let marked_at = now_rfc3339();
    let mut saved: Vec<serde_json::Value> = Vec::with_capacity(items.len());
    for item in items {
        let target_id = get_required_str(item, "targetId")?;
        let status_raw = get_required_str(item, "status")?;
        let remarks = get_optional_str(item, "remarks");

        let kind = classify_target(&tx, &target_id)?;
        let status = validate_status(kind, &status_raw)?;

        let existing: Option<String> = match session_id.as_deref() {
            Some(sid) => tx
                .query_row(
                    "SELECT id FROM attendance_records
                     WHERE daily_session_id = ? AND target_id = ?",
                    (sid, &target_id),
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::db)?,
            None => tx
                .query_row(
                    "SELECT id FROM attendance_records
                     WHERE daily_session_id IS NULL AND target_id = ? AND attendance_date = ?",
                    (&target_id, &attendance_date),
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::db)?,
        };

        let record_id = match existing {
            Some(id) => {
                // Repeated marking overwrites in place, never appends.
                tx.execute(
                    "UPDATE attendance_records
                     SET status = ?, remarks = ?, marked_at = ?, marked_by = ?
                     WHERE id = ?",
                    (&status, &remarks, &marked_at, &marked_by, &id),
                )
                .map_err(|e| HandlerErr {
                    code: "db_update_failed",
                    message: e.to_string(),
                    details: Some(json!({ "table": "attendance_records" })),
                })?;
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO attendance_records(
                        id, daily_session_id, target_kind, target_id, attendance_date,
                        status, remarks, marked_at, marked_by)
                     VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    (
                        &id,
                        &session_id,
                        kind,
                        &target_id,
                        &attendance_date,
                        &status,
                        &remarks,
                        &marked_at,
                        &marked_by,
                    ),
                )
                .map_err(|e| HandlerErr {
                    code: "db_insert_failed",
                    message: e.to_string(),
                    details: Some(json!({ "table": "attendance_records" })),
                })?;
                id
            }
        };

        saved.push(record_json(
            &record_id,
            session_id.as_deref(),
            kind,
            &target_id,
            &attendance_date,
            &status,
            remarks.as_deref(),
            &marked_at,
            &marked_by,
        ));
    }

    if let Some(sid) = session_id.as_deref() {
        tx.execute(
            "UPDATE daily_sessions SET attendance_marked = 1, updated_at = ? WHERE id = ?",
            (&now_rfc3339(), sid),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "daily_sessions" })),
        })?;
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "records": saved }))
}

fn attendance_session_records(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM daily_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("dailySession", &session_id));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, target_kind, target_id, attendance_date, status, remarks,
                    marked_at, marked_by
             FROM attendance_records
             WHERE daily_session_id = ?
             ORDER BY marked_at",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&session_id], |r| {
            Ok(record_json(
                &r.get::<_, String>(0)?,
                Some(&session_id),
                &r.get::<_, String>(1)?,
                &r.get::<_, String>(2)?,
                &r.get::<_, String>(3)?,
                &r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?.as_deref(),
                &r.get::<_, String>(6)?,
                &r.get::<_, String>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "sessionId": session_id, "records": rows }))
}

fn attendance_target_history(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let target_id = get_required_str(params, "targetId")?;
    let start_date = get_optional_str(params, "startDate");
    let end_date = get_optional_str(params, "endDate");
    for raw in [start_date.as_deref(), end_date.as_deref()].into_iter().flatten() {
        if resolve::parse_date(raw).is_none() {
            return Err(HandlerErr::bad_params("dates must be YYYY-MM-DD"));
        }
    }
    classify_target(conn, &target_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, daily_session_id, target_kind, attendance_date, status, remarks,
                    marked_at, marked_by
             FROM attendance_records
             WHERE target_id = ?1
               AND (?2 IS NULL OR attendance_date >= ?2)
               AND (?3 IS NULL OR attendance_date <= ?3)
             ORDER BY attendance_date DESC, marked_at DESC",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map((&target_id, &start_date, &end_date), |r| {
            Ok(record_json(
                &r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?.as_deref(),
                &r.get::<_, String>(2)?,
                &target_id,
                &r.get::<_, String>(3)?,
                &r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?.as_deref(),
                &r.get::<_, String>(6)?,
                &r.get::<_, String>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(json!({ "targetId": target_id, "records": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !matches!(
        req.method.as_str(),
        "attendance.markBulk" | "attendance.sessionRecords" | "attendance.targetHistory"
    ) {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "attendance.markBulk" => attendance_mark_bulk(conn, &req.params),
        "attendance.sessionRecords" => attendance_session_records(conn, &req.params),
        "attendance.targetHistory" => attendance_target_history(conn, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
