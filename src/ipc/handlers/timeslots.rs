use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_i64, get_required_str, require_school, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::resolve;
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct SlotTimes {
    start: NaiveTime,
    end: NaiveTime,
}

fn parse_slot_times(start_raw: &str, end_raw: &str) -> Result<SlotTimes, HandlerErr> {
    let start = resolve::parse_time(start_raw)
        .ok_or_else(|| HandlerErr::bad_params("startTime must be HH:MM"))?;
    let end = resolve::parse_time(end_raw)
        .ok_or_else(|| HandlerErr::bad_params("endTime must be HH:MM"))?;
    if start >= end {
        return Err(HandlerErr::bad_params("startTime must be before endTime"));
    }
    Ok(SlotTimes { start, end })
}

fn parse_slot_type(raw: &str) -> Result<String, HandlerErr> {
    let upper = raw.trim().to_ascii_uppercase();
    if resolve::SLOT_TYPES.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(HandlerErr::bad_params(format!(
            "slotType must be one of {}",
            resolve::SLOT_TYPES.join(", ")
        )))
    }
}

/// Scan all other active slots of the school for an interval collision.
fn check_overlap(
    conn: &Connection,
    school_id: &str,
    times: &SlotTimes,
    exclude_slot_id: Option<&str>,
) -> Result<(), HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, start_time, end_time
             FROM time_slots
             WHERE school_id = ? AND active = 1",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([school_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    for (id, name, start_raw, end_raw) in rows {
        if exclude_slot_id == Some(id.as_str()) {
            continue;
        }
        let (Some(other_start), Some(other_end)) = (
            resolve::parse_time(&start_raw),
            resolve::parse_time(&end_raw),
        ) else {
            continue;
        };
        if resolve::intervals_overlap(times.start, times.end, other_start, other_end) {
            return Err(HandlerErr::conflict(
                format!("time slot overlaps \"{}\"", name),
                Some(json!({
                    "entity": "timeSlot",
                    "conflictingId": id,
                    "conflictingName": name,
                    "conflictingStart": start_raw,
                    "conflictingEnd": end_raw
                })),
            ));
        }
    }
    Ok(())
}

fn slot_json(
    id: &str,
    name: &str,
    start: &str,
    end: &str,
    sort_order: i64,
    slot_type: &str,
    active: bool,
) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "startTime": start,
        "endTime": end,
        "sortOrder": sort_order,
        "slotType": slot_type,
        "active": active
    })
}

fn timeslot_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let name = get_required_str(params, "name")?;
    let start_raw = get_required_str(params, "startTime")?;
    let end_raw = get_required_str(params, "endTime")?;
    let sort_order = get_required_i64(params, "sortOrder")?;
    let slot_type = parse_slot_type(&get_required_str(params, "slotType")?)?;

    require_school(conn, &school_id)?;
    let times = parse_slot_times(&start_raw, &end_raw)?;
    check_overlap(conn, &school_id, &times, None)?;

    let id = Uuid::new_v4().to_string();
    let start = times.start.format("%H:%M").to_string();
    let end = times.end.format("%H:%M").to_string();
    conn.execute(
        "INSERT INTO time_slots(id, school_id, name, start_time, end_time, sort_order, slot_type)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&id, &school_id, &name, &start, &end, sort_order, &slot_type),
    )
    .map_err(HandlerErr::db)?;

    Ok(json!({
        "timeSlot": slot_json(&id, &name, &start, &end, sort_order, &slot_type, true)
    }))
}

fn timeslot_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let slot_id = get_required_str(params, "slotId")?;

    let existing = conn
        .query_row(
            "SELECT school_id, name, start_time, end_time, sort_order, slot_type
             FROM time_slots
             WHERE id = ? AND active = 1",
            [&slot_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((school_id, cur_name, cur_start, cur_end, cur_sort, cur_type)) = existing else {
        return Err(HandlerErr::not_found("timeSlot", &slot_id));
    };

    let name = get_optional_str(params, "name").unwrap_or(cur_name);
    let start_raw = get_optional_str(params, "startTime").unwrap_or(cur_start);
    let end_raw = get_optional_str(params, "endTime").unwrap_or(cur_end);
    let sort_order = params
        .get("sortOrder")
        .and_then(|v| v.as_i64())
        .unwrap_or(cur_sort);
    let slot_type = match get_optional_str(params, "slotType") {
        Some(raw) => parse_slot_type(&raw)?,
        None => cur_type,
    };

    let times = parse_slot_times(&start_raw, &end_raw)?;
    check_overlap(conn, &school_id, &times, Some(&slot_id))?;

    let start = times.start.format("%H:%M").to_string();
    let end = times.end.format("%H:%M").to_string();
    conn.execute(
        "UPDATE time_slots
         SET name = ?, start_time = ?, end_time = ?, sort_order = ?, slot_type = ?
         WHERE id = ?",
        (&name, &start, &end, sort_order, &slot_type, &slot_id),
    )
    .map_err(HandlerErr::db)?;

    Ok(json!({
        "timeSlot": slot_json(&slot_id, &name, &start, &end, sort_order, &slot_type, true)
    }))
}

fn timeslot_deactivate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let slot_id = get_required_str(params, "slotId")?;
    let updated = conn
        .execute(
            "UPDATE time_slots SET active = 0 WHERE id = ? AND active = 1",
            [&slot_id],
        )
        .map_err(HandlerErr::db)?;
    if updated == 0 {
        return Err(HandlerErr::not_found("timeSlot", &slot_id));
    }
    Ok(json!({ "ok": true }))
}

fn timeslot_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school_id = get_required_str(params, "schoolId")?;
    let slot_type = match get_optional_str(params, "slotType") {
        Some(raw) => Some(parse_slot_type(&raw)?),
        None => None,
    };
    require_school(conn, &school_id)?;

    let sql = "SELECT id, name, start_time, end_time, sort_order, slot_type
               FROM time_slots
               WHERE school_id = ? AND active = 1
               ORDER BY sort_order";
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([&school_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let slots: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|(_, _, _, _, _, ty)| slot_type.as_deref().map(|f| f == ty).unwrap_or(true))
        .map(|(id, name, start, end, sort, ty)| slot_json(&id, &name, &start, &end, sort, &ty, true))
        .collect();
    Ok(json!({ "timeSlots": slots }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if !matches!(
        req.method.as_str(),
        "timeslots.create" | "timeslots.update" | "timeslots.deactivate" | "timeslots.list"
    ) {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let result = match req.method.as_str() {
        "timeslots.create" => timeslot_create(conn, &req.params),
        "timeslots.update" => timeslot_update(conn, &req.params),
        "timeslots.deactivate" => timeslot_deactivate(conn, &req.params),
        "timeslots.list" => timeslot_list(conn, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
