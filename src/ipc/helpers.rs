use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;

/// Handler-level failure carried up to the response envelope.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(entity: &'static str, id: &str) -> Self {
        HandlerErr {
            code: "not_found",
            message: format!("{} not found", entity),
            details: Some(json!({ "entity": entity, "id": id })),
        }
    }

    pub fn conflict(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        HandlerErr {
            code: "conflict",
            message: message.into(),
            details,
        }
    }

    pub fn db(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn row_exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::db)
}

/// Referenced-entity checks. Tables carrying an `active` flag require an
/// active row; plain lookup tables require presence only.
pub fn require_school(conn: &Connection, id: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, "SELECT 1 FROM schools WHERE id = ? AND active = 1", id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("school", id))
    }
}

pub fn require_academic_year(conn: &Connection, id: &str) -> Result<(), HandlerErr> {
    if row_exists(
        conn,
        "SELECT 1 FROM academic_years WHERE id = ? AND active = 1",
        id,
    )? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("academicYear", id))
    }
}

pub fn require_class(conn: &Connection, id: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("class", id))
    }
}

pub fn require_section(conn: &Connection, id: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, "SELECT 1 FROM sections WHERE id = ?", id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("section", id))
    }
}

pub fn require_subject(conn: &Connection, id: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("subject", id))
    }
}

pub fn require_teacher(conn: &Connection, id: &str) -> Result<(), HandlerErr> {
    if row_exists(
        conn,
        "SELECT 1 FROM teachers WHERE id = ? AND active = 1",
        id,
    )? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("teacher", id))
    }
}

pub fn require_time_slot(conn: &Connection, id: &str) -> Result<(), HandlerErr> {
    if row_exists(
        conn,
        "SELECT 1 FROM time_slots WHERE id = ? AND active = 1",
        id,
    )? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("timeSlot", id))
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
