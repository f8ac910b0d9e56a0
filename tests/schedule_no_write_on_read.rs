use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_routined");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn routined");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst).to_string();
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn count_sessions(workspace: &Path) -> i64 {
    let conn = rusqlite::Connection::open(workspace.join("routine.sqlite3"))
        .expect("open workspace db");
    conn.query_row("SELECT COUNT(*) FROM daily_sessions", [], |r| r.get(0))
        .expect("count daily_sessions")
}

#[test]
fn resolving_a_day_never_creates_session_rows() {
    let workspace = temp_dir("routined-no-write");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let school = request_ok(&mut stdin, &mut reader, "schools.create", json!({ "name": "Hillside" }));
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();
    let year = request_ok(
        &mut stdin,
        &mut reader,
        "academicYears.create",
        json!({ "schoolId": school_id, "name": "2024" }),
    );
    let year_id = year["academicYearId"].as_str().expect("yearId").to_string();
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "classes.create",
        json!({ "schoolId": school_id, "name": "Class 10" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let section = request_ok(
        &mut stdin,
        &mut reader,
        "sections.create",
        json!({ "classId": class_id, "name": "A" }),
    );
    let section_id = section["sectionId"].as_str().expect("sectionId").to_string();
    let slot = request_ok(
        &mut stdin,
        &mut reader,
        "timeslots.create",
        json!({
            "schoolId": school_id,
            "name": "Period 1",
            "startTime": "09:00",
            "endTime": "09:45",
            "sortOrder": 1,
            "slotType": "TEACHING"
        }),
    );
    let slot_id = slot["timeSlot"]["id"].as_str().expect("slotId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "subjects.create",
        json!({ "schoolId": school_id, "name": "Mathematics" }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "teachers.create",
        json!({ "schoolId": school_id, "name": "Teacher X" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "routine.upsert",
        json!({
            "schoolId": school_id,
            "academicYearId": year_id,
            "classId": class_id,
            "sectionId": section_id,
            "dayOfWeek": "MONDAY",
            "timeSlotId": slot_id,
            "subjectId": subject["subjectId"],
            "teacherId": teacher["teacherId"]
        }),
    );

    assert_eq!(count_sessions(&workspace), 0);

    // Resolving many dates, templated and empty alike, leaves the table
    // untouched. Materialization is upsertSession's job alone.
    for date in ["2024-03-04", "2024-03-05", "2024-03-11", "2024-07-01"] {
        let resolved = request_ok(
            &mut stdin,
            &mut reader,
            "schedule.resolveDay",
            json!({
                "schoolId": school_id,
                "academicYearId": year_id,
                "classId": class_id,
                "sectionId": section_id,
                "date": date
            }),
        );
        assert!(resolved["slots"].is_array());
    }
    request_ok(
        &mut stdin,
        &mut reader,
        "schedule.resolveTeacherDay",
        json!({ "teacherId": teacher["teacherId"], "date": "2024-03-04" }),
    );

    assert_eq!(count_sessions(&workspace), 0);

    // A Tuesday has no template rows at all.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "schedule.resolveDay",
        json!({
            "schoolId": school_id,
            "academicYearId": year_id,
            "classId": class_id,
            "sectionId": section_id,
            "date": "2024-03-05"
        }),
    );
    assert_eq!(empty["dayOfWeek"], "TUESDAY");
    assert_eq!(empty["slots"].as_array().expect("slots").len(), 0);
    assert_eq!(count_sessions(&workspace), 0);

    let _ = std::fs::remove_dir_all(workspace);
}
