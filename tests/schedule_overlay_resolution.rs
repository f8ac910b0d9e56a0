use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
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

struct Seed {
    school_id: String,
    year_id: String,
    class_id: String,
    section_id: String,
    slot1_id: String,
    slot2_id: String,
    math_id: String,
    english_id: String,
    teacher_x: String,
    teacher_y: String,
    teacher_z: String,
    template1_id: String,
    template2_id: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seed {
    let school = request_ok(stdin, reader, "schools.create", json!({ "name": "Hillside" }));
    let school_id = school["schoolId"].as_str().expect("schoolId").to_string();
    let year = request_ok(
        stdin,
        reader,
        "academicYears.create",
        json!({ "schoolId": school_id, "name": "2024" }),
    );
    let year_id = year["academicYearId"].as_str().expect("yearId").to_string();
    let class = request_ok(
        stdin,
        reader,
        "classes.create",
        json!({ "schoolId": school_id, "name": "Class 10" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let section = request_ok(
        stdin,
        reader,
        "sections.create",
        json!({ "classId": class_id, "name": "A" }),
    );
    let section_id = section["sectionId"].as_str().expect("sectionId").to_string();

    let slot1 = request_ok(
        stdin,
        reader,
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
    let slot2 = request_ok(
        stdin,
        reader,
        "timeslots.create",
        json!({
            "schoolId": school_id,
            "name": "Period 2",
            "startTime": "09:45",
            "endTime": "10:30",
            "sortOrder": 2,
            "slotType": "TEACHING"
        }),
    );
    let slot1_id = slot1["timeSlot"]["id"].as_str().expect("slotId").to_string();
    let slot2_id = slot2["timeSlot"]["id"].as_str().expect("slotId").to_string();

    let math = request_ok(
        stdin,
        reader,
        "subjects.create",
        json!({ "schoolId": school_id, "name": "Mathematics" }),
    );
    let english = request_ok(
        stdin,
        reader,
        "subjects.create",
        json!({ "schoolId": school_id, "name": "English" }),
    );
    let math_id = math["subjectId"].as_str().expect("subjectId").to_string();
    let english_id = english["subjectId"].as_str().expect("subjectId").to_string();

    let tx = request_ok(
        stdin,
        reader,
        "teachers.create",
        json!({ "schoolId": school_id, "name": "Teacher X" }),
    );
    let ty = request_ok(
        stdin,
        reader,
        "teachers.create",
        json!({ "schoolId": school_id, "name": "Teacher Y" }),
    );
    let tz = request_ok(
        stdin,
        reader,
        "teachers.create",
        json!({ "schoolId": school_id, "name": "Teacher Z" }),
    );
    let teacher_x = tx["teacherId"].as_str().expect("teacherId").to_string();
    let teacher_y = ty["teacherId"].as_str().expect("teacherId").to_string();
    let teacher_z = tz["teacherId"].as_str().expect("teacherId").to_string();

    let t1 = request_ok(
        stdin,
        reader,
        "routine.upsert",
        json!({
            "schoolId": school_id,
            "academicYearId": year_id,
            "classId": class_id,
            "sectionId": section_id,
            "dayOfWeek": "MONDAY",
            "timeSlotId": slot1_id,
            "subjectId": math_id,
            "teacherId": teacher_x
        }),
    );
    let t2 = request_ok(
        stdin,
        reader,
        "routine.upsert",
        json!({
            "schoolId": school_id,
            "academicYearId": year_id,
            "classId": class_id,
            "sectionId": section_id,
            "dayOfWeek": "MONDAY",
            "timeSlotId": slot2_id,
            "subjectId": english_id,
            "teacherId": teacher_y
        }),
    );

    Seed {
        school_id,
        year_id,
        class_id,
        section_id,
        slot1_id,
        slot2_id,
        math_id,
        english_id,
        teacher_x,
        teacher_y,
        teacher_z,
        template1_id: t1["entry"]["id"].as_str().expect("entry id").to_string(),
        template2_id: t2["entry"]["id"].as_str().expect("entry id").to_string(),
    }
}

fn resolve_day(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    seed: &Seed,
    date: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        "schedule.resolveDay",
        json!({
            "schoolId": seed.school_id,
            "academicYearId": seed.year_id,
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": date
        }),
    )
}

#[test]
fn substitute_teacher_applies_to_one_date_only() {
    let workspace = temp_dir("routined-overlay");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed(&mut stdin, &mut reader);

    // 2024-03-04 is a Monday. Before any session exists the resolved day is
    // the template verbatim, in slot order.
    let before = resolve_day(&mut stdin, &mut reader, &seed, "2024-03-04");
    assert_eq!(before["dayOfWeek"], "MONDAY");
    let slots = before["slots"].as_array().expect("slots");
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0]["timeSlotId"].as_str(), Some(seed.slot1_id.as_str()));
    assert_eq!(slots[0]["teacherId"].as_str(), Some(seed.teacher_x.as_str()));
    assert_eq!(slots[0]["subjectId"].as_str(), Some(seed.math_id.as_str()));
    assert_eq!(slots[0]["hasSession"], false);
    assert_eq!(slots[1]["timeSlotId"].as_str(), Some(seed.slot2_id.as_str()));
    assert_eq!(slots[1]["teacherId"].as_str(), Some(seed.teacher_y.as_str()));

    // Teacher X is sick on the 4th: Teacher Z substitutes for period 1.
    let session = request_ok(
        &mut stdin,
        &mut reader,
        "schedule.upsertSession",
        json!({
            "schoolId": seed.school_id,
            "academicYearId": seed.year_id,
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-03-04",
            "timeSlotId": seed.slot1_id,
            "routineTemplateId": seed.template1_id,
            "teacherOverrideId": seed.teacher_z,
            "actualTeacherId": seed.teacher_z,
            "status": "CONDUCTED"
        }),
    );
    let session_id = session["session"]["id"].as_str().expect("session id").to_string();
    assert_eq!(
        session["session"]["routineTemplateId"].as_str(),
        Some(seed.template1_id.as_str())
    );
    assert_eq!(
        session["session"]["actualTeacherId"].as_str(),
        Some(seed.teacher_z.as_str())
    );

    let after = resolve_day(&mut stdin, &mut reader, &seed, "2024-03-04");
    let slots = after["slots"].as_array().expect("slots");
    assert_eq!(slots.len(), 2);
    // Slot 1 reflects the override: substituted teacher, subject unchanged.
    assert_eq!(slots[0]["teacherId"].as_str(), Some(seed.teacher_z.as_str()));
    assert_eq!(slots[0]["subjectId"].as_str(), Some(seed.math_id.as_str()));
    assert_eq!(slots[0]["hasSession"], true);
    assert_eq!(slots[0]["sessionId"].as_str(), Some(session_id.as_str()));
    assert_eq!(slots[0]["status"], "CONDUCTED");
    // Slot 2 passes through untouched.
    assert_eq!(slots[1]["teacherId"].as_str(), Some(seed.teacher_y.as_str()));
    assert_eq!(slots[1]["hasSession"], false);

    // The following Monday is back on template.
    let next_week = resolve_day(&mut stdin, &mut reader, &seed, "2024-03-11");
    let slots = next_week["slots"].as_array().expect("slots");
    assert_eq!(slots[0]["teacherId"].as_str(), Some(seed.teacher_x.as_str()));
    assert_eq!(slots[0]["hasSession"], false);

    // Upserting the same (section, date, slot) again touches the same row.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "schedule.upsertSession",
        json!({
            "schoolId": seed.school_id,
            "academicYearId": seed.year_id,
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-03-04",
            "timeSlotId": seed.slot1_id,
            "routineTemplateId": seed.template1_id,
            "status": "CANCELLED"
        }),
    );
    assert_eq!(again["session"]["id"].as_str(), Some(session_id.as_str()));
    assert_eq!(again["session"]["status"], "CANCELLED");
    // Earlier overrides survive a partial update.
    assert_eq!(
        again["session"]["teacherOverrideId"].as_str(),
        Some(seed.teacher_z.as_str())
    );

    // Reopening the workspace re-runs schema setup against the populated
    // database; the stored actual-teacher assignment survives it.
    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let reopened = resolve_day(&mut stdin, &mut reader, &seed, "2024-03-04");
    let slots = reopened["slots"].as_array().expect("slots");
    assert_eq!(slots[0]["actualTeacherId"].as_str(), Some(seed.teacher_z.as_str()));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn extra_sessions_come_back_in_slot_display_order() {
    let workspace = temp_dir("routined-extra-sessions");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed(&mut stdin, &mut reader);

    // Ad-hoc sessions on a Tuesday with no template; created second-period
    // first to make the ordering observable.
    for slot_id in [&seed.slot2_id, &seed.slot1_id] {
        request_ok(
            &mut stdin,
            &mut reader,
            "schedule.upsertSession",
            json!({
                "schoolId": seed.school_id,
                "academicYearId": seed.year_id,
                "classId": seed.class_id,
                "sectionId": seed.section_id,
                "date": "2024-03-05",
                "timeSlotId": slot_id,
                "subjectOverrideId": seed.english_id,
                "teacherOverrideId": seed.teacher_z
            }),
        );
    }

    let extra = request_ok(
        &mut stdin,
        &mut reader,
        "schedule.extraSessions",
        json!({ "schoolId": seed.school_id, "date": "2024-03-05" }),
    );
    let sessions = extra["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["timeSlotId"].as_str(), Some(seed.slot1_id.as_str()));
    assert_eq!(sessions[1]["timeSlotId"].as_str(), Some(seed.slot2_id.as_str()));
    assert!(sessions[0]["routineTemplateId"].is_null());

    // Ad-hoc rows stay out of the per-section overlay.
    let resolved = resolve_day(&mut stdin, &mut reader, &seed, "2024-03-05");
    assert_eq!(resolved["slots"].as_array().expect("slots").len(), 0);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn teacher_day_view_follows_substitutions() {
    let workspace = temp_dir("routined-teacher-day");
    let (_child, mut stdin, mut reader) = spawn_daemon();

    request_ok(
        &mut stdin,
        &mut reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "schedule.upsertSession",
        json!({
            "schoolId": seed.school_id,
            "academicYearId": seed.year_id,
            "classId": seed.class_id,
            "sectionId": seed.section_id,
            "date": "2024-03-04",
            "timeSlotId": seed.slot1_id,
            "routineTemplateId": seed.template1_id,
            "teacherOverrideId": seed.teacher_z
        }),
    );

    // The substitute sees the slot on the affected date.
    let z_day = request_ok(
        &mut stdin,
        &mut reader,
        "schedule.resolveTeacherDay",
        json!({ "teacherId": seed.teacher_z, "date": "2024-03-04" }),
    );
    let z_slots = z_day["slots"].as_array().expect("slots");
    assert_eq!(z_slots.len(), 1);
    assert_eq!(z_slots[0]["routineTemplateId"].as_str(), Some(seed.template1_id.as_str()));
    assert_eq!(z_slots[0]["substitution"], true);
    assert_eq!(z_slots[0]["subjectId"].as_str(), Some(seed.math_id.as_str()));

    // The templated teacher loses it for that date but keeps next week.
    let x_day = request_ok(
        &mut stdin,
        &mut reader,
        "schedule.resolveTeacherDay",
        json!({ "teacherId": seed.teacher_x, "date": "2024-03-04" }),
    );
    assert_eq!(x_day["slots"].as_array().expect("slots").len(), 0);

    let x_next = request_ok(
        &mut stdin,
        &mut reader,
        "schedule.resolveTeacherDay",
        json!({ "teacherId": seed.teacher_x, "date": "2024-03-11" }),
    );
    let x_slots = x_next["slots"].as_array().expect("slots");
    assert_eq!(x_slots.len(), 1);
    assert_eq!(x_slots[0]["substitution"], false);

    // Routine listing for teacher Y is template-level and date-independent.
    let y_routine = request_ok(
        &mut stdin,
        &mut reader,
        "routine.byTeacher",
        json!({ "teacherId": seed.teacher_y, "dayOfWeek": "monday" }),
    );
    let entries = y_routine["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["subjectId"].as_str(), Some(seed.english_id.as_str()));

    let _ = std::fs::remove_dir_all(workspace);
}
