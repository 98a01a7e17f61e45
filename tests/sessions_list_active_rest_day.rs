use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rollbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
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
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn rest_day_yields_no_sessions_and_active_days_merge_sorted() {
    let workspace = temp_dir("rollbook-rest-day");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let year = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "years.create",
        json!({
            "label": "2024/25",
            "startDate": "2024-09-01",
            "endDate": "2025-06-30"
        }),
    );
    let year_id = year
        .get("yearId")
        .and_then(|v| v.as_str())
        .expect("yearId")
        .to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "name": "Mathematics" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let class = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "classes.create",
        json!({ "yearId": year_id, "name": "7A" }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    // A weekday-7 slot may be stored, but the resolver never surfaces it.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.set",
        json!({
            "classId": class_id,
            "term": 1,
            "slots": [
                { "weekday": 1, "subjectId": subject_id, "start": "08:00", "end": "10:00" },
                { "weekday": 7, "subjectId": subject_id, "start": "09:00", "end": "10:00" }
            ]
        }),
    );

    // 2025-01-12 is a Sunday.
    let sunday = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "sessions.listActive",
        json!({ "classId": class_id, "date": "2025-01-12" }),
    );
    assert_eq!(
        sunday
            .get("sessions")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );

    // Monday carries the timetable slot.
    let monday = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sessions.listActive",
        json!({ "classId": class_id, "date": "2025-01-06" }),
    );
    let sessions = monday
        .get("sessions")
        .and_then(|v| v.as_array())
        .expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions[0].get("source").and_then(|v| v.as_str()),
        Some("timetable")
    );

    // An early makeup the same day sorts ahead of the timetable slot.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "calendar.overrideAdd",
        json!({
            "yearId": year_id,
            "kind": "makeup",
            "classId": class_id,
            "subjectId": subject_id,
            "date": "2025-01-06",
            "start": "07:00",
            "end": "07:45"
        }),
    );
    let merged = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sessions.listActive",
        json!({ "classId": class_id, "date": "2025-01-06" }),
    );
    let merged_sessions = merged
        .get("sessions")
        .and_then(|v| v.as_array())
        .expect("sessions");
    assert_eq!(merged_sessions.len(), 2);
    assert_eq!(
        merged_sessions[0].get("start").and_then(|v| v.as_str()),
        Some("07:00")
    );
    assert_eq!(
        merged_sessions[0].get("source").and_then(|v| v.as_str()),
        Some("makeup")
    );
    assert_eq!(
        merged_sessions[1].get("start").and_then(|v| v.as_str()),
        Some("08:00")
    );

    // Cancelling the timetable slot leaves only the makeup.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "calendar.overrideAdd",
        json!({
            "yearId": year_id,
            "kind": "cancel",
            "classId": class_id,
            "subjectId": subject_id,
            "date": "2025-01-06",
            "start": "08:00",
            "end": "10:00"
        }),
    );
    let after_cancel = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "sessions.listActive",
        json!({ "classId": class_id, "date": "2025-01-06" }),
    );
    let remaining = after_cancel
        .get("sessions")
        .and_then(|v| v.as_array())
        .expect("sessions");
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        remaining[0].get("source").and_then(|v| v.as_str()),
        Some("makeup")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
