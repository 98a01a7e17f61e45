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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("rollbook-router-smoke");
    let bundle_out = workspace.join("smoke-backup.rbbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let year = request(
        &mut stdin,
        &mut reader,
        "3",
        "years.create",
        json!({
            "label": "2024/25",
            "startDate": "2024-09-01",
            "endDate": "2025-06-30"
        }),
    );
    let year_id = year
        .pointer("/result/yearId")
        .and_then(|v| v.as_str())
        .expect("yearId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "4", "years.list", json!({}));

    let subject = request(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "name": "Mathematics" }),
    );
    let subject_id = subject
        .pointer("/result/subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "6", "subjects.list", json!({}));

    let class = request(
        &mut stdin,
        &mut reader,
        "7",
        "classes.create",
        json!({ "yearId": year_id, "name": "Smoke 7A" }),
    );
    let class_id = class
        .pointer("/result/classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "8", "classes.list", json!({}));

    let student = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({
            "classId": class_id,
            "lastName": "Smoke",
            "firstName": "Student"
        }),
    );
    let student_id = student
        .pointer("/result/studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "students.list",
        json!({ "classId": class_id }),
    );

    // Weekly pattern: one Monday morning session.
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "timetable.set",
        json!({
            "classId": class_id,
            "term": 1,
            "slots": [
                { "weekday": 1, "subjectId": subject_id, "start": "08:00", "end": "10:00" }
            ]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "timetable.get",
        json!({ "classId": class_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "calendar.closureAdd",
        json!({
            "yearId": year_id,
            "scope": "global",
            "startDate": "2025-01-07",
            "endDate": "2025-01-07",
            "label": "smoke closure"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "calendar.closureList",
        json!({ "yearId": year_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "calendar.overrideAdd",
        json!({
            "yearId": year_id,
            "kind": "cancel",
            "classId": class_id,
            "subjectId": subject_id,
            "date": "2025-01-08",
            "start": "08:00",
            "end": "10:00",
            "reason": "smoke cancel"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "calendar.overrideList",
        json!({ "yearId": year_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "calendar.holidaySet",
        json!({ "month": 6, "day": 15, "label": "Founders Day" }),
    );
    let _ = request(&mut stdin, &mut reader, "18", "calendar.holidayList", json!({}));

    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "sessions.evaluate",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "date": "2025-01-06",
            "start": "08:00",
            "end": "10:00"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "sessions.listActive",
        json!({ "classId": class_id, "date": "2025-01-06" }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "absences.record",
        json!({
            "classId": class_id,
            "studentId": student_id,
            "subjectId": subject_id,
            "date": "2025-01-06",
            "start": "08:00",
            "end": "10:00"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "absences.sessionOpen",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "date": "2025-01-06",
            "start": "08:00",
            "end": "10:00"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "attendance.aggregate",
        json!({
            "classId": class_id,
            "from": "2025-01-06",
            "to": "2025-01-12"
        }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "justify.submit",
        json!({
            "classId": class_id,
            "studentId": student_id,
            "subjectId": subject_id,
            "date": "2025-01-06",
            "start": "08:00",
            "end": "10:00",
            "content": "family reasons"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "justify.decide",
        json!({
            "classId": class_id,
            "studentId": student_id,
            "subjectId": subject_id,
            "date": "2025-01-06",
            "start": "08:00",
            "end": "10:00",
            "approve": true
        }),
    );
    let _ = request(&mut stdin, &mut reader, "26", "notifications.list", json!({}));

    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "backup.export",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "backup.import",
        json!({ "inPath": bundle_out.to_string_lossy() }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
