use rusqlite::Connection;
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

fn error_code(value: &serde_json::Value) -> &str {
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn approving_twice_applies_once_and_notifies_once() {
    let workspace = temp_dir("rollbook-justify-cycle");
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
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "classId": class_id, "lastName": "Adler", "firstName": "Mina" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.set",
        json!({
            "classId": class_id,
            "term": 1,
            "slots": [
                { "weekday": 1, "subjectId": subject_id, "start": "08:00", "end": "10:00" }
            ]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
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

    let session = json!({
        "classId": class_id,
        "subjectId": subject_id,
        "date": "2025-01-06",
        "start": "08:00",
        "end": "10:00",
        "studentId": student_id,
    });

    let mut submit_params = session.clone();
    submit_params["content"] = json!("medical certificate");
    let submitted = request_ok(&mut stdin, &mut reader, "8", "justify.submit", submit_params);
    assert_eq!(
        submitted.get("status").and_then(|v| v.as_str()),
        Some("pending")
    );
    assert!(submitted.get("recordId").and_then(|v| v.as_str()).is_some());

    let mut approve_params = session.clone();
    approve_params["approve"] = json!(true);
    let decided = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "justify.decide",
        approve_params.clone(),
    );
    assert_eq!(decided.get("applied").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        decided.get("status").and_then(|v| v.as_str()),
        Some("approved")
    );
    let dedup_key = decided
        .get("dedupKey")
        .and_then(|v| v.as_str())
        .expect("dedupKey")
        .to_string();
    assert_eq!(dedup_key.len(), 64, "sha-256 hex digest expected");

    let conn = Connection::open(workspace.join("rollbook.sqlite3")).expect("open db");
    let decided_at: String = conn
        .query_row(
            "SELECT decided_at FROM justifications WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .expect("decided_at set");

    // A second approval is a no-op in every observable way.
    let repeated = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "justify.decide",
        approve_params,
    );
    assert_eq!(repeated.get("applied").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        repeated.get("status").and_then(|v| v.as_str()),
        Some("approved")
    );
    let decided_at_after: String = conn
        .query_row(
            "SELECT decided_at FROM justifications WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .expect("decided_at still set");
    assert_eq!(decided_at, decided_at_after);

    let delivered: i64 = conn
        .query_row("SELECT COUNT(*) FROM notifications", [], |r| r.get(0))
        .expect("count notifications");
    assert_eq!(delivered, 1);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "notifications.list",
        json!({ "studentId": student_id }),
    );
    let rows = listed
        .get("notifications")
        .and_then(|v| v.as_array())
        .expect("notifications");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("dedupKey").and_then(|v| v.as_str()),
        Some(dedup_key.as_str())
    );
    assert_eq!(
        rows[0].get("kind").and_then(|v| v.as_str()),
        Some("justification")
    );
    assert_eq!(
        rows[0].pointer("/payload/decision").and_then(|v| v.as_str()),
        Some("approved")
    );
    assert_eq!(
        rows[0].pointer("/payload/session/date").and_then(|v| v.as_str()),
        Some("2025-01-06")
    );

    // Flipping an approved justification to rejected is refused too.
    let mut reject_params = session.clone();
    reject_params["approve"] = json!(false);
    let flipped = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "justify.decide",
        reject_params,
    );
    assert_eq!(flipped.get("applied").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        flipped.get("status").and_then(|v| v.as_str()),
        Some("approved")
    );

    // And so is submitting fresh evidence against a closed case.
    let mut resubmit_params = session.clone();
    resubmit_params["content"] = json!("second note");
    let resubmitted = request(
        &mut stdin,
        &mut reader,
        "13",
        "justify.submit",
        resubmit_params,
    );
    assert_eq!(error_code(&resubmitted), "closed_justification");
    assert_eq!(
        resubmitted
            .pointer("/error/details/status")
            .and_then(|v| v.as_str()),
        Some("approved")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
