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
fn workspace_survives_a_sidecar_restart() {
    let workspace = temp_dir("rollbook-reopen");

    {
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
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "5",
            "students.create",
            json!({ "classId": class_id, "lastName": "Adler", "firstName": "Mina" }),
        );
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
        // EOF on stdin ends the serve loop cleanly.
        drop(stdin);
        let _ = child.wait();
    }

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let years = request_ok(&mut stdin, &mut reader, "8", "years.list", json!({}));
    assert_eq!(
        years.get("years").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(1)
    );

    let classes = request_ok(&mut stdin, &mut reader, "9", "classes.list", json!({}));
    let class_rows = classes
        .get("classes")
        .and_then(|v| v.as_array())
        .expect("classes");
    assert_eq!(class_rows.len(), 1);
    assert_eq!(
        class_rows[0].get("name").and_then(|v| v.as_str()),
        Some("7A")
    );
    assert_eq!(
        class_rows[0].get("studentCount").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        class_rows[0].get("slotCount").and_then(|v| v.as_i64()),
        Some(1)
    );
    let class_id = class_rows[0]
        .get("id")
        .and_then(|v| v.as_str())
        .expect("class id")
        .to_string();

    let timetable = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "timetable.get",
        json!({ "classId": class_id }),
    );
    assert_eq!(timetable.get("term").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(
        timetable
            .get("slots")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(1)
    );

    // Selecting the same workspace again re-runs migrations without damage.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let again = request_ok(&mut stdin, &mut reader, "12", "students.list", json!({ "classId": class_id }));
    let students = again
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0].get("displayName").and_then(|v| v.as_str()),
        Some("Adler, Mina")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
