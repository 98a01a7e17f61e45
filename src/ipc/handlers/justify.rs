use crate::attend::{self, DecideOutcome, JustificationStatus};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_date, get_required_str, get_required_time, resolve_term,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::SessionIdentity;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct SessionKey {
    class_id: String,
    subject_id: String,
    date: NaiveDate,
    start: String,
    end: String,
    term: i64,
}

fn session_key(conn: &Connection, params: &serde_json::Value) -> Result<SessionKey, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let term = resolve_term(conn, params, &class_id)?;
    Ok(SessionKey {
        subject_id: get_required_str(params, "subjectId")?,
        date: get_required_date(params, "date")?,
        start: get_required_time(params, "start")?,
        end: get_required_time(params, "end")?,
        class_id,
        term,
    })
}

fn find_record(conn: &Connection, key: &SessionKey) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT id FROM session_records
         WHERE class_id = ? AND term = ? AND date = ? AND subject_id = ?
           AND start_time = ? AND end_time = ?",
        (
            &key.class_id,
            key.term,
            key.date.to_string(),
            &key.subject_id,
            &key.start,
            &key.end,
        ),
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn current_status(
    conn: &Connection,
    record_id: &str,
    student_id: &str,
) -> Result<Option<JustificationStatus>, HandlerErr> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM justifications WHERE record_id = ? AND student_id = ?",
            (record_id, student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    Ok(raw.as_deref().and_then(JustificationStatus::from_str))
}

fn submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = session_key(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let content = get_required_str(params, "content")?;
    let documents = match params.get("documents") {
        None => json!([]),
        Some(v) if v.is_null() => json!([]),
        Some(v) if v.is_array() => v.clone(),
        Some(_) => return Err(HandlerErr::bad_params("documents must be an array")),
    };

    let record_id = find_record(conn, &key)?
        .ok_or_else(|| HandlerErr::new("not_found", "no absence recorded for this session"))?;
    let entry_exists = conn
        .query_row(
            "SELECT 1 FROM absence_entries WHERE record_id = ? AND student_id = ?",
            (&record_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?
        .is_some();
    if !entry_exists {
        return Err(HandlerErr::new(
            "not_found",
            "no absence recorded for this student",
        ));
    }

    match current_status(conn, &record_id, &student_id)? {
        Some(status) if status.is_terminal() => {
            return Err(HandlerErr {
                code: "closed_justification",
                message: "justification already decided".to_string(),
                details: Some(json!({ "status": status.as_str() })),
            });
        }
        Some(_) => {
            // Still pending: the new submission replaces the old one.
            conn.execute(
                "UPDATE justifications
                 SET content = ?, documents = ?, submitted_at = ?
                 WHERE record_id = ? AND student_id = ?",
                (
                    &content,
                    documents.to_string(),
                    chrono::Utc::now().to_rfc3339(),
                    &record_id,
                    &student_id,
                ),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        None => {
            conn.execute(
                "INSERT INTO justifications(record_id, student_id, content, documents,
                                            status, submitted_at)
                 VALUES(?, ?, ?, ?, 'pending', ?)",
                (
                    &record_id,
                    &student_id,
                    &content,
                    documents.to_string(),
                    chrono::Utc::now().to_rfc3339(),
                ),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "justifications" })),
            })?;
        }
    }

    Ok(json!({ "recordId": record_id, "status": "pending" }))
}

fn decide(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let key = session_key(conn, params)?;
    let student_id = get_required_str(params, "studentId")?;
    let approve = params
        .get("approve")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| HandlerErr::bad_params("missing approve"))?;

    let Some(record_id) = find_record(conn, &key)? else {
        // Nothing to decide; same no-effect shape as a terminal state.
        return Ok(json!({ "applied": false, "status": serde_json::Value::Null }));
    };
    let current = current_status(conn, &record_id, &student_id)?;

    match attend::decide_transition(current, approve) {
        DecideOutcome::NoEffect(status) => Ok(json!({
            "applied": false,
            "status": status.map(|s| s.as_str()),
        })),
        DecideOutcome::Applied(next) => {
            let identity = SessionIdentity {
                class_id: key.class_id.clone(),
                subject_id: key.subject_id.clone(),
                date: key.date,
                start: key.start.clone(),
                end: key.end.clone(),
            };
            let event = attend::build_justification_event(&student_id, &identity, next);

            let tx = conn
                .unchecked_transaction()
                .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
            tx.execute(
                "UPDATE justifications SET status = ?, decided_at = ?
                 WHERE record_id = ? AND student_id = ?",
                (
                    next.as_str(),
                    chrono::Utc::now().to_rfc3339(),
                    &record_id,
                    &student_id,
                ),
            )
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            // OR IGNORE keeps repeated decisions from duplicating delivery.
            tx.execute(
                "INSERT OR IGNORE INTO notifications(dedup_key, student_id, kind, payload, created_at)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    &event.dedup_key,
                    &event.student_id,
                    event.kind,
                    event.payload.to_string(),
                    chrono::Utc::now().to_rfc3339(),
                ),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "notifications" })),
            })?;
            tx.commit()
                .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

            Ok(json!({
                "applied": true,
                "status": next.as_str(),
                "dedupKey": event.dedup_key,
            }))
        }
    }
}

fn notifications_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_filter = get_optional_str(params, "studentId");

    let mut rows: Vec<serde_json::Value> = Vec::new();
    let mut push_row = |dedup_key: String,
                        student_id: String,
                        kind: String,
                        payload_raw: String,
                        created_at: String| {
        let payload = serde_json::from_str::<serde_json::Value>(&payload_raw)
            .unwrap_or(serde_json::Value::Null);
        rows.push(json!({
            "dedupKey": dedup_key,
            "studentId": student_id,
            "kind": kind,
            "payload": payload,
            "createdAt": created_at,
        }));
    };

    match student_filter {
        Some(student_id) => {
            let mut stmt = conn
                .prepare(
                    "SELECT dedup_key, student_id, kind, payload, created_at
                     FROM notifications WHERE student_id = ? ORDER BY rowid",
                )
                .map_err(HandlerErr::db_query)?;
            let fetched = stmt
                .query_map([&student_id], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db_query)?;
            for (k, s, kind, p, c) in fetched {
                push_row(k, s, kind, p, c);
            }
        }
        None => {
            let mut stmt = conn
                .prepare(
                    "SELECT dedup_key, student_id, kind, payload, created_at
                     FROM notifications ORDER BY rowid",
                )
                .map_err(HandlerErr::db_query)?;
            let fetched = stmt
                .query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db_query)?;
            for (k, s, kind, p, c) in fetched {
                push_row(k, s, kind, p, c);
            }
        }
    }

    Ok(json!({ "notifications": rows }))
}

fn handle_justify_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match submit(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_justify_decide(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match decide(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_notifications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match notifications_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "justify.submit" => Some(handle_justify_submit(state, req)),
        "justify.decide" => Some(handle_justify_decide(state, req)),
        "notifications.list" => Some(handle_notifications_list(state, req)),
        _ => None,
    }
}
