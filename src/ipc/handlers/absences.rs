use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    cached_slots, calendar_facts_for_year, get_optional_time, get_required_date, get_required_str,
    get_required_time, load_makeups, require_class_year, resolve_term, HandlerErr,
};
use crate::ipc::types::{AppState, FactCaches, Request};
use crate::schedule::{self, CandidateSession, SessionIdentity};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// The identity the caller names must correspond to a session the resolver
/// actually produces for that date; absences cannot be attached to slots
/// that never happen.
fn find_candidate(
    conn: &Connection,
    facts: &mut FactCaches,
    class_id: &str,
    term: i64,
    date: NaiveDate,
    subject_id: &str,
    start: &str,
    end: &str,
) -> Result<Option<CandidateSession>, HandlerErr> {
    let slots = cached_slots(conn, facts, class_id, term)?;
    let makeups = load_makeups(conn, class_id, date, date)?;
    Ok(schedule::sessions_for_date(&slots, &makeups, date)
        .into_iter()
        .find(|c| c.subject_id == subject_id && c.start == start && c.end == end))
}

fn record_absence(
    conn: &Connection,
    facts: &mut FactCaches,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = get_required_date(params, "date")?;
    let start = get_required_time(params, "start")?;
    let end = get_required_time(params, "end")?;
    let absent_from = get_optional_time(params, "absentFrom")?;
    let absent_to = get_optional_time(params, "absentTo")?;

    let year_id = require_class_year(conn, &class_id)?;
    let term = resolve_term(conn, params, &class_id)?;

    let on_roster = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?
        .is_some();
    if !on_roster {
        return Err(HandlerErr::new("not_found", "student not found in class"));
    }

    let candidate = find_candidate(
        conn, facts, &class_id, term, date, &subject_id, &start, &end,
    )?
    .ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "no session at that time".to_string(),
        details: Some(json!({
            "date": date.to_string(),
            "subjectId": subject_id,
            "start": start,
            "end": end,
        })),
    })?;

    let identity = SessionIdentity {
        class_id: class_id.clone(),
        subject_id: subject_id.clone(),
        date,
        start: start.clone(),
        end: end.clone(),
    };
    let calendar = calendar_facts_for_year(conn, facts, &year_id)?;
    let verdict = schedule::evaluate(&identity, &calendar);
    if verdict.neutralized {
        return Err(HandlerErr {
            code: "session_neutralized",
            message: "session is neutralized; no attendance is expected".to_string(),
            details: Some(json!({ "reason": verdict.reason })),
        });
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let existing_record: Option<String> = tx
        .query_row(
            "SELECT id FROM session_records
             WHERE class_id = ? AND term = ? AND date = ? AND subject_id = ?
               AND start_time = ? AND end_time = ?",
            (&class_id, term, date.to_string(), &subject_id, &start, &end),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;

    let record_id = match existing_record {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO session_records(id, class_id, year_id, term, date, subject_id,
                                             start_time, end_time)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    &class_id,
                    &year_id,
                    term,
                    date.to_string(),
                    &subject_id,
                    &start,
                    &end,
                ),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "session_records" })),
            })?;
            id
        }
    };

    let already = tx
        .query_row(
            "SELECT 1 FROM absence_entries WHERE record_id = ? AND student_id = ?",
            (&record_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?
        .is_some();
    if already {
        return Err(HandlerErr {
            code: "already_recorded",
            message: "absence already recorded for this student and session".to_string(),
            details: Some(json!({ "recordId": record_id })),
        });
    }

    let entry_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO absence_entries(id, record_id, student_id, start_time, end_time,
                                     room, teacher, subject_label, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &entry_id,
            &record_id,
            &student_id,
            &absent_from,
            &absent_to,
            &candidate.room,
            &candidate.teacher,
            &candidate.subject_label,
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "absence_entries" })),
    })?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "recordId": record_id, "entryId": entry_id }))
}

fn session_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = get_required_date(params, "date")?;
    let start = get_required_time(params, "start")?;
    let end = get_required_time(params, "end")?;
    let term = resolve_term(conn, params, &class_id)?;

    let record_id: Option<String> = conn
        .query_row(
            "SELECT id FROM session_records
             WHERE class_id = ? AND term = ? AND date = ? AND subject_id = ?
               AND start_time = ? AND end_time = ?",
            (&class_id, term, date.to_string(), &subject_id, &start, &end),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;

    let Some(record_id) = record_id else {
        // No record yet means nobody has been marked absent.
        return Ok(json!({ "record": serde_json::Value::Null, "absentees": [] }));
    };

    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.student_id, s.last_name, s.first_name,
                    a.start_time, a.end_time, a.room, a.teacher, a.subject_label, a.recorded_at,
                    j.status, j.content, j.documents, j.submitted_at, j.decided_at
             FROM absence_entries a
             LEFT JOIN students s ON s.id = a.student_id
             LEFT JOIN justifications j
               ON j.record_id = a.record_id AND j.student_id = a.student_id
             WHERE a.record_id = ?
             ORDER BY a.rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let absentees = stmt
        .query_map([&record_id], |r| {
            let last: Option<String> = r.get(2)?;
            let first: Option<String> = r.get(3)?;
            let student_id: String = r.get(1)?;
            let display_name = match (last, first) {
                (Some(l), Some(f)) => format!("{}, {}", l, f),
                _ => student_id.clone(),
            };
            let status: Option<String> = r.get(10)?;
            let justification = match status {
                Some(status) => {
                    let documents_raw: String = r.get(12)?;
                    json!({
                        "status": status,
                        "content": r.get::<_, String>(11)?,
                        "documents": serde_json::from_str::<serde_json::Value>(&documents_raw)
                            .unwrap_or_else(|_| json!([])),
                        "submittedAt": r.get::<_, String>(13)?,
                        "decidedAt": r.get::<_, Option<String>>(14)?,
                    })
                }
                None => serde_json::Value::Null,
            };
            Ok(json!({
                "entryId": r.get::<_, String>(0)?,
                "studentId": student_id,
                "displayName": display_name,
                "start": r.get::<_, Option<String>>(4)?,
                "end": r.get::<_, Option<String>>(5)?,
                "room": r.get::<_, Option<String>>(6)?,
                "teacher": r.get::<_, Option<String>>(7)?,
                "subjectLabel": r.get::<_, String>(8)?,
                "recordedAt": r.get::<_, String>(9)?,
                "justification": justification,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(json!({
        "record": {
            "id": record_id,
            "classId": class_id,
            "term": term,
            "date": date.to_string(),
            "subjectId": subject_id,
            "start": start,
            "end": end,
        },
        "absentees": absentees,
    }))
}

fn handle_absences_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match record_absence(conn, &mut state.facts, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_absences_session_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match session_open(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "absences.record" => Some(handle_absences_record(state, req)),
        "absences.sessionOpen" => Some(handle_absences_session_open(state, req)),
        _ => None,
    }
}
