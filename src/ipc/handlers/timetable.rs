use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    cached_slots, get_optional_str, get_required_str, resolve_term, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct SlotInput {
    weekday: i64,
    subject_id: String,
    start: String,
    end: String,
    room: Option<String>,
    teacher: Option<String>,
}

fn parse_slot(idx: usize, raw: &serde_json::Value) -> Result<SlotInput, HandlerErr> {
    let weekday = raw
        .get("weekday")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("slots[{}]: missing weekday", idx)))?;
    if !(1..=7).contains(&weekday) {
        return Err(HandlerErr::bad_params(format!(
            "slots[{}]: weekday must be 1..7",
            idx
        )));
    }
    let subject_id = get_required_str(raw, "subjectId")
        .map_err(|_| HandlerErr::bad_params(format!("slots[{}]: missing subjectId", idx)))?;

    let start_raw = get_required_str(raw, "start")
        .map_err(|_| HandlerErr::bad_params(format!("slots[{}]: missing start", idx)))?;
    let end_raw = get_required_str(raw, "end")
        .map_err(|_| HandlerErr::bad_params(format!("slots[{}]: missing end", idx)))?;
    let start_min = schedule::parse_hhmm(&start_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("slots[{}]: start must be HH:MM", idx)))?;
    let end_min = schedule::parse_hhmm(&end_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("slots[{}]: end must be HH:MM", idx)))?;
    if start_min >= end_min {
        return Err(HandlerErr::bad_params(format!(
            "slots[{}]: start must be before end",
            idx
        )));
    }

    Ok(SlotInput {
        weekday,
        subject_id,
        start: schedule::format_hhmm(start_min),
        end: schedule::format_hhmm(end_min),
        room: get_optional_str(raw, "room"),
        teacher: get_optional_str(raw, "teacher"),
    })
}

/// Replaces the whole weekly pattern for (class, term) in one transaction.
fn timetable_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(String, usize), HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let term = params
        .get("term")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing term"))?;
    let slots_json = params
        .get("slots")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing slots"))?;

    let class_exists = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?
        .is_some();
    if !class_exists {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let mut slots = Vec::with_capacity(slots_json.len());
    for (idx, raw) in slots_json.iter().enumerate() {
        slots.push(parse_slot(idx, raw)?);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    for (idx, slot) in slots.iter().enumerate() {
        let subject_exists = tx
            .query_row(
                "SELECT 1 FROM subjects WHERE id = ?",
                [&slot.subject_id],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?
            .is_some();
        if !subject_exists {
            return Err(HandlerErr {
                code: "not_found",
                message: "subject not found".to_string(),
                details: Some(json!({ "slot": idx, "subjectId": slot.subject_id })),
            });
        }
    }

    tx.execute(
        "DELETE FROM timetable_slots WHERE class_id = ? AND term = ?",
        (&class_id, term),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    for slot in &slots {
        tx.execute(
            "INSERT INTO timetable_slots(id, class_id, term, weekday, subject_id,
                                         start_time, end_time, room, teacher)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &class_id,
                term,
                slot.weekday,
                &slot.subject_id,
                &slot.start,
                &slot.end,
                &slot.room,
                &slot.teacher,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "timetable_slots" })),
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    // Remember the term this class is currently running on.
    let key = format!("class.{}.activeTerm", class_id);
    db::settings_set_json(conn, &key, &json!(term))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok((class_id, slots.len()))
}

fn handle_timetable_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match timetable_set(conn, &req.params) {
        Ok((class_id, count)) => {
            state
                .facts
                .slots
                .invalidate_prefix(&format!("{}/", class_id));
            ok(&req.id, json!({ "count": count }))
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_timetable_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let term = match resolve_term(conn, &req.params, &class_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let slots = match cached_slots(conn, &mut state.facts, &class_id, term) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let slots_json: Vec<serde_json::Value> = slots
        .iter()
        .map(|s| {
            json!({
                "weekday": s.weekday,
                "subjectId": s.subject_id,
                "subjectLabel": s.subject_label,
                "start": s.start,
                "end": s.end,
                "room": s.room,
                "teacher": s.teacher
            })
        })
        .collect();

    ok(&req.id, json!({ "term": term, "slots": slots_json }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.set" => Some(handle_timetable_set(state, req)),
        "timetable.get" => Some(handle_timetable_get(state, req)),
        _ => None,
    }
}
