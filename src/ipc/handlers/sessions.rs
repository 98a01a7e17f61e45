use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    cached_slots, calendar_facts_for_year, get_required_date, get_required_str, get_required_time,
    load_makeups, require_class_year, resolve_term, HandlerErr,
};
use crate::ipc::types::{AppState, FactCaches, Request};
use crate::schedule::{self, NeutralizationResult, SessionIdentity};
use rusqlite::Connection;
use serde_json::json;

fn neutralization_json(result: &NeutralizationResult) -> serde_json::Value {
    json!({
        "neutralized": result.neutralized,
        "reason": result.reason,
        "replacement": result.replacement.as_ref().map(|r| json!({
            "date": r.date.to_string(),
            "start": r.start,
            "end": r.end,
        })),
    })
}

fn evaluate_session(
    conn: &Connection,
    facts: &mut FactCaches,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = get_required_date(params, "date")?;
    let start = get_required_time(params, "start")?;
    let end = get_required_time(params, "end")?;

    let year_id = require_class_year(conn, &class_id)?;
    let calendar = calendar_facts_for_year(conn, facts, &year_id)?;

    let identity = SessionIdentity {
        class_id,
        subject_id,
        date,
        start,
        end,
    };
    let result = schedule::evaluate(&identity, &calendar);
    Ok(neutralization_json(&result))
}

fn list_active(
    conn: &Connection,
    facts: &mut FactCaches,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_date(params, "date")?;
    let year_id = require_class_year(conn, &class_id)?;
    let term = resolve_term(conn, params, &class_id)?;

    let slots = cached_slots(conn, facts, &class_id, term)?;
    let makeups = load_makeups(conn, &class_id, date, date)?;
    let calendar = calendar_facts_for_year(conn, facts, &year_id)?;

    let mut sessions = Vec::new();
    for cand in schedule::sessions_for_date(&slots, &makeups, date) {
        let identity = SessionIdentity {
            class_id: class_id.clone(),
            subject_id: cand.subject_id.clone(),
            date,
            start: cand.start.clone(),
            end: cand.end.clone(),
        };
        if schedule::evaluate(&identity, &calendar).neutralized {
            continue;
        }
        sessions.push(json!({
            "subjectId": cand.subject_id,
            "subjectLabel": cand.subject_label,
            "start": cand.start,
            "end": cand.end,
            "room": cand.room,
            "teacher": cand.teacher,
            "source": cand.source.as_str(),
        }));
    }

    Ok(json!({
        "date": date.to_string(),
        "term": term,
        "sessions": sessions,
    }))
}

fn handle_sessions_evaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match evaluate_session(conn, &mut state.facts, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sessions_list_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match list_active(conn, &mut state.facts, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.evaluate" => Some(handle_sessions_evaluate(state, req)),
        "sessions.listActive" => Some(handle_sessions_list_active(state, req)),
        _ => None,
    }
}
