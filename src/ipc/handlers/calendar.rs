use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_optional_time, get_required_date, get_required_str, get_required_time,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::ClosureScope;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn require_year(conn: &Connection, year_id: &str) -> Result<(), HandlerErr> {
    let exists = conn
        .query_row("SELECT 1 FROM academic_years WHERE id = ?", [year_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(HandlerErr::new("not_found", "academic year not found"))
    }
}

fn require_row(
    conn: &Connection,
    table: &str,
    id: &str,
    what: &'static str,
) -> Result<(), HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let exists = conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map_err(HandlerErr::db_query)?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(HandlerErr::new("not_found", what))
    }
}

fn closure_add(conn: &Connection, params: &serde_json::Value) -> Result<(String, String), HandlerErr> {
    let year_id = get_required_str(params, "yearId")?;
    require_year(conn, &year_id)?;

    let scope_raw = get_required_str(params, "scope")?;
    let scope = ClosureScope::from_str(&scope_raw)
        .ok_or_else(|| HandlerErr::bad_params("scope must be global, class or subject"))?;

    let class_id = get_optional_str(params, "classId");
    let subject_id = get_optional_str(params, "subjectId");
    match scope {
        ClosureScope::Class => {
            let Some(cid) = class_id.as_deref() else {
                return Err(HandlerErr::bad_params("class scope requires classId"));
            };
            require_row(conn, "classes", cid, "class not found")?;
        }
        ClosureScope::Subject => {
            let Some(sid) = subject_id.as_deref() else {
                return Err(HandlerErr::bad_params("subject scope requires subjectId"));
            };
            require_row(conn, "subjects", sid, "subject not found")?;
        }
        ClosureScope::Global => {}
    }

    let start_date = get_required_date(params, "startDate")?;
    let end_date = get_required_date(params, "endDate")?;
    if end_date < start_date {
        return Err(HandlerErr::bad_params("endDate before startDate"));
    }

    let window_start = get_optional_time(params, "startTime")?;
    let window_end = get_optional_time(params, "endTime")?;
    match (&window_start, &window_end) {
        (Some(s), Some(e)) if s >= e => {
            return Err(HandlerErr::bad_params("startTime must be before endTime"));
        }
        (Some(_), None) | (None, Some(_)) => {
            return Err(HandlerErr::bad_params(
                "startTime and endTime must be given together",
            ));
        }
        _ => {}
    }

    let rule_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO closure_rules(id, year_id, scope, class_id, subject_id,
                                   start_date, end_date, window_start, window_end, label)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &rule_id,
            &year_id,
            scope.as_str(),
            &class_id,
            &subject_id,
            start_date.to_string(),
            end_date.to_string(),
            &window_start,
            &window_end,
            get_optional_str(params, "label"),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "closure_rules" })),
    })?;

    Ok((rule_id, year_id))
}

fn closure_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let year_id = get_required_str(params, "yearId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, scope, class_id, subject_id, start_date, end_date,
                    window_start, window_end, label
             FROM closure_rules
             WHERE year_id = ?
             ORDER BY rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let rules = stmt
        .query_map([&year_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "scope": r.get::<_, String>(1)?,
                "classId": r.get::<_, Option<String>>(2)?,
                "subjectId": r.get::<_, Option<String>>(3)?,
                "startDate": r.get::<_, String>(4)?,
                "endDate": r.get::<_, String>(5)?,
                "startTime": r.get::<_, Option<String>>(6)?,
                "endTime": r.get::<_, Option<String>>(7)?,
                "label": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "rules": rules }))
}

fn override_add(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(String, String), HandlerErr> {
    let year_id = get_required_str(params, "yearId")?;
    require_year(conn, &year_id)?;

    let kind = get_required_str(params, "kind")?;
    if !matches!(kind.as_str(), "cancel" | "reschedule" | "makeup") {
        return Err(HandlerErr::bad_params(
            "kind must be cancel, reschedule or makeup",
        ));
    }

    let class_id = get_required_str(params, "classId")?;
    require_row(conn, "classes", &class_id, "class not found")?;
    let subject_id = get_required_str(params, "subjectId")?;
    require_row(conn, "subjects", &subject_id, "subject not found")?;

    let date = get_required_date(params, "date")?;
    let start = get_required_time(params, "start")?;
    let end = get_required_time(params, "end")?;
    if start >= end {
        return Err(HandlerErr::bad_params("start must be before end"));
    }

    let mut reason: Option<String> = None;
    let mut new_date: Option<String> = None;
    let mut new_start: Option<String> = None;
    let mut new_end: Option<String> = None;
    let mut room: Option<String> = None;
    let mut teacher: Option<String> = None;

    match kind.as_str() {
        "cancel" => {
            reason = get_optional_str(params, "reason");
        }
        "reschedule" => {
            new_date = Some(get_required_date(params, "newDate")?.to_string());
            let ns = get_required_time(params, "newStart")?;
            let ne = get_required_time(params, "newEnd")?;
            if ns >= ne {
                return Err(HandlerErr::bad_params("newStart must be before newEnd"));
            }
            new_start = Some(ns);
            new_end = Some(ne);
        }
        _ => {
            room = get_optional_str(params, "room");
            teacher = get_optional_str(params, "teacher");
        }
    }

    let override_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO session_overrides(id, year_id, kind, class_id, subject_id, date,
                                       start_time, end_time, reason,
                                       new_date, new_start, new_end, room, teacher)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &override_id,
            &year_id,
            &kind,
            &class_id,
            &subject_id,
            date.to_string(),
            &start,
            &end,
            &reason,
            &new_date,
            &new_start,
            &new_end,
            &room,
            &teacher,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "session_overrides" })),
    })?;

    Ok((override_id, year_id))
}

fn override_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let year_id = get_required_str(params, "yearId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, kind, class_id, subject_id, date, start_time, end_time,
                    reason, new_date, new_start, new_end, room, teacher
             FROM session_overrides
             WHERE year_id = ?
             ORDER BY rowid",
        )
        .map_err(HandlerErr::db_query)?;
    let overrides = stmt
        .query_map([&year_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "classId": r.get::<_, String>(2)?,
                "subjectId": r.get::<_, String>(3)?,
                "date": r.get::<_, String>(4)?,
                "start": r.get::<_, String>(5)?,
                "end": r.get::<_, String>(6)?,
                "reason": r.get::<_, Option<String>>(7)?,
                "newDate": r.get::<_, Option<String>>(8)?,
                "newStart": r.get::<_, Option<String>>(9)?,
                "newEnd": r.get::<_, Option<String>>(10)?,
                "room": r.get::<_, Option<String>>(11)?,
                "teacher": r.get::<_, Option<String>>(12)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "overrides": overrides }))
}

fn max_day(month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        // Feb 29 recurs in leap years only; storing it is legitimate.
        2 => 29,
        _ => 0,
    }
}

fn holiday_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let month = params
        .get("month")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing month"))? as u32;
    let day = params
        .get("day")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing day"))? as u32;
    if !(1..=12).contains(&month) {
        return Err(HandlerErr::bad_params("month must be 1..12"));
    }
    if day == 0 || day > max_day(month) {
        return Err(HandlerErr::bad_params("day out of range for month"));
    }
    let label = get_required_str(params, "label")?;

    conn.execute(
        "INSERT INTO fixed_holidays(month, day, label) VALUES(?, ?, ?)
         ON CONFLICT(month, day) DO UPDATE SET label = excluded.label",
        (month, day, &label),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "fixed_holidays" })),
    })?;

    Ok(json!({ "ok": true }))
}

fn holiday_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT month, day, label FROM fixed_holidays ORDER BY month, day")
        .map_err(HandlerErr::db_query)?;
    let holidays = stmt
        .query_map([], |r| {
            Ok(json!({
                "month": r.get::<_, i64>(0)?,
                "day": r.get::<_, i64>(1)?,
                "label": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    Ok(json!({ "holidays": holidays }))
}

fn handle_closure_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match closure_add(conn, &req.params) {
        Ok((rule_id, year_id)) => {
            state.facts.closures.invalidate_prefix(&year_id);
            ok(&req.id, json!({ "ruleId": rule_id }))
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_closure_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match closure_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_override_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match override_add(conn, &req.params) {
        Ok((override_id, year_id)) => {
            state.facts.overrides.invalidate_prefix(&year_id);
            ok(&req.id, json!({ "overrideId": override_id }))
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_override_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match override_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_holiday_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match holiday_set(conn, &req.params) {
        Ok(result) => {
            state.facts.holidays.invalidate_prefix("");
            ok(&req.id, result)
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_holiday_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match holiday_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calendar.closureAdd" => Some(handle_closure_add(state, req)),
        "calendar.closureList" => Some(handle_closure_list(state, req)),
        "calendar.overrideAdd" => Some(handle_override_add(state, req)),
        "calendar.overrideList" => Some(handle_override_list(state, req)),
        "calendar.holidaySet" => Some(handle_holiday_set(state, req)),
        "calendar.holidayList" => Some(handle_holiday_list(state, req)),
        _ => None,
    }
}
