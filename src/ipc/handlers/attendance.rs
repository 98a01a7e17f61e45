use crate::attend::{self, AggregateContext, AttendanceReport};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    cached_slots, calendar_facts_for_year, get_required_date, get_required_str, load_makeups,
    require_class_year, resolve_term, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn report_json(report: &AttendanceReport) -> serde_json::Value {
    let per_student: Vec<serde_json::Value> = report
        .per_student
        .iter()
        .map(|s| {
            json!({
                "studentId": s.student_id,
                "displayName": s.display_name,
                "missedCount": s.missed_count,
                "missedMinutes": s.missed_minutes,
            })
        })
        .collect();

    let per_session: Vec<serde_json::Value> = report
        .per_session
        .iter()
        .map(|sess| {
            let absentees: Vec<serde_json::Value> = sess
                .absentees
                .iter()
                .map(|a| {
                    json!({
                        "studentId": a.student_id,
                        "start": a.start,
                        "end": a.end,
                        "minutes": a.minutes,
                        "justification": a.justification,
                    })
                })
                .collect();
            json!({
                "date": sess.date.to_string(),
                "subjectId": sess.subject_id,
                "subjectLabel": sess.subject_label,
                "start": sess.start,
                "end": sess.end,
                "source": sess.source.as_str(),
                "absentees": absentees,
            })
        })
        .collect();

    json!({ "perStudent": per_student, "perSession": per_session })
}

fn handle_attendance_aggregate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let class_id = match get_required_str(&req.params, "classId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let from = match get_required_date(&req.params, "from") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let to = match get_required_date(&req.params, "to") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let year_id = match require_class_year(conn, &class_id) {
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
    let makeups = match load_makeups(conn, &class_id, from, to) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let calendar = match calendar_facts_for_year(conn, &mut state.facts, &year_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ctx = AggregateContext {
        conn,
        class_id: &class_id,
        term,
    };
    match attend::aggregate(&ctx, &calendar, &slots, &makeups, from, to) {
        Ok(report) => ok(&req.id, report_json(&report)),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.aggregate" => Some(handle_attendance_aggregate(state, req)),
        _ => None,
    }
}
