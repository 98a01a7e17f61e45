use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_date, get_required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let label = match get_required_str(&req.params, "label") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let start = match get_required_date(&req.params, "startDate") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let end = match get_required_date(&req.params, "endDate") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if end < start {
        return err(&req.id, "bad_params", "endDate before startDate", None);
    }

    let year_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO academic_years(id, label, start_date, end_date) VALUES(?, ?, ?, ?)",
        (&year_id, &label, start.to_string(), end.to_string()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "academic_years" })),
        );
    }

    ok(&req.id, json!({ "yearId": year_id, "label": label }))
}

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "years": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT id, label, start_date, end_date FROM academic_years ORDER BY start_date",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let label: String = row.get(1)?;
            let start_date: String = row.get(2)?;
            let end_date: String = row.get(3)?;
            Ok(json!({
                "id": id,
                "label": label,
                "startDate": start_date,
                "endDate": end_date
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(years) => ok(&req.id, json!({ "years": years })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name) VALUES(?, ?)",
        (&subject_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "name": name }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    let mut stmt = match conn.prepare("SELECT id, name FROM subjects ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.create" => Some(handle_years_create(state, req)),
        "years.list" => Some(handle_years_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        _ => None,
    }
}
