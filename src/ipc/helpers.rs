use chrono::NaiveDate;
use rusqlite::Connection;

use crate::db;
use crate::ipc::error::err;
use crate::ipc::types::FactCaches;
use crate::schedule::{self, CalendarFacts, MakeupSession, TimetableSlot};

/// Error carried out of handler bodies; turned into the wire error object
/// at the dispatch boundary.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn db_query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_i64(params: &serde_json::Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Dates cross the boundary as strict "YYYY-MM-DD".
pub fn get_required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

/// Times cross the boundary as strict "HH:MM" and are stored zero-padded
/// so identity lookups compare as plain strings.
pub fn get_required_time(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    let minute = schedule::parse_hhmm(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be HH:MM", key)))?;
    Ok(schedule::format_hhmm(minute))
}

pub fn get_optional_time(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = get_optional_str(params, key) else {
        return Ok(None);
    };
    let minute = schedule::parse_hhmm(&raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be HH:MM", key)))?;
    Ok(Some(schedule::format_hhmm(minute)))
}

// ---- Cached reference-data loads ----

pub fn cached_slots(
    conn: &Connection,
    facts: &mut FactCaches,
    class_id: &str,
    term: i64,
) -> Result<Vec<TimetableSlot>, HandlerErr> {
    let key = format!("{}/{}", class_id, term);
    if let Some(hit) = facts.slots.get(&key) {
        return Ok(hit);
    }
    let slots = db::get_timetable(conn, class_id, term).map_err(HandlerErr::db_query)?;
    facts.slots.set(&key, slots.clone());
    Ok(slots)
}

/// Closures, overrides, fixed holidays, and year bounds for one academic
/// year, assembled for the neutralization evaluator.
pub fn calendar_facts_for_year(
    conn: &Connection,
    facts: &mut FactCaches,
    year_id: &str,
) -> Result<CalendarFacts, HandlerErr> {
    let closures = match facts.closures.get(year_id) {
        Some(hit) => hit,
        None => {
            let loaded = db::get_closures(conn, year_id).map_err(HandlerErr::db_query)?;
            facts.closures.set(year_id, loaded.clone());
            loaded
        }
    };
    let overrides = match facts.overrides.get(year_id) {
        Some(hit) => hit,
        None => {
            let loaded = db::get_overrides(conn, year_id).map_err(HandlerErr::db_query)?;
            facts.overrides.set(year_id, loaded.clone());
            loaded
        }
    };
    let holidays = match facts.holidays.get("all") {
        Some(hit) => hit,
        None => {
            let loaded = db::get_holidays(conn).map_err(HandlerErr::db_query)?;
            facts.holidays.set("all", loaded.clone());
            loaded
        }
    };
    let bounds = match facts.bounds.get(year_id) {
        Some(hit) => hit,
        None => {
            let loaded = db::get_year_bounds(conn, year_id).map_err(HandlerErr::db_query)?;
            facts.bounds.set(year_id, loaded.clone());
            loaded
        }
    };
    Ok(CalendarFacts {
        closures,
        overrides,
        holidays,
        bounds,
    })
}

/// Makeup sessions are range queries, read fresh each time; the overrides
/// cache invalidation already covers their write path.
pub fn load_makeups(
    conn: &Connection,
    class_id: &str,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<MakeupSession>, HandlerErr> {
    db::get_makeup_sessions(conn, class_id, from, to).map_err(HandlerErr::db_query)
}

/// Academic year for a class; not_found when the class is unknown.
pub fn require_class_year(conn: &Connection, class_id: &str) -> Result<String, HandlerErr> {
    db::class_year(conn, class_id)
        .map_err(HandlerErr::db_query)?
        .ok_or_else(|| HandlerErr::new("not_found", "class not found"))
}

/// Term selection: explicit param wins, then the class's active term as
/// remembered by the last timetable.set, then term 1.
pub fn resolve_term(
    conn: &Connection,
    params: &serde_json::Value,
    class_id: &str,
) -> Result<i64, HandlerErr> {
    if let Some(term) = get_optional_i64(params, "term") {
        return Ok(term);
    }
    let key = format!("class.{}.activeTerm", class_id);
    let stored = db::settings_get_json(conn, &key).map_err(HandlerErr::db_query)?;
    Ok(stored.and_then(|v| v.as_i64()).unwrap_or(1))
}
