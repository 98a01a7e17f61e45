use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::schedule::{
    self, minute_of_day, CalendarFacts, MakeupSession, SessionIdentity, SessionSource,
    TimetableSlot,
};

#[derive(Debug, Clone, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub term: i64,
}

#[derive(Debug, Clone)]
pub struct StudentTotals {
    pub student_id: String,
    pub display_name: String,
    pub missed_count: i64,
    pub missed_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct AbsenteeRow {
    pub student_id: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub minutes: i64,
    pub justification: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub date: NaiveDate,
    pub subject_id: String,
    pub subject_label: String,
    pub start: String,
    pub end: String,
    pub source: SessionSource,
    pub absentees: Vec<AbsenteeRow>,
}

#[derive(Debug, Clone)]
pub struct AttendanceReport {
    pub per_student: Vec<StudentTotals>,
    pub per_session: Vec<SessionRow>,
}

/// Minutes charged for one absence entry. The entry's own times win when
/// present; otherwise the session's. Never negative.
pub fn absence_minutes(
    entry_start: Option<&str>,
    entry_end: Option<&str>,
    session_start: &str,
    session_end: &str,
) -> i64 {
    let s = minute_of_day(entry_start.unwrap_or(session_start)) as i64;
    let e = minute_of_day(entry_end.unwrap_or(session_end)) as i64;
    (e - s).max(0)
}

/// Report order: most missed sessions first, then most missed minutes,
/// then name ascending (case-folded).
pub fn sort_totals(rows: &mut [StudentTotals]) {
    rows.sort_by(|a, b| {
        b.missed_count
            .cmp(&a.missed_count)
            .then(b.missed_minutes.cmp(&a.missed_minutes))
            .then_with(|| {
                a.display_name
                    .to_lowercase()
                    .cmp(&b.display_name.to_lowercase())
            })
    });
}

struct RawEntry {
    student_id: String,
    start: Option<String>,
    end: Option<String>,
    justification: Option<String>,
}

fn entries_for_session(
    ctx: &AggregateContext<'_>,
    date: NaiveDate,
    subject_id: &str,
    start: &str,
    end: &str,
) -> Result<Vec<RawEntry>, ReportError> {
    let record_id: Option<String> = ctx
        .conn
        .query_row(
            "SELECT id FROM session_records
             WHERE class_id = ? AND term = ? AND date = ? AND subject_id = ?
               AND start_time = ? AND end_time = ?",
            (
                ctx.class_id,
                ctx.term,
                date.to_string(),
                subject_id,
                start,
                end,
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| ReportError::new("db_query_failed", e.to_string()))?;

    let Some(record_id) = record_id else {
        return Ok(Vec::new());
    };

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT a.student_id, a.start_time, a.end_time, j.status
             FROM absence_entries a
             LEFT JOIN justifications j
               ON j.record_id = a.record_id AND j.student_id = a.student_id
             WHERE a.record_id = ?
             ORDER BY a.student_id",
        )
        .map_err(|e| ReportError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([&record_id], |r| {
        Ok(RawEntry {
            student_id: r.get(0)?,
            start: r.get(1)?,
            end: r.get(2)?,
            justification: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| ReportError::new("db_query_failed", e.to_string()))
}

/// Fold absences over an inclusive date range into per-student totals and
/// per-session detail rows. Neutralized sessions are dropped before their
/// records are even fetched, so absences mistakenly recorded against them
/// never count (they are not deleted either).
pub fn aggregate(
    ctx: &AggregateContext<'_>,
    facts: &CalendarFacts,
    slots: &[TimetableSlot],
    makeups: &[MakeupSession],
    from: NaiveDate,
    to: NaiveDate,
) -> Result<AttendanceReport, ReportError> {
    let mut roster_stmt = ctx
        .conn
        .prepare(
            "SELECT id, last_name, first_name
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| ReportError::new("db_query_failed", e.to_string()))?;
    let roster: Vec<(String, String)> = roster_stmt
        .query_map([ctx.class_id], |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((id, format!("{}, {}", last, first)))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ReportError::new("db_query_failed", e.to_string()))?;

    // Zero rows up front: every roster student appears in the report even
    // with no absences, so downstream consumers never special-case "no data".
    let mut order: Vec<String> = Vec::with_capacity(roster.len());
    let mut totals: std::collections::HashMap<String, StudentTotals> =
        std::collections::HashMap::new();
    for (id, name) in &roster {
        order.push(id.clone());
        totals.insert(
            id.clone(),
            StudentTotals {
                student_id: id.clone(),
                display_name: name.clone(),
                missed_count: 0,
                missed_minutes: 0,
            },
        );
    }

    let mut per_session: Vec<SessionRow> = Vec::new();
    let mut day = from;
    while day <= to {
        for cand in schedule::sessions_for_date(slots, makeups, day) {
            let identity = SessionIdentity {
                class_id: ctx.class_id.to_string(),
                subject_id: cand.subject_id.clone(),
                date: day,
                start: cand.start.clone(),
                end: cand.end.clone(),
            };
            if schedule::evaluate(&identity, facts).neutralized {
                continue;
            }

            let raw = entries_for_session(ctx, day, &cand.subject_id, &cand.start, &cand.end)?;
            let mut absentees: Vec<AbsenteeRow> = Vec::with_capacity(raw.len());
            for entry in raw {
                let minutes = absence_minutes(
                    entry.start.as_deref(),
                    entry.end.as_deref(),
                    &cand.start,
                    &cand.end,
                );
                let row = totals.entry(entry.student_id.clone()).or_insert_with(|| {
                    // Entry for a student no longer on the roster; keep the
                    // count rather than losing recorded history.
                    order.push(entry.student_id.clone());
                    StudentTotals {
                        student_id: entry.student_id.clone(),
                        display_name: entry.student_id.clone(),
                        missed_count: 0,
                        missed_minutes: 0,
                    }
                });
                row.missed_count += 1;
                row.missed_minutes += minutes;
                absentees.push(AbsenteeRow {
                    student_id: entry.student_id,
                    start: entry.start,
                    end: entry.end,
                    minutes,
                    justification: entry.justification,
                });
            }

            per_session.push(SessionRow {
                date: day,
                subject_id: cand.subject_id,
                subject_label: cand.subject_label,
                start: cand.start,
                end: cand.end,
                source: cand.source,
                absentees,
            });
        }

        let Some(next) = day.succ_opt() else { break };
        day = next;
    }

    let mut per_student: Vec<StudentTotals> = order
        .iter()
        .filter_map(|id| totals.get(id).cloned())
        .collect();
    sort_totals(&mut per_student);

    Ok(AttendanceReport {
        per_student,
        per_session,
    })
}

// --- Justification workflow ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JustificationStatus {
    Pending,
    Approved,
    Rejected,
}

impl JustificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JustificationStatus::Pending => "pending",
            JustificationStatus::Approved => "approved",
            JustificationStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(JustificationStatus::Pending),
            "approved" => Some(JustificationStatus::Approved),
            "rejected" => Some(JustificationStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JustificationStatus::Approved | JustificationStatus::Rejected
        )
    }
}

/// Outcome of a decide call against the current stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecideOutcome {
    /// Pending became Approved or Rejected; persist and notify.
    Applied(JustificationStatus),
    /// Nothing to do: no justification, or already terminal. Not an error.
    NoEffect(Option<JustificationStatus>),
}

pub fn decide_transition(current: Option<JustificationStatus>, approve: bool) -> DecideOutcome {
    match current {
        Some(JustificationStatus::Pending) => DecideOutcome::Applied(if approve {
            JustificationStatus::Approved
        } else {
            JustificationStatus::Rejected
        }),
        other => DecideOutcome::NoEffect(other),
    }
}

/// Notification event handed to the external delivery channel. The dedup
/// key is a stable digest of (student, date, start, end, outcome): deciding
/// the same way twice can never enqueue twice.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub dedup_key: String,
    pub student_id: String,
    pub kind: &'static str,
    pub payload: serde_json::Value,
}

pub fn justification_dedup_key(
    student_id: &str,
    date: NaiveDate,
    start: &str,
    end: &str,
    outcome: JustificationStatus,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(student_id.as_bytes());
    hasher.update(b"|");
    hasher.update(date.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(start.as_bytes());
    hasher.update(b"|");
    hasher.update(end.as_bytes());
    hasher.update(b"|");
    hasher.update(outcome.as_str().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn build_justification_event(
    student_id: &str,
    session: &SessionIdentity,
    outcome: JustificationStatus,
) -> NotificationEvent {
    let dedup_key =
        justification_dedup_key(student_id, session.date, &session.start, &session.end, outcome);
    let payload = serde_json::json!({
        "type": "justification",
        "studentId": student_id,
        "decision": outcome.as_str(),
        "session": {
            "classId": session.class_id,
            "subjectId": session.subject_id,
            "date": session.date.to_string(),
            "start": session.start,
            "end": session.end,
        },
        "dedupKey": dedup_key,
    });
    NotificationEvent {
        dedup_key,
        student_id: student_id.to_string(),
        kind: "justification",
        payload,
    }
}
