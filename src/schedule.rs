use chrono::{Datelike, NaiveDate};

/// Weekday numbering used across the schedule tables: Monday = 1 .. Sunday = 7.
/// Weekday 7 is the designated rest day and never carries sessions.
pub const REST_DAY: u32 = 7;

/// Minute-of-day from an "HH:MM" string, strict form.
/// Accepts unpadded hours ("8:30"); rejects anything else.
pub fn parse_hhmm(raw: &str) -> Option<u32> {
    let (h, m) = raw.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Lenient variant used inside the engine: malformed input degrades to
/// minute 0 so report generation keeps working on dirty historical data.
/// The IPC write surface validates strictly, so this path only triggers for
/// rows that entered the store through some other door.
pub fn minute_of_day(raw: &str) -> u32 {
    parse_hhmm(raw).unwrap_or(0)
}

/// Canonical zero-padded "HH:MM" for storage, so string-keyed lookups on
/// session times never miss on formatting differences.
pub fn format_hhmm(minute: u32) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

/// Half-open interval intersection on minutes: [s1,e1) meets [s2,e2).
fn overlaps(s1: u32, e1: u32, s2: u32, e2: u32) -> bool {
    s1 < e2 && s2 < e1
}

#[derive(Debug, Clone)]
pub struct TimetableSlot {
    pub weekday: u32,
    pub subject_id: String,
    pub subject_label: String,
    pub start: String,
    pub end: String,
    pub room: Option<String>,
    pub teacher: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MakeupSession {
    pub date: NaiveDate,
    pub subject_id: String,
    pub subject_label: String,
    pub start: String,
    pub end: String,
    pub room: Option<String>,
    pub teacher: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Timetable,
    Makeup,
}

impl SessionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionSource::Timetable => "timetable",
            SessionSource::Makeup => "makeup",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CandidateSession {
    pub subject_id: String,
    pub subject_label: String,
    pub start: String,
    pub end: String,
    pub room: Option<String>,
    pub teacher: Option<String>,
    pub source: SessionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureScope {
    Global,
    Class,
    Subject,
}

impl ClosureScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ClosureScope::Global => "global",
            ClosureScope::Class => "class",
            ClosureScope::Subject => "subject",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "global" => Some(ClosureScope::Global),
            "class" => Some(ClosureScope::Class),
            "subject" => Some(ClosureScope::Subject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClosureRule {
    pub id: String,
    pub scope: ClosureScope,
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Optional time-of-day sub-window [start_time, end_time); absent means
    /// the rule covers the whole day.
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub label: Option<String>,
}

/// Per-session exception. Identity of Cancel/Reschedule is the exact
/// (class, subject, date, start, end) tuple; Makeup inserts an additional
/// session and never neutralizes anything.
#[derive(Debug, Clone)]
pub enum SessionOverride {
    Cancel {
        class_id: String,
        subject_id: String,
        date: NaiveDate,
        start: String,
        end: String,
        reason: Option<String>,
    },
    Reschedule {
        class_id: String,
        subject_id: String,
        date: NaiveDate,
        start: String,
        end: String,
        new_date: NaiveDate,
        new_start: String,
        new_end: String,
    },
    Makeup {
        class_id: String,
        subject_id: String,
        subject_label: String,
        date: NaiveDate,
        start: String,
        end: String,
        room: Option<String>,
        teacher: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct FixedHoliday {
    pub month: u32,
    pub day: u32,
    pub label: String,
}

#[derive(Debug, Clone, Copy)]
pub struct YearBounds {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Snapshot of the calendar fact store for one class/year/term, loaded by
/// the caller (optionally through the read cache). The evaluator itself
/// stays pure: same facts in, same verdict out.
#[derive(Debug, Clone, Default)]
pub struct CalendarFacts {
    pub closures: Vec<ClosureRule>,
    pub overrides: Vec<SessionOverride>,
    pub holidays: Vec<FixedHoliday>,
    pub bounds: Option<YearBounds>,
}

/// One concrete teaching occurrence, as the evaluator sees it.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub class_id: String,
    pub subject_id: String,
    pub date: NaiveDate,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    pub date: NaiveDate,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeutralizationResult {
    pub neutralized: bool,
    pub reason: Option<String>,
    pub replacement: Option<Replacement>,
}

impl NeutralizationResult {
    fn active() -> Self {
        NeutralizationResult {
            neutralized: false,
            reason: None,
            replacement: None,
        }
    }

    fn neutralized(reason: String) -> Self {
        NeutralizationResult {
            neutralized: true,
            reason: Some(reason),
            replacement: None,
        }
    }
}

/// Expand the weekly pattern plus one-off makeups into the concrete sessions
/// scheduled for one class on one date, ordered by start then end minute.
/// Empty inputs give an empty list; this never fails.
pub fn sessions_for_date(
    slots: &[TimetableSlot],
    makeups: &[MakeupSession],
    date: NaiveDate,
) -> Vec<CandidateSession> {
    let weekday = date.weekday().number_from_monday();
    if weekday == REST_DAY {
        return Vec::new();
    }

    let mut out: Vec<CandidateSession> = Vec::new();
    for slot in slots {
        if slot.weekday != weekday {
            continue;
        }
        out.push(CandidateSession {
            subject_id: slot.subject_id.clone(),
            subject_label: slot.subject_label.clone(),
            start: slot.start.clone(),
            end: slot.end.clone(),
            room: slot.room.clone(),
            teacher: slot.teacher.clone(),
            source: SessionSource::Timetable,
        });
    }
    for mk in makeups {
        if mk.date != date {
            continue;
        }
        out.push(CandidateSession {
            subject_id: mk.subject_id.clone(),
            subject_label: mk.subject_label.clone(),
            start: mk.start.clone(),
            end: mk.end.clone(),
            room: mk.room.clone(),
            teacher: mk.teacher.clone(),
            source: SessionSource::Makeup,
        });
    }

    out.sort_by_key(|s| (minute_of_day(&s.start), minute_of_day(&s.end)));
    out
}

fn override_matches(
    session: &SessionIdentity,
    class_id: &str,
    subject_id: &str,
    date: NaiveDate,
    start: &str,
    end: &str,
) -> bool {
    session.class_id == class_id
        && session.subject_id == subject_id
        && session.date == date
        && minute_of_day(&session.start) == minute_of_day(start)
        && minute_of_day(&session.end) == minute_of_day(end)
}

fn closure_matches(session: &SessionIdentity, rule: &ClosureRule) -> bool {
    let scope_ok = match rule.scope {
        ClosureScope::Global => true,
        ClosureScope::Class => rule.class_id.as_deref() == Some(session.class_id.as_str()),
        ClosureScope::Subject => rule.subject_id.as_deref() == Some(session.subject_id.as_str()),
    };
    if !scope_ok {
        return false;
    }
    if session.date < rule.start_date || session.date > rule.end_date {
        return false;
    }
    match (&rule.start_time, &rule.end_time) {
        (Some(ws), Some(we)) => overlaps(
            minute_of_day(&session.start),
            minute_of_day(&session.end),
            minute_of_day(ws),
            minute_of_day(we),
        ),
        // No window (or half a window, which the write surface rejects
        // anyway) means the whole day is covered.
        _ => true,
    }
}

/// Decide whether a concrete session is neutralized and why.
///
/// Precedence, first match wins:
/// 1. cancel/reschedule override on the exact session identity
/// 2. closure rules in store order
/// 3. fixed holiday within the academic year bounds
///
/// Pure and total: no I/O, identical inputs always give identical output.
pub fn evaluate(session: &SessionIdentity, facts: &CalendarFacts) -> NeutralizationResult {
    for ov in &facts.overrides {
        match ov {
            SessionOverride::Cancel {
                class_id,
                subject_id,
                date,
                start,
                end,
                reason,
            } => {
                if override_matches(session, class_id, subject_id, *date, start, end) {
                    let reason = reason
                        .as_deref()
                        .filter(|r| !r.trim().is_empty())
                        .unwrap_or("cancelled")
                        .to_string();
                    return NeutralizationResult::neutralized(reason);
                }
            }
            SessionOverride::Reschedule {
                class_id,
                subject_id,
                date,
                start,
                end,
                new_date,
                new_start,
                new_end,
            } => {
                if override_matches(session, class_id, subject_id, *date, start, end) {
                    // The target slot is not validated here; consumers may
                    // evaluate the replacement independently.
                    return NeutralizationResult {
                        neutralized: true,
                        reason: Some("moved".to_string()),
                        replacement: Some(Replacement {
                            date: *new_date,
                            start: new_start.clone(),
                            end: new_end.clone(),
                        }),
                    };
                }
            }
            SessionOverride::Makeup { .. } => {}
        }
    }

    for rule in &facts.closures {
        if closure_matches(session, rule) {
            let reason = rule
                .label
                .as_deref()
                .filter(|l| !l.trim().is_empty())
                .unwrap_or("closure")
                .to_string();
            return NeutralizationResult::neutralized(reason);
        }
    }

    if let Some(bounds) = facts.bounds {
        if session.date >= bounds.start && session.date <= bounds.end {
            for h in &facts.holidays {
                if session.date.month() == h.month && session.date.day() == h.day {
                    return NeutralizationResult::neutralized(format!("holiday ({})", h.label));
                }
            }
        }
    }

    NeutralizationResult::active()
}
