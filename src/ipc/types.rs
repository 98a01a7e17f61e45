use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use serde::Deserialize;

use crate::cache::ReadCache;
use crate::schedule::{ClosureRule, FixedHoliday, SessionOverride, TimetableSlot, YearBounds};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Calendar reference data stays valid for this long before a cache entry
/// is recomputed from the store.
pub const FACT_TTL: Duration = Duration::from_secs(30);

/// Time-boxed read caches over the reference data the schedule engine
/// consumes. Key layouts:
/// - closures / overrides / bounds: the academic year id
/// - holidays: the single key "all" (holidays are year-independent)
/// - slots: "<classId>/<term>"
///
/// Every calendar or timetable write must invalidate the matching prefix.
pub struct FactCaches {
    pub closures: ReadCache<Vec<ClosureRule>>,
    pub overrides: ReadCache<Vec<SessionOverride>>,
    pub holidays: ReadCache<Vec<FixedHoliday>>,
    pub bounds: ReadCache<Option<YearBounds>>,
    pub slots: ReadCache<Vec<TimetableSlot>>,
}

impl FactCaches {
    pub fn new() -> Self {
        Self {
            closures: ReadCache::new(FACT_TTL),
            overrides: ReadCache::new(FACT_TTL),
            holidays: ReadCache::new(FACT_TTL),
            bounds: ReadCache::new(FACT_TTL),
            slots: ReadCache::new(FACT_TTL),
        }
    }
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub facts: FactCaches,
}
