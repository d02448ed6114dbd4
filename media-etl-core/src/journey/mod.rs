//! Signup funnel journeys: event validation, per-visitor classification and
//! the daily rollup built on top of it.

mod classify;
mod event;
mod rollup;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{EtlError, Result};

pub use classify::{Journey, JourneyAnomaly, JourneyOutcome, MAX_IDENTITIES, PAYMENT_STEP};
pub use event::{parse_timestamp, FunnelEvent, RawFunnelEvent, Tier, TransitionState};
pub use rollup::{classify_day, DailyFunnelReport};

/// Parse a processing day in `YYYY-MM-DD` form.
pub fn parse_target_day(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| EtlError::Config(format!("target day must be YYYY-MM-DD, got {text:?}")))
}

/// Half-open extraction window `[start, end)` for one processing day.
///
/// Starts a day early so journeys begun yesterday are extracted and then
/// rejected as outside the cohort, instead of being mistaken for new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl ObservationWindow {
    pub fn for_day(day: NaiveDate) -> Self {
        let start = day.pred_opt().unwrap_or(day);
        let end = day.succ_opt().unwrap_or(day);
        Self {
            start: start.and_time(NaiveTime::MIN),
            end: end.and_time(NaiveTime::MIN),
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start <= ts && ts < self.end
    }
}
