use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use super::classify::{Journey, JourneyOutcome};
use super::event::RawFunnelEvent;
use crate::error::Result;
use crate::record::{CellValue, RecordBatch};

/// Funnel counts for one processing day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyFunnelReport {
    pub day: NaiveDate,
    /// Visitors (distinct anonymous ids) in the extract.
    pub journeys_seen: u64,
    /// Visitors whose events could not be turned into a journey.
    pub malformed: u64,
    /// Events without an anonymous id, which cannot be attributed to anyone.
    pub orphan_events: u64,
    /// Journeys that started on a different day.
    pub outside_cohort: u64,
    pub identity_collisions: u64,
    pub unknown_transitions: u64,
    pub unclassified: u64,
    /// Outcomes of journeys in the day's cohort.
    pub outcomes: BTreeMap<JourneyOutcome, u64>,
    /// Same, excluding journeys with an identity collision.
    pub strict_outcomes: BTreeMap<JourneyOutcome, u64>,
    /// Payment-step option chosen by converting visitors.
    pub payment_options: BTreeMap<String, u64>,
}

impl DailyFunnelReport {
    pub const NATURAL_KEY: [&'static str; 2] = ["report_day", "outcome"];
    pub const VALUE_COLUMNS: [&'static str; 2] = ["journeys", "strict_journeys"];

    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            journeys_seen: 0,
            malformed: 0,
            orphan_events: 0,
            outside_cohort: 0,
            identity_collisions: 0,
            unknown_transitions: 0,
            unclassified: 0,
            outcomes: BTreeMap::new(),
            strict_outcomes: BTreeMap::new(),
            payment_options: BTreeMap::new(),
        }
    }

    /// Add one successfully built journey.
    pub fn tally(&mut self, journey: &Journey) {
        self.journeys_seen += 1;
        if !journey.is_valid() {
            self.outside_cohort += 1;
            return;
        }
        if journey.has_identity_collision() {
            self.identity_collisions += 1;
        }
        if journey.has_unknown_transition() {
            self.unknown_transitions += 1;
        }

        let Some(outcome) = journey.result() else {
            self.unclassified += 1;
            return;
        };
        *self.outcomes.entry(outcome).or_default() += 1;
        if journey.is_strict_countable() {
            *self.strict_outcomes.entry(outcome).or_default() += 1;
        }
        if outcome.is_conversion() {
            let option = journey.payment_option().unwrap_or("none").to_string();
            *self.payment_options.entry(option).or_default() += 1;
        }
    }

    pub fn count(&self, outcome: JourneyOutcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    pub fn strict_count(&self, outcome: JourneyOutcome) -> u64 {
        self.strict_outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// One row per outcome, zeros included, keyed by `(report_day, outcome)`.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let columns = Self::NATURAL_KEY
            .iter()
            .chain(Self::VALUE_COLUMNS.iter())
            .map(|c| c.to_string())
            .collect();
        let rows = JourneyOutcome::ALL
            .iter()
            .map(|outcome| {
                vec![
                    CellValue::Date(self.day),
                    CellValue::from(outcome.as_str()),
                    CellValue::Int(count_cell(self.count(*outcome))),
                    CellValue::Int(count_cell(self.strict_count(*outcome))),
                ]
            })
            .collect();
        RecordBatch::new(columns, rows)
    }
}

fn count_cell(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Group a day's extract by visitor, classify each journey and tally the results.
///
/// A visitor whose events are malformed is logged and skipped; the rest of
/// the population is still counted.
pub fn classify_day(events: Vec<RawFunnelEvent>, day: NaiveDate) -> DailyFunnelReport {
    let mut report = DailyFunnelReport::new(day);
    let mut by_visitor: BTreeMap<String, Vec<RawFunnelEvent>> = BTreeMap::new();

    for event in events {
        let visitor = event
            .anonymous_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        match visitor {
            Some(id) => by_visitor.entry(id).or_default().push(event),
            None => report.orphan_events += 1,
        }
    }

    for (anonymous_id, events) in by_visitor {
        match Journey::build(events, day) {
            Ok(journey) => report.tally(&journey),
            Err(e) => {
                tracing::warn!(
                    target: "etl.rollup",
                    anonymous_id = %anonymous_id,
                    error = %e,
                    "skipping malformed journey"
                );
                report.journeys_seen += 1;
                report.malformed += 1;
            }
        }
    }

    tracing::info!(
        target: "etl.rollup",
        day = %day,
        journeys = report.journeys_seen,
        malformed = report.malformed,
        outside_cohort = report.outside_cohort,
        identity_collisions = report.identity_collisions,
        "funnel day classified"
    );
    report
}
