//! Per-visitor journey reconstruction and outcome classification.
//!
//! ## Classification
//!
//! The distinct tiers a visitor passed through, in order of first
//! appearance, are collapsed to a (first, last) pair. Together with whether
//! the payment step was reached this decides the outcome:
//!
//! ```text
//! anon    → free                     anon_to_free
//! anon    → premium, payment step    anon_to_premium
//! anon    → premium, no payment      premium_login
//! free    → premium                  free_to_premium
//! premium only                       non_counting_premium
//! anon only                          anon_bounce
//! free only                          free_bounce
//! anything else                      unclassified
//! ```
//!
//! Reaching premium without ever visiting the payment step means the visitor
//! logged into an account that was already paid for.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::event::{FunnelEvent, RawFunnelEvent, Tier, TransitionState};
use crate::error::{EtlError, Result};

/// Funnel step where the payment method is chosen.
pub const PAYMENT_STEP: u32 = 3;

/// More distinct identities than this in one journey suggests id reuse.
pub const MAX_IDENTITIES: usize = 2;

/// Terminal outcome of a journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyOutcome {
    AnonToFree,
    AnonToPremium,
    FreeToPremium,
    NonCountingPremium,
    PremiumLogin,
    AnonBounce,
    FreeBounce,
}

impl JourneyOutcome {
    pub const ALL: [JourneyOutcome; 7] = [
        Self::AnonToFree,
        Self::AnonToPremium,
        Self::FreeToPremium,
        Self::NonCountingPremium,
        Self::PremiumLogin,
        Self::AnonBounce,
        Self::FreeBounce,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnonToFree => "anon_to_free",
            Self::AnonToPremium => "anon_to_premium",
            Self::FreeToPremium => "free_to_premium",
            Self::NonCountingPremium => "non_counting_premium",
            Self::PremiumLogin => "premium_login",
            Self::AnonBounce => "anon_bounce",
            Self::FreeBounce => "free_bounce",
        }
    }

    /// A new paid subscription started during the journey.
    pub fn is_conversion(&self) -> bool {
        matches!(self, Self::AnonToPremium | Self::FreeToPremium)
    }
}

impl fmt::Display for JourneyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit flags. They never make a journey fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JourneyAnomaly {
    /// At least one event had an unrecognised transition state.
    UnknownTransition { events: usize },
    /// More identities than [`MAX_IDENTITIES`] were seen.
    IdentityCollision { identities: Vec<String> },
}

/// All events of one visitor, ordered by time, with derived attributes.
#[derive(Debug, Clone)]
pub struct Journey {
    anonymous_id: String,
    target_day: NaiveDate,
    events: Vec<FunnelEvent>,
    tiers: Vec<Tier>,
    days: BTreeSet<NaiveDate>,
    identities: BTreeSet<String>,
    valid: bool,
    reached_payment_step: bool,
    anomalies: Vec<JourneyAnomaly>,
    sequence: OnceLock<String>,
}

impl Journey {
    /// Validate raw events and build the journey for `target_day`.
    pub fn build<I>(events: I, target_day: NaiveDate) -> Result<Self>
    where
        I: IntoIterator<Item = RawFunnelEvent>,
    {
        let events = events
            .into_iter()
            .map(FunnelEvent::try_from)
            .collect::<Result<Vec<_>>>()?;
        Self::from_events(events, target_day)
    }

    pub fn from_events(mut events: Vec<FunnelEvent>, target_day: NaiveDate) -> Result<Self> {
        let anonymous_id = match events.first() {
            Some(event) => event.anonymous_id.clone(),
            None => {
                return Err(EtlError::MalformedEvent(
                    "a journey needs at least one event".to_string(),
                ))
            }
        };
        if let Some(other) = events.iter().find(|e| e.anonymous_id != anonymous_id) {
            return Err(EtlError::MalformedEvent(format!(
                "events for {anonymous_id} and {} mixed in one journey",
                other.anonymous_id
            )));
        }

        // Stable: events sharing a timestamp keep their extraction order.
        events.sort_by_key(|e| e.timestamp);

        let mut tiers = Vec::new();
        for event in &events {
            if !tiers.contains(&event.tier) {
                tiers.push(event.tier);
            }
        }
        let days = events.iter().map(|e| e.timestamp.date()).collect();
        let identities: BTreeSet<String> = std::iter::once(anonymous_id.clone())
            .chain(events.iter().filter_map(|e| e.user_id.clone()))
            .collect();
        let valid = events[0].timestamp.date() == target_day;
        let reached_payment_step = events.iter().any(|e| e.step == PAYMENT_STEP);

        let mut anomalies = Vec::new();
        let unknown = events
            .iter()
            .filter(|e| e.state == TransitionState::Unknown)
            .count();
        if unknown > 0 {
            anomalies.push(JourneyAnomaly::UnknownTransition { events: unknown });
        }
        if identities.len() > MAX_IDENTITIES {
            anomalies.push(JourneyAnomaly::IdentityCollision {
                identities: identities.iter().cloned().collect(),
            });
        }
        for anomaly in &anomalies {
            tracing::warn!(
                target: "etl.journey",
                anonymous_id = %anonymous_id,
                anomaly = ?anomaly,
                "journey flagged for audit"
            );
        }

        Ok(Self {
            anonymous_id,
            target_day,
            events,
            tiers,
            days,
            identities,
            valid,
            reached_payment_step,
            anomalies,
            sequence: OnceLock::new(),
        })
    }

    pub fn anonymous_id(&self) -> &str {
        &self.anonymous_id
    }

    pub fn target_day(&self) -> NaiveDate {
        self.target_day
    }

    pub fn events(&self) -> &[FunnelEvent] {
        &self.events
    }

    /// Dash-joined state/step tokens in chronological order, e.g. `N1-X1-N2`.
    pub fn sequence(&self) -> &str {
        self.sequence.get_or_init(|| {
            self.events
                .iter()
                .map(FunnelEvent::token)
                .collect::<Vec<_>>()
                .join("-")
        })
    }

    /// Distinct tiers in order of first appearance.
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn days(&self) -> &BTreeSet<NaiveDate> {
        &self.days
    }

    /// The anonymous id plus every authenticated user id seen.
    pub fn identities(&self) -> &BTreeSet<String> {
        &self.identities
    }

    /// The journey started on the target day.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn reached_payment_step(&self) -> bool {
        self.reached_payment_step
    }

    pub fn anomalies(&self) -> &[JourneyAnomaly] {
        &self.anomalies
    }

    pub fn has_identity_collision(&self) -> bool {
        self.anomalies
            .iter()
            .any(|a| matches!(a, JourneyAnomaly::IdentityCollision { .. }))
    }

    pub fn has_unknown_transition(&self) -> bool {
        self.anomalies
            .iter()
            .any(|a| matches!(a, JourneyAnomaly::UnknownTransition { .. }))
    }

    /// Counts toward strict funnel-rate denominators.
    pub fn is_strict_countable(&self) -> bool {
        self.valid && !self.has_identity_collision()
    }

    pub fn result(&self) -> Option<JourneyOutcome> {
        classify(&self.tiers, self.reached_payment_step)
    }

    /// Seconds between the first and the last event.
    pub fn duration_seconds(&self) -> i64 {
        match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => (last.timestamp - first.timestamp).num_seconds(),
            _ => 0,
        }
    }

    /// Per step, seconds from its first entry to its last exit.
    pub fn step_timings(&self) -> BTreeMap<u32, i64> {
        let mut entered = BTreeMap::new();
        let mut exited = BTreeMap::new();
        for event in &self.events {
            match event.state {
                TransitionState::Entered => {
                    entered.entry(event.step).or_insert(event.timestamp);
                }
                TransitionState::Exited => {
                    exited.insert(event.step, event.timestamp);
                }
                TransitionState::Unknown => {}
            }
        }
        entered
            .into_iter()
            .filter_map(|(step, start)| {
                let end = exited.get(&step)?;
                (*end >= start).then(|| (step, (*end - start).num_seconds()))
            })
            .collect()
    }

    /// Last option chosen on the payment step, e.g. the payment method.
    pub fn payment_option(&self) -> Option<&str> {
        self.events
            .iter()
            .rev()
            .filter(|e| e.step == PAYMENT_STEP)
            .find_map(|e| e.option_selected.as_deref())
    }
}

fn classify(tiers: &[Tier], reached_payment_step: bool) -> Option<JourneyOutcome> {
    use JourneyOutcome::*;

    match tiers {
        [Tier::Premium] => Some(NonCountingPremium),
        [Tier::Anon] => Some(AnonBounce),
        [Tier::Free] => Some(FreeBounce),
        [first, .., last] => match (first, last) {
            (Tier::Anon, Tier::Free) => Some(AnonToFree),
            (Tier::Anon, Tier::Premium) if reached_payment_step => Some(AnonToPremium),
            (Tier::Anon, Tier::Premium) => Some(PremiumLogin),
            (Tier::Free, Tier::Premium) => Some(FreeToPremium),
            _ => None,
        },
        _ => None,
    }
}
