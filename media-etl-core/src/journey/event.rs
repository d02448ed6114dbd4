//! Signup funnel events: the raw warehouse shape and its validated form.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{EtlError, Result};

/// Membership level of a visitor when an event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Anon,
    Free,
    Trial,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anon => "anon",
            Self::Free => "free",
            Self::Trial => "trial",
            Self::Premium => "premium",
        }
    }
}

impl FromStr for Tier {
    type Err = EtlError;

    fn from_str(label: &str) -> Result<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "anon" | "anonymous" => Ok(Self::Anon),
            "free" | "registered" => Ok(Self::Free),
            "trial" => Ok(Self::Trial),
            "premium" | "paid" => Ok(Self::Premium),
            other => Err(EtlError::MalformedEvent(format!("unknown tier {other:?}"))),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an event marks entering or leaving a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionState {
    Entered,
    Exited,
    Unknown,
}

impl TransitionState {
    /// Unrecognised or missing labels map to `Unknown`; this never fails.
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
            Some("entered" | "enter" | "n") => Self::Entered,
            Some("exited" | "exit" | "x") => Self::Exited,
            _ => Self::Unknown,
        }
    }

    /// Token prefix used in journey sequences.
    pub fn prefix(&self) -> char {
        match self {
            Self::Entered => 'N',
            Self::Exited => 'X',
            Self::Unknown => 'U',
        }
    }
}

/// A funnel event as delivered by the warehouse or a JSON extract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
#[serde(default)]
pub struct RawFunnelEvent {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub event_timestamp: Option<NaiveDateTime>,
    pub user_id: Option<String>,
    pub user_tier: Option<String>,
    pub anonymous_id: Option<String>,
    pub state: Option<String>,
    pub step: Option<i32>,
    pub option_selected: Option<String>,
}

/// A validated funnel event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelEvent {
    pub timestamp: NaiveDateTime,
    pub anonymous_id: String,
    pub user_id: Option<String>,
    pub tier: Tier,
    pub state: TransitionState,
    pub step: u32,
    pub option_selected: Option<String>,
}

impl FunnelEvent {
    /// `N3`, `X1`, ...
    pub fn token(&self) -> String {
        format!("{}{}", self.state.prefix(), self.step)
    }
}

impl TryFrom<RawFunnelEvent> for FunnelEvent {
    type Error = EtlError;

    fn try_from(raw: RawFunnelEvent) -> Result<Self> {
        let anonymous_id = non_blank(raw.anonymous_id)
            .map(|id| id.trim().to_string())
            .ok_or_else(|| EtlError::MalformedEvent("missing anonymous_id".to_string()))?;
        let missing =
            |field: &str| EtlError::MalformedEvent(format!("{anonymous_id}: missing {field}"));

        let timestamp = raw.event_timestamp.ok_or_else(|| missing("event_timestamp"))?;
        let step = raw.step.ok_or_else(|| missing("step"))?;
        let step = u32::try_from(step).map_err(|_| {
            EtlError::MalformedEvent(format!("{anonymous_id}: negative step {step}"))
        })?;
        let tier = non_blank(raw.user_tier)
            .ok_or_else(|| missing("user_tier"))?
            .parse::<Tier>()?;

        Ok(Self {
            timestamp,
            user_id: non_blank(raw.user_id),
            tier,
            state: TransitionState::from_label(raw.state.as_deref()),
            step,
            option_selected: non_blank(raw.option_selected),
            anonymous_id,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Accepts `YYYY-MM-DDTHH:MM:SS[.f]`, the same with a space separator, and RFC 3339.
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| ts.naive_utc())
        })
}

fn deserialize_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let text: Option<String> = Option::deserialize(deserializer)?;
    match text {
        None => Ok(None),
        Some(t) if t.trim().is_empty() => Ok(None),
        Some(t) => parse_timestamp(&t)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid event_timestamp {t:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn raw() -> RawFunnelEvent {
        RawFunnelEvent {
            event_timestamp: parse_timestamp("2024-03-05 10:00:00"),
            user_id: None,
            user_tier: Some("anon".into()),
            anonymous_id: Some("a-1".into()),
            state: Some("entered".into()),
            step: Some(1),
            option_selected: Some("".into()),
        }
    }

    #[test]
    fn tier_labels_parse_case_insensitively() {
        assert_eq!("Anonymous".parse::<Tier>().unwrap(), Tier::Anon);
        assert_eq!("PREMIUM".parse::<Tier>().unwrap(), Tier::Premium);
        assert_eq!("registered".parse::<Tier>().unwrap(), Tier::Free);
        assert!("gold".parse::<Tier>().is_err());
    }

    #[test]
    fn unrecognised_state_is_unknown() {
        assert_eq!(TransitionState::from_label(Some("Exited")), TransitionState::Exited);
        assert_eq!(TransitionState::from_label(Some("skipped")), TransitionState::Unknown);
        assert_eq!(TransitionState::from_label(None), TransitionState::Unknown);
    }

    #[test]
    fn raw_event_validates() {
        let event = FunnelEvent::try_from(raw()).unwrap();
        assert_eq!(event.token(), "N1");
        assert_eq!(event.tier, Tier::Anon);
        assert_eq!(event.option_selected, None);
        assert_eq!(
            event.timestamp.date(),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
        );
    }

    #[test]
    fn missing_timestamp_fails() {
        let err = FunnelEvent::try_from(RawFunnelEvent {
            event_timestamp: None,
            ..raw()
        })
        .unwrap_err();
        assert!(err.to_string().contains("event_timestamp"));
    }

    #[test]
    fn missing_step_fails() {
        let err = FunnelEvent::try_from(RawFunnelEvent {
            step: None,
            ..raw()
        })
        .unwrap_err();
        assert!(err.to_string().contains("step"));
    }

    #[test]
    fn missing_tier_fails() {
        let err = FunnelEvent::try_from(RawFunnelEvent {
            user_tier: None,
            ..raw()
        })
        .unwrap_err();
        assert!(matches!(err, EtlError::MalformedEvent(_)));
    }

    #[test]
    fn json_extract_deserializes() {
        let event: RawFunnelEvent = serde_json::from_str(
            r#"{"event_timestamp": "2024-03-05T10:00:00Z", "anonymous_id": "a-1",
                "user_tier": "free", "state": "exited", "step": 2}"#,
        )
        .unwrap();
        assert_eq!(event.event_timestamp, parse_timestamp("2024-03-05 10:00:00"));
        assert_eq!(event.user_id, None);
        assert_eq!(event.step, Some(2));
    }

    #[test]
    fn bad_timestamp_text_is_a_decode_error() {
        let result: std::result::Result<RawFunnelEvent, _> =
            serde_json::from_str(r#"{"event_timestamp": "yesterday"}"#);
        assert!(result.is_err());
    }
}
