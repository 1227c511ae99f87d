use std::fmt;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const MIN_CYCLE_DAY: u8 = 1;
pub const MAX_CYCLE_DAY: u8 = 31;

/// Two full-size packets of headroom: the lower layer trips a quota once fewer
/// than two MTUs remain, so usage within this distance already counts as over.
pub const LIMIT_SLACK_BYTES: u64 = 2 * 1500;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("invalid cycle_day: {cycle_day}")]
    InvalidCycleDay { cycle_day: i64 },
    #[error("unknown timezone: {name}")]
    UnknownTimezone { name: String },
    #[error("duplicate policy for template: {template}")]
    DuplicateTemplate { template: NetworkTemplate },
    #[error("policy not found: {template}")]
    MissingPolicy { template: NetworkTemplate },
    #[error("uid is not an application uid: {uid}")]
    InvalidUid { uid: u32 },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCycleDay { .. }
            | Self::UnknownTimezone { .. }
            | Self::InvalidUid { .. } => "invalid_request",
            Self::DuplicateTemplate { .. } => "conflict",
            Self::MissingPolicy { .. } => "not_found",
        }
    }
}

pub fn validate_cycle_day(cycle_day: i64) -> Result<u8, DomainError> {
    if (i64::from(MIN_CYCLE_DAY)..=i64::from(MAX_CYCLE_DAY)).contains(&cycle_day) {
        Ok(cycle_day as u8)
    } else {
        Err(DomainError::InvalidCycleDay { cycle_day })
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, DomainError> {
    name.parse::<Tz>()
        .map_err(|_| DomainError::UnknownTimezone {
            name: name.to_string(),
        })
}

/// Selects the set of networks a policy applies to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkTemplate {
    Mobile { subscriber_id: String },
    Wifi { ssid: String },
}

impl NetworkTemplate {
    pub fn mobile(subscriber_id: impl Into<String>) -> Self {
        Self::Mobile {
            subscriber_id: subscriber_id.into(),
        }
    }

    pub fn wifi(ssid: impl Into<String>) -> Self {
        Self::Wifi { ssid: ssid.into() }
    }

    pub fn matches(&self, identity: &NetworkIdentity) -> bool {
        match (self, identity) {
            (
                Self::Mobile { subscriber_id },
                NetworkIdentity::Mobile {
                    subscriber_id: other,
                },
            ) => subscriber_id == other,
            (Self::Wifi { ssid }, NetworkIdentity::Wifi { ssid: other }) => ssid == other,
            _ => false,
        }
    }
}

impl fmt::Display for NetworkTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mobile { subscriber_id } => write!(f, "mobile:{subscriber_id}"),
            Self::Wifi { ssid } => write!(f, "wifi:{ssid}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkIdentity {
    Mobile { subscriber_id: String },
    Wifi { ssid: String },
}

/// A connected network as reported by connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub iface: String,
    pub identity: NetworkIdentity,
}

impl NetworkState {
    pub fn new(iface: impl Into<String>, identity: NetworkIdentity) -> Self {
        Self {
            iface: iface.into(),
            identity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    Disabled,
    Bytes(u64),
}

impl Threshold {
    pub fn bytes(self) -> Option<u64> {
        match self {
            Self::Disabled => None,
            Self::Bytes(bytes) => Some(bytes),
        }
    }

    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Bytes(_))
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Bytes(bytes) => write!(f, "{bytes}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub template: NetworkTemplate,
    pub cycle_day: u8,
    pub timezone: Tz,
    pub warning: Threshold,
    pub limit: Threshold,
    #[serde(default)]
    pub last_warning_snooze: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_limit_snooze: Option<DateTime<Utc>>,
    pub metered: bool,
    pub inferred: bool,
}

impl NetworkPolicy {
    pub fn validate(&self) -> Result<(), DomainError> {
        validate_cycle_day(i64::from(self.cycle_day))?;
        Ok(())
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_enabled()
    }

    pub fn is_over_warning(&self, used_bytes: u64) -> bool {
        self.warning
            .bytes()
            .is_some_and(|warning| used_bytes >= warning)
    }

    pub fn is_over_limit(&self, used_bytes: u64) -> bool {
        self.limit
            .bytes()
            .is_some_and(|limit| used_bytes.saturating_add(LIMIT_SLACK_BYTES) >= limit)
    }

    /// Whether the warning was snoozed at or after `cycle_start`.
    pub fn warning_snoozed(&self, cycle_start: DateTime<Utc>) -> bool {
        self.last_warning_snooze.is_some_and(|at| at >= cycle_start)
    }

    pub fn limit_snoozed(&self, cycle_start: DateTime<Utc>) -> bool {
        self.last_limit_snooze.is_some_and(|at| at >= cycle_start)
    }
}

impl fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NetworkPolicy{{template={}, cycle_day={}, timezone={}, warning={}, limit={}, metered={}, inferred={}}}",
            self.template,
            self.cycle_day,
            self.timezone.name(),
            self.warning,
            self.limit,
            self.metered,
            self.inferred
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn policy(warning: Threshold, limit: Threshold) -> NetworkPolicy {
        NetworkPolicy {
            template: NetworkTemplate::mobile("310410"),
            cycle_day: 15,
            timezone: Tz::UTC,
            warning,
            limit,
            last_warning_snooze: None,
            last_limit_snooze: None,
            metered: true,
            inferred: false,
        }
    }

    #[test]
    fn cycle_day_validation_bounds() {
        assert_eq!(validate_cycle_day(1), Ok(1));
        assert_eq!(validate_cycle_day(31), Ok(31));
        assert_eq!(
            validate_cycle_day(0),
            Err(DomainError::InvalidCycleDay { cycle_day: 0 })
        );
        assert_eq!(
            validate_cycle_day(32).unwrap_err().code(),
            "invalid_request"
        );
    }

    #[test]
    fn parses_iana_timezone_names() {
        assert_eq!(parse_timezone("US/Pacific"), Ok(chrono_tz::US::Pacific));
        assert!(matches!(
            parse_timezone("Mars/Olympus_Mons"),
            Err(DomainError::UnknownTimezone { .. })
        ));
    }

    #[test]
    fn template_matches_only_same_kind_and_id() {
        let template = NetworkTemplate::mobile("310410");
        assert!(template.matches(&NetworkIdentity::Mobile {
            subscriber_id: "310410".to_string()
        }));
        assert!(!template.matches(&NetworkIdentity::Mobile {
            subscriber_id: "310260".to_string()
        }));
        assert!(!template.matches(&NetworkIdentity::Wifi {
            ssid: "310410".to_string()
        }));
        assert_eq!(template.to_string(), "mobile:310410");
        assert_eq!(NetworkTemplate::wifi("home").to_string(), "wifi:home");
    }

    #[test]
    fn over_limit_includes_two_packet_slack() {
        let p = policy(Threshold::Bytes(1000), Threshold::Bytes(10_000));
        assert!(!p.is_over_limit(6_999));
        assert!(p.is_over_limit(7_000));
        assert!(p.is_over_warning(1000));
        assert!(!p.is_over_warning(999));

        let disabled = policy(Threshold::Disabled, Threshold::Disabled);
        assert!(!disabled.is_over_limit(u64::MAX));
        assert!(!disabled.is_over_warning(u64::MAX));
    }

    #[test]
    fn snooze_only_counts_within_current_cycle() {
        let cycle_start = Utc.with_ymd_and_hms(2007, 2, 15, 0, 0, 0).unwrap();
        let mut p = policy(Threshold::Bytes(1), Threshold::Bytes(2));
        assert!(!p.limit_snoozed(cycle_start));

        p.last_limit_snooze = Some(Utc.with_ymd_and_hms(2007, 2, 14, 0, 0, 0).unwrap());
        assert!(!p.limit_snoozed(cycle_start));

        p.last_limit_snooze = Some(cycle_start);
        assert!(p.limit_snoozed(cycle_start));

        p.last_warning_snooze = Some(Utc.with_ymd_and_hms(2007, 3, 1, 0, 0, 0).unwrap());
        assert!(p.warning_snoozed(cycle_start));
    }

    #[test]
    fn policy_round_trips_through_json() {
        let mut p = policy(Threshold::Bytes(2 * 1024 * 1024), Threshold::Disabled);
        p.timezone = chrono_tz::America::Argentina::Buenos_Aires;
        let json = serde_json::to_string(&p).unwrap();
        let back: NetworkPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
