use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::domain::{NetworkPolicy, NetworkTemplate, Threshold, validate_cycle_day};

/// Field value asking for the platform default.
pub const DATA_CYCLE_USE_PLATFORM_DEFAULT: i64 = -1;
/// Threshold value turning the warning or limit off.
pub const DATA_CYCLE_THRESHOLD_DISABLED: i64 = -2;

const MB_IN_BYTES: u64 = 1024 * 1024;

/// Per-subscription values pushed by the carrier. Absent fields mean
/// "use the platform default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierConfig {
    #[serde(default)]
    pub monthly_data_cycle_day: Option<i64>,
    #[serde(default)]
    pub data_warning_threshold_bytes: Option<i64>,
    #[serde(default)]
    pub data_limit_threshold_bytes: Option<i64>,
}

impl CarrierConfig {
    pub fn new(cycle_day: i64, warning_bytes: i64, limit_bytes: i64) -> Self {
        Self {
            monthly_data_cycle_day: Some(cycle_day),
            data_warning_threshold_bytes: Some(warning_bytes),
            data_limit_threshold_bytes: Some(limit_bytes),
        }
    }

    pub fn platform_defaults() -> Self {
        Self::new(
            DATA_CYCLE_USE_PLATFORM_DEFAULT,
            DATA_CYCLE_USE_PLATFORM_DEFAULT,
            DATA_CYCLE_USE_PLATFORM_DEFAULT,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformDefaults {
    pub warning: Threshold,
    pub limit: Threshold,
    pub timezone: Tz,
}

impl PlatformDefaults {
    pub fn from_megabytes(warning_mb: Option<u64>, limit_mb: Option<u64>, timezone: Tz) -> Self {
        let to_threshold = |mb: Option<u64>| match mb {
            Some(mb) => Threshold::Bytes(mb.saturating_mul(MB_IN_BYTES)),
            None => Threshold::Disabled,
        };
        Self {
            warning: to_threshold(warning_mb),
            limit: to_threshold(limit_mb),
            timezone,
        }
    }
}

impl Default for PlatformDefaults {
    fn default() -> Self {
        Self::from_megabytes(Some(2048), None, Tz::UTC)
    }
}

pub fn cycle_day_from_carrier_config(config: Option<&CarrierConfig>, fallback: u8) -> u8 {
    let Some(raw) = config.and_then(|c| c.monthly_data_cycle_day) else {
        return fallback;
    };
    validate_cycle_day(raw).unwrap_or(fallback)
}

pub fn warning_threshold_from_carrier_config(
    config: Option<&CarrierConfig>,
    fallback: Threshold,
    defaults: &PlatformDefaults,
) -> Threshold {
    threshold_from_carrier_config(
        config.map(|c| c.data_warning_threshold_bytes),
        fallback,
        defaults.warning,
    )
}

pub fn limit_threshold_from_carrier_config(
    config: Option<&CarrierConfig>,
    fallback: Threshold,
    defaults: &PlatformDefaults,
) -> Threshold {
    threshold_from_carrier_config(
        config.map(|c| c.data_limit_threshold_bytes),
        fallback,
        defaults.limit,
    )
}

fn threshold_from_carrier_config(
    field: Option<Option<i64>>,
    fallback: Threshold,
    platform_default: Threshold,
) -> Threshold {
    match field.flatten() {
        None | Some(DATA_CYCLE_USE_PLATFORM_DEFAULT) => platform_default,
        Some(DATA_CYCLE_THRESHOLD_DISABLED) => Threshold::Disabled,
        Some(bytes) if bytes >= 0 => Threshold::Bytes(bytes as u64),
        Some(_) => fallback,
    }
}

/// Applies a carrier config to an inferred policy. User-edited policies are
/// never touched. Returns the updated policy only when something changed.
pub fn reconcile_policy(
    policy: &NetworkPolicy,
    config: Option<&CarrierConfig>,
    defaults: &PlatformDefaults,
) -> Option<NetworkPolicy> {
    if !policy.inferred {
        return None;
    }

    let updated = NetworkPolicy {
        cycle_day: cycle_day_from_carrier_config(config, policy.cycle_day),
        warning: warning_threshold_from_carrier_config(config, policy.warning, defaults),
        limit: limit_threshold_from_carrier_config(config, policy.limit, defaults),
        ..policy.clone()
    };

    (updated != *policy).then_some(updated)
}

pub fn build_default_mobile_policy(
    subscriber_id: &str,
    now: DateTime<Utc>,
    defaults: &PlatformDefaults,
) -> NetworkPolicy {
    let today = now.with_timezone(&defaults.timezone).day();
    NetworkPolicy {
        template: NetworkTemplate::mobile(subscriber_id),
        cycle_day: today as u8,
        timezone: defaults.timezone,
        warning: defaults.warning,
        limit: defaults.limit,
        last_warning_snooze: None,
        last_limit_snooze: None,
        metered: true,
        inferred: true,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    const FALLBACK_DAY: u8 = 7;

    fn inferred(cycle_day: u8, warning: Threshold, limit: Threshold) -> NetworkPolicy {
        NetworkPolicy {
            template: NetworkTemplate::mobile("310210"),
            cycle_day,
            timezone: Tz::UTC,
            warning,
            limit,
            last_warning_snooze: None,
            last_limit_snooze: None,
            metered: true,
            inferred: true,
        }
    }

    #[test]
    fn cycle_day_uses_fallback_for_anything_but_a_calendar_day() {
        assert_eq!(cycle_day_from_carrier_config(None, FALLBACK_DAY), FALLBACK_DAY);

        for bad in [DATA_CYCLE_USE_PLATFORM_DEFAULT, DATA_CYCLE_THRESHOLD_DISABLED, 0, 32, -100] {
            let config = CarrierConfig::new(bad, 0, 0);
            assert_eq!(
                cycle_day_from_carrier_config(Some(&config), FALLBACK_DAY),
                FALLBACK_DAY,
                "cycle day {bad}"
            );
        }

        for day in 1..=31 {
            let config = CarrierConfig::new(day, 0, 0);
            assert_eq!(
                cycle_day_from_carrier_config(Some(&config), FALLBACK_DAY),
                day as u8
            );
        }
    }

    #[test]
    fn thresholds_resolve_sentinels_and_invalid_values() {
        let defaults = PlatformDefaults::from_megabytes(Some(2048), Some(4096), Tz::UTC);
        let fallback = Threshold::Bytes(77);

        assert_eq!(
            warning_threshold_from_carrier_config(None, fallback, &defaults),
            defaults.warning
        );
        assert_eq!(
            limit_threshold_from_carrier_config(None, fallback, &defaults),
            defaults.limit
        );

        let cases = [
            (DATA_CYCLE_USE_PLATFORM_DEFAULT, defaults.warning),
            (DATA_CYCLE_THRESHOLD_DISABLED, Threshold::Disabled),
            (0, Threshold::Bytes(0)),
            (9999, Threshold::Bytes(9999)),
            (-100, fallback),
        ];
        for (raw, expected) in cases {
            let config = CarrierConfig::new(1, raw, raw);
            assert_eq!(
                warning_threshold_from_carrier_config(Some(&config), fallback, &defaults),
                expected,
                "warning {raw}"
            );
        }

        let absent = CarrierConfig::default();
        assert_eq!(
            limit_threshold_from_carrier_config(Some(&absent), fallback, &defaults),
            defaults.limit
        );
    }

    #[test]
    fn user_edited_policy_is_sticky() {
        let defaults = PlatformDefaults::default();
        let mut policy = inferred(31, Threshold::Bytes(1), Threshold::Bytes(2));
        policy.inferred = false;

        assert_eq!(
            reconcile_policy(&policy, Some(&CarrierConfig::new(5, 9999, 9999)), &defaults),
            None
        );
        assert_eq!(
            reconcile_policy(&policy, Some(&CarrierConfig::new(-100, -100, -100)), &defaults),
            None
        );
        assert_eq!(reconcile_policy(&policy, None, &defaults), None);
    }

    #[test]
    fn inferred_policy_follows_carrier_and_stays_inferred() {
        let defaults = PlatformDefaults::default();
        let start = inferred(31, defaults.warning, defaults.limit);

        let updated =
            reconcile_policy(&start, Some(&CarrierConfig::new(31, 9999, 9999)), &defaults).unwrap();
        assert_eq!(
            updated,
            inferred(31, Threshold::Bytes(9999), Threshold::Bytes(9999))
        );

        let disabled = reconcile_policy(
            &updated,
            Some(&CarrierConfig::new(
                31,
                DATA_CYCLE_THRESHOLD_DISABLED,
                DATA_CYCLE_THRESHOLD_DISABLED,
            )),
            &defaults,
        )
        .unwrap();
        assert_eq!(
            disabled,
            inferred(31, Threshold::Disabled, Threshold::Disabled)
        );

        let reverted =
            reconcile_policy(&disabled, Some(&CarrierConfig::platform_defaults()), &defaults)
                .unwrap();
        assert_eq!(reverted, start);
        assert!(reverted.inferred);
    }

    #[test]
    fn invalid_fields_keep_current_values() {
        let defaults = PlatformDefaults::default();
        let policy = inferred(12, Threshold::Bytes(9999), Threshold::Bytes(8888));
        assert_eq!(
            reconcile_policy(&policy, Some(&CarrierConfig::new(-100, -100, -100)), &defaults),
            None
        );

        let partial = CarrierConfig {
            monthly_data_cycle_day: Some(40),
            data_warning_threshold_bytes: Some(-7),
            data_limit_threshold_bytes: Some(1234),
        };
        assert_eq!(
            reconcile_policy(&policy, Some(&partial), &defaults).unwrap(),
            inferred(12, Threshold::Bytes(9999), Threshold::Bytes(1234))
        );
    }

    #[test]
    fn default_mobile_policy_uses_today_in_default_timezone() {
        let defaults = PlatformDefaults::from_megabytes(Some(2048), None, chrono_tz::US::Pacific);
        let now = Utc.with_ymd_and_hms(2013, 1, 14, 5, 0, 0).unwrap();

        let policy = build_default_mobile_policy("310210", now, &defaults);
        assert_eq!(policy.cycle_day, 13);
        assert_eq!(policy.template, NetworkTemplate::mobile("310210"));
        assert_eq!(policy.warning, Threshold::Bytes(2048 * 1024 * 1024));
        assert_eq!(policy.limit, Threshold::Disabled);
        assert!(policy.metered);
        assert!(policy.inferred);
    }
}
