use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::domain::NetworkPolicy;

/// Local midnights inside a DST gap move forward in these steps until they land
/// on a wall-clock time that exists.
const GAP_STEP_MINUTES: i64 = 15;
const MAX_GAP_STEPS: usize = 4 * 24;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    #[error("cycle boundary out of range: year={year} month={month}")]
    OutOfRange { year: i32, month: u32 },
}

pub fn last_cycle_boundary(
    policy: &NetworkPolicy,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CycleError> {
    last_boundary_for(policy.cycle_day, policy.timezone, now)
}

pub fn next_cycle_boundary(
    policy: &NetworkPolicy,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CycleError> {
    next_boundary_for(policy.cycle_day, policy.timezone, now)
}

/// `(start, end)` of the billing cycle containing `now`.
pub fn current_cycle_window(
    policy: &NetworkPolicy,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), CycleError> {
    Ok((
        last_cycle_boundary(policy, now)?,
        next_cycle_boundary(policy, now)?,
    ))
}

/// Most recent boundary strictly before `now`.
pub fn last_boundary_for(
    cycle_day: u8,
    timezone: Tz,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CycleError> {
    let local = now.with_timezone(&timezone);
    let (mut year, mut month) = (local.year(), local.month());
    loop {
        let candidate = boundary_in_month(year, month, cycle_day, timezone)?;
        if candidate < now {
            return Ok(candidate);
        }
        (year, month) = prev_month(year, month);
    }
}

/// Earliest boundary strictly after `now`.
pub fn next_boundary_for(
    cycle_day: u8,
    timezone: Tz,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CycleError> {
    let local = now.with_timezone(&timezone);
    let (mut year, mut month) = (local.year(), local.month());
    loop {
        let candidate = boundary_in_month(year, month, cycle_day, timezone)?;
        if candidate > now {
            return Ok(candidate);
        }
        (year, month) = next_month(year, month);
    }
}

/// Local midnight of `cycle_day` in the given month, or the last second of the
/// month when the month is shorter than `cycle_day`.
pub fn boundary_in_month(
    year: i32,
    month: u32,
    cycle_day: u8,
    timezone: Tz,
) -> Result<DateTime<Utc>, CycleError> {
    let out_of_range = || CycleError::OutOfRange { year, month };

    if let Some(date) = NaiveDate::from_ymd_opt(year, month, u32::from(cycle_day)) {
        return local_midnight(timezone, date).ok_or_else(out_of_range);
    }

    let (next_year, next_month) = next_month(year, month);
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1).ok_or_else(out_of_range)?;
    let midnight = local_midnight(timezone, first_of_next).ok_or_else(out_of_range)?;
    Ok(midnight - Duration::seconds(1))
}

fn local_midnight(timezone: Tz, date: NaiveDate) -> Option<DateTime<Utc>> {
    resolve_local(timezone, date.and_hms_opt(0, 0, 0)?)
}

fn resolve_local(timezone: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    let mut wall = naive;
    for _ in 0..MAX_GAP_STEPS {
        match timezone.from_local_datetime(&wall) {
            LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => wall = wall.checked_add_signed(Duration::minutes(GAP_STEP_MINUTES))?,
        }
    }
    None
}

fn prev_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}
