//! Calendar-aware intervals.
//!
//! An [`IntervalSpec`] is a set of independent optional fields (seconds up to
//! years). Adding it to a point in time uses calendar arithmetic: years and
//! months are applied first, clamping the day to the end of the target month,
//! then the fixed part (days and smaller) is added as an exact duration.
//!
//! ```text
//! 2024-01-31 + 1 month  = 2024-02-29
//! 2024-02-29 + 1 year   = 2025-02-28
//! 2024-03-30 + 1 day    = 2024-03-31
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: i64 = 24 * SECS_PER_HOUR;

/// Interval errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    /// Every field is absent or zero
    #[error("Interval is empty: at least one field must be non-zero")]
    Empty,

    /// Adding the interval leaves the representable date range
    #[error("Adding {interval} to {start} overflows the supported date range")]
    OutOfRange {
        /// Interval being added
        interval: IntervalSpec,
        /// Point in time it was added to
        start: DateTime<Utc>,
    },

    /// Textual interval could not be parsed
    #[error("Invalid interval '{input}': {reason}")]
    Parse {
        /// Rejected input
        input: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Structured, calendar-aware duration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntervalSpec {
    /// Seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u32>,
    /// Minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<u32>,
    /// Hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<u32>,
    /// Days
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
    /// Calendar months
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub months: Option<u32>,
    /// Calendar years
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub years: Option<u32>,
}

impl IntervalSpec {
    /// Create an empty interval (invalid until a field is set)
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seconds: None,
            minutes: None,
            hours: None,
            days: None,
            months: None,
            years: None,
        }
    }

    /// Interval of `n` seconds
    #[must_use]
    pub const fn every_seconds(n: u32) -> Self {
        Self::new().with_seconds(n)
    }

    /// Set seconds
    #[must_use]
    pub const fn with_seconds(mut self, n: u32) -> Self {
        self.seconds = Some(n);
        self
    }

    /// Set minutes
    #[must_use]
    pub const fn with_minutes(mut self, n: u32) -> Self {
        self.minutes = Some(n);
        self
    }

    /// Set hours
    #[must_use]
    pub const fn with_hours(mut self, n: u32) -> Self {
        self.hours = Some(n);
        self
    }

    /// Set days
    #[must_use]
    pub const fn with_days(mut self, n: u32) -> Self {
        self.days = Some(n);
        self
    }

    /// Set months
    #[must_use]
    pub const fn with_months(mut self, n: u32) -> Self {
        self.months = Some(n);
        self
    }

    /// Set years
    #[must_use]
    pub const fn with_years(mut self, n: u32) -> Self {
        self.years = Some(n);
        self
    }

    /// True when no field contributes any time
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.calendar_months() == 0 && self.fixed_seconds() == 0
    }

    /// Reject intervals that would never advance a schedule
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::Empty`] when every field is absent or zero
    pub fn validate(&self) -> Result<(), IntervalError> {
        if self.is_zero() {
            return Err(IntervalError::Empty);
        }
        Ok(())
    }

    /// Years and months folded into a month count
    #[must_use]
    pub fn calendar_months(&self) -> u64 {
        u64::from(self.years.unwrap_or(0)) * 12 + u64::from(self.months.unwrap_or(0))
    }

    /// Days and smaller folded into exact seconds
    #[must_use]
    pub fn fixed_seconds(&self) -> i64 {
        i64::from(self.seconds.unwrap_or(0))
            + i64::from(self.minutes.unwrap_or(0)) * SECS_PER_MINUTE
            + i64::from(self.hours.unwrap_or(0)) * SECS_PER_HOUR
            + i64::from(self.days.unwrap_or(0)) * SECS_PER_DAY
    }

    /// Add this interval to `start` with calendar semantics
    ///
    /// # Errors
    ///
    /// Returns [`IntervalError::OutOfRange`] if the result is not representable
    pub fn add_to(&self, start: DateTime<Utc>) -> Result<DateTime<Utc>, IntervalError> {
        let out_of_range = || IntervalError::OutOfRange {
            interval: *self,
            start,
        };

        let mut target = start;

        let months = self.calendar_months();
        if months > 0 {
            let months = u32::try_from(months).map_err(|_| out_of_range())?;
            target = target
                .checked_add_months(Months::new(months))
                .ok_or_else(out_of_range)?;
        }

        let fixed = TimeDelta::try_seconds(self.fixed_seconds()).ok_or_else(out_of_range)?;
        target.checked_add_signed(fixed).ok_or_else(out_of_range)
    }
}

impl fmt::Display for IntervalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            (self.years, "y"),
            (self.months, "mo"),
            (self.days, "d"),
            (self.hours, "h"),
            (self.minutes, "m"),
            (self.seconds, "s"),
        ];

        let mut wrote = false;
        for (value, unit) in parts {
            if let Some(n) = value.filter(|n| *n > 0) {
                write!(f, "{}{}", n, unit)?;
                wrote = true;
            }
        }

        if !wrote {
            write!(f, "0s")?;
        }
        Ok(())
    }
}

impl FromStr for IntervalSpec {
    type Err = IntervalError;

    /// Parse compact notation such as `90s`, `1h30m` or `1y6mo`
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| IntervalError::Parse {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(fail("empty input"));
        }

        let mut spec = IntervalSpec::new();
        let mut chars = compact.chars().peekable();

        while chars.peek().is_some() {
            let mut digits = String::new();
            while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(c);
                chars.next();
            }
            let mut unit = String::new();
            while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
                unit.push(c.to_ascii_lowercase());
                chars.next();
            }

            if digits.is_empty() {
                return Err(fail("expected a number before each unit"));
            }
            let value: u32 = digits.parse().map_err(|_| fail("number too large"))?;

            let slot = match unit.as_str() {
                "s" => &mut spec.seconds,
                "m" => &mut spec.minutes,
                "h" => &mut spec.hours,
                "d" => &mut spec.days,
                "mo" => &mut spec.months,
                "y" => &mut spec.years,
                "" => return Err(fail("missing unit")),
                _ => return Err(fail("unknown unit (expected s, m, h, d, mo, y)")),
            };
            if slot.is_some() {
                return Err(fail("unit given more than once"));
            }
            *slot = Some(value);
        }

        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_fixed_fields_add_exactly() {
        let spec = IntervalSpec::new()
            .with_days(1)
            .with_hours(2)
            .with_minutes(3)
            .with_seconds(4);
        let start = at(2024, 3, 30, 22, 0, 0);
        assert_eq!(spec.add_to(start).unwrap(), at(2024, 4, 1, 0, 3, 4));
    }

    #[test]
    fn test_month_clamps_to_month_end() {
        let monthly = IntervalSpec::new().with_months(1);
        assert_eq!(
            monthly.add_to(at(2024, 1, 31, 12, 0, 0)).unwrap(),
            at(2024, 2, 29, 12, 0, 0)
        );
        assert_eq!(
            monthly.add_to(at(2023, 1, 31, 12, 0, 0)).unwrap(),
            at(2023, 2, 28, 12, 0, 0)
        );
    }

    #[test]
    fn test_year_respects_leap_years() {
        let yearly = IntervalSpec::new().with_years(1);
        assert_eq!(
            yearly.add_to(at(2024, 2, 29, 0, 0, 0)).unwrap(),
            at(2025, 2, 28, 0, 0, 0)
        );

        let four_years = IntervalSpec::new().with_years(4);
        assert_eq!(
            four_years.add_to(at(2024, 2, 29, 0, 0, 0)).unwrap(),
            at(2028, 2, 29, 0, 0, 0)
        );
    }

    #[test]
    fn test_calendar_part_applied_before_fixed_part() {
        // Jan 31 + 1mo clamps to Feb 29, then one day lands on Mar 1.
        let spec = IntervalSpec::new().with_months(1).with_days(1);
        assert_eq!(
            spec.add_to(at(2024, 1, 31, 0, 0, 0)).unwrap(),
            at(2024, 3, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_empty_interval_rejected() {
        assert!(IntervalSpec::new().is_zero());
        assert_eq!(IntervalSpec::new().validate(), Err(IntervalError::Empty));
        assert_eq!(
            IntervalSpec::new().with_seconds(0).validate(),
            Err(IntervalError::Empty)
        );
        assert!(IntervalSpec::every_seconds(1).validate().is_ok());
    }

    #[test]
    fn test_out_of_range() {
        let spec = IntervalSpec::new().with_years(u32::MAX);
        let result = spec.add_to(at(2024, 1, 1, 0, 0, 0));
        assert!(matches!(result, Err(IntervalError::OutOfRange { .. })));
    }

    #[test]
    fn test_display() {
        assert_eq!(IntervalSpec::every_seconds(60).to_string(), "60s");
        assert_eq!(
            IntervalSpec::new().with_years(1).with_months(2).with_hours(3).to_string(),
            "1y2mo3h"
        );
        assert_eq!(IntervalSpec::new().to_string(), "0s");
    }

    #[test]
    fn test_parse() {
        let spec: IntervalSpec = "1h30m".parse().unwrap();
        assert_eq!(spec, IntervalSpec::new().with_hours(1).with_minutes(30));

        let spec: IntervalSpec = "1y 6mo".parse().unwrap();
        assert_eq!(spec, IntervalSpec::new().with_years(1).with_months(6));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!("".parse::<IntervalSpec>(), Err(IntervalError::Parse { .. })));
        assert!(matches!("10".parse::<IntervalSpec>(), Err(IntervalError::Parse { .. })));
        assert!(matches!("h".parse::<IntervalSpec>(), Err(IntervalError::Parse { .. })));
        assert!(matches!("5w".parse::<IntervalSpec>(), Err(IntervalError::Parse { .. })));
        assert!(matches!("5s5s".parse::<IntervalSpec>(), Err(IntervalError::Parse { .. })));
        assert_eq!("0s".parse::<IntervalSpec>(), Err(IntervalError::Empty));
    }

    #[test]
    fn test_deserialize_from_config_shape() {
        let spec: IntervalSpec = serde_json::from_str(r#"{"seconds": 20, "minutes": 2}"#).unwrap();
        assert_eq!(spec, IntervalSpec::new().with_seconds(20).with_minutes(2));

        let unknown = serde_json::from_str::<IntervalSpec>(r#"{"weeks": 1}"#);
        assert!(unknown.is_err());
    }

    // Property tests using proptest
    proptest::proptest! {
        #[test]
        fn prop_fixed_interval_is_exact(secs in 1u32..10_000_000, offset in 0i64..2_000_000_000) {
            let start = DateTime::<Utc>::from_timestamp(offset, 0).unwrap();
            let next = IntervalSpec::every_seconds(secs).add_to(start).unwrap();
            proptest::prop_assert_eq!((next - start).num_seconds(), i64::from(secs));
        }

        #[test]
        fn prop_non_empty_interval_moves_forward(
            months in 0u32..600,
            days in 0u32..400,
            secs in 0u32..100_000,
            offset in 0i64..2_000_000_000,
        ) {
            let spec = IntervalSpec::new().with_months(months).with_days(days).with_seconds(secs);
            proptest::prop_assume!(!spec.is_zero());
            let start = DateTime::<Utc>::from_timestamp(offset, 0).unwrap();
            proptest::prop_assert!(spec.add_to(start).unwrap() > start);
        }
    }
}
