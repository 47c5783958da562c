//! Cron expressions.
//!
//! A cron trigger has eight fields, from most to least significant: year, month, day, week, day of
//! week, hour, minute and second. Every field takes a comma separated list of terms:
//!
//! | Term    | Matches                                               |
//! |---------|-------------------------------------------------------|
//! | `*`     | every value                                           |
//! | `*/n`   | every n-th value, starting at the smallest one        |
//! | `a`     | the value `a`                                         |
//! | `a-b`   | values from `a` to `b`, both included                 |
//! | `a-b/n` | every n-th value from `a` to `b`                      |
//!
//! Days of the week count from monday (`0`) to sunday (`6`), the names `mon` to `sun` work as
//! well. Fields that are not given match everything if they are more significant than the least
//! significant given field, and their smallest value otherwise. `hour = "*/3"` thus fires at
//! minute 0, second 0 of every third hour.

use std::fmt::Display;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

use crate::InstrumentError;

/// Names of the fields, most significant first.
pub(crate) const FIELD_NAMES: [&str; 8] = [
    "year",
    "month",
    "day",
    "week",
    "day_of_week",
    "hour",
    "minute",
    "second",
];

const YEAR: usize = 0;
const MONTH: usize = 1;
const DAY: usize = 2;
const WEEK: usize = 3;
const DAY_OF_WEEK: usize = 4;
const HOUR: usize = 5;
const MINUTE: usize = 6;
const SECOND: usize = 7;

/// Smallest and largest value of each field.
const FIELD_RANGES: [(u32, u32); 8] = [
    (1970, 9999),
    (1, 12),
    (1, 31),
    (1, 53),
    (0, 6),
    (0, 23),
    (0, 59),
    (0, 59),
];

/// Value a field that is not given defaults to, once it is less significant than all given
/// fields. `None` means it matches everything.
const FIELD_DEFAULTS: [Option<u32>; 8] = [
    None,
    Some(1),
    Some(1),
    None,
    None,
    Some(0),
    Some(0),
    Some(0),
];

const WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// A single term of a cron field: every `step`-th value from `first` to `last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Term {
    first: u32,
    last: u32,
    step: u32,
}

impl Term {
    fn matches(&self, value: u32) -> bool {
        value >= self.first && value <= self.last && (value - self.first) % self.step == 0
    }
}

/// One parsed field of a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    expression: String,
    terms: Vec<Term>,
}

impl Field {
    fn parse(index: usize, expression: &str) -> Result<Self, String> {
        let (min, max) = FIELD_RANGES[index];
        let name = FIELD_NAMES[index];
        let mut terms = Vec::new();

        for term in expression.split(',').map(str::trim) {
            if term.is_empty() {
                return Err(format!("empty term in {name} expression '{expression}'"));
            }
            let (range, step) = match term.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid step '{step}' in {name} field"))?;
                    if step == 0 {
                        return Err(format!("step must not be zero in {name} field"));
                    }
                    (range.trim(), step)
                }
                None => (term, 1),
            };

            let (first, last) = if range == "*" {
                (min, max)
            } else if let Some((first, last)) = range.split_once('-') {
                (parse_value(index, first)?, parse_value(index, last)?)
            } else {
                let value = parse_value(index, range)?;
                (value, value)
            };

            if first > last {
                return Err(format!("range {first}-{last} is reversed in {name} field"));
            }
            for value in [first, last] {
                if value < min || value > max {
                    return Err(format!(
                        "value {value} out of range [{min}, {max}] in {name} field"
                    ));
                }
            }
            terms.push(Term { first, last, step });
        }

        Ok(Field {
            expression: expression.to_string(),
            terms,
        })
    }

    fn matches(&self, value: u32) -> bool {
        self.terms.iter().any(|term| term.matches(value))
    }

    fn is_wildcard(&self) -> bool {
        self.expression == "*"
    }
}

fn parse_value(index: usize, value: &str) -> Result<u32, String> {
    let value = value.trim();
    if index == DAY_OF_WEEK {
        if let Some(pos) = WEEKDAYS.iter().position(|d| value.eq_ignore_ascii_case(d)) {
            return Ok(pos as u32);
        }
    }
    value
        .parse()
        .map_err(|_| format!("invalid value '{value}' in {} field", FIELD_NAMES[index]))
}

/// A parsed cron expression. All times are in UTC.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use protocolrs::scheduler::CronSpec;
///
/// let spec = CronSpec::new(&[("hour", "*/3"), ("minute", "0")]).unwrap();
/// let after = Utc.with_ymd_and_hms(2024, 5, 1, 4, 10, 0).unwrap();
/// assert_eq!(
///     spec.next_fire_time(after),
///     Some(Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap())
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    fields: Vec<Field>,
}

impl CronSpec {
    /// Parse a cron expression from `(field name, expression)` pairs.
    ///
    /// Fails with [`InstrumentError::Config`] if a field name or expression is invalid, or if all
    /// given fields are wildcards.
    pub fn new(fields: &[(&str, &str)]) -> Result<Self, InstrumentError> {
        let mut given: [Option<&str>; 8] = [None; 8];
        for (name, expression) in fields {
            let index = FIELD_NAMES
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| InstrumentError::Config(format!("Unknown cron field '{name}'")))?;
            given[index] = Some(*expression);
        }

        let mut parsed = Vec::with_capacity(FIELD_NAMES.len());
        let mut remaining = given.iter().filter(|g| g.is_some()).count();
        for (index, expression) in given.iter().enumerate() {
            let expression = match expression {
                Some(expression) => {
                    remaining -= 1;
                    expression.to_string()
                }
                None if remaining == 0 => FIELD_DEFAULTS[index]
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "*".to_string()),
                None => "*".to_string(),
            };
            parsed.push(Field::parse(index, &expression).map_err(InstrumentError::Config)?);
        }

        let explicit_non_wildcard = given
            .iter()
            .zip(parsed.iter())
            .any(|(g, field)| g.is_some() && !field.is_wildcard());
        if !explicit_non_wildcard {
            return Err(InstrumentError::Config(
                "A cron trigger needs at least one field that is not a wildcard".to_string(),
            ));
        }

        Ok(CronSpec { fields: parsed })
    }

    /// The earliest matching time strictly after `after`, at whole seconds.
    ///
    /// Returns `None` if the expression never matches again.
    pub fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc() + chrono::Duration::seconds(1);
        let time = start.time();
        let start_time = NaiveTime::from_hms_opt(time.hour(), time.minute(), time.second())?;
        let mut date = start.date();
        let (_, max_year) = FIELD_RANGES[YEAR];

        while date.year() as u32 <= max_year {
            if !self.fields[YEAR].matches(date.year() as u32) {
                date = NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?;
                continue;
            }
            if !self.fields[MONTH].matches(date.month()) {
                date = first_of_next_month(date)?;
                continue;
            }
            if self.matches_date(date) {
                let earliest = if date == start.date() {
                    start_time
                } else {
                    NaiveTime::MIN
                };
                if let Some(time) = self.first_time_from(earliest) {
                    return Some(Utc.from_utc_datetime(&date.and_time(time)));
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        self.fields[DAY].matches(date.day())
            && self.fields[WEEK].matches(date.iso_week().week())
            && self.fields[DAY_OF_WEEK].matches(date.weekday().num_days_from_monday())
    }

    /// The earliest matching time of day at or after `earliest`.
    fn first_time_from(&self, earliest: NaiveTime) -> Option<NaiveTime> {
        let (h0, m0, s0) = (earliest.hour(), earliest.minute(), earliest.second());
        for hour in (h0..=23).filter(|h| self.fields[HOUR].matches(*h)) {
            let first_minute = if hour == h0 { m0 } else { 0 };
            for minute in (first_minute..=59).filter(|m| self.fields[MINUTE].matches(*m)) {
                let first_second = if hour == h0 && minute == m0 { s0 } else { 0 };
                if let Some(second) =
                    (first_second..=59).find(|s| self.fields[SECOND].matches(*s))
                {
                    return NaiveTime::from_hms_opt(hour, minute, second);
                }
            }
        }
        None
    }
}

impl Display for CronSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields: Vec<String> = FIELD_NAMES
            .iter()
            .zip(self.fields.iter())
            .map(|(name, field)| format!("{name}='{}'", field.expression))
            .collect();
        write!(f, "cron[{}]", fields.join(", "))
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}
