//! Untyped job configuration, as it is written in a configuration file.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::{CronSpec, IntervalSpec, TriggerSpec, cron::FIELD_NAMES};
use crate::{Callback, InstrumentError};

/// A cron field value: either a plain number or an expression such as `"*/5"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CronValue {
    /// A single value.
    Number(u32),
    /// An expression.
    Expr(String),
}

impl From<&str> for CronValue {
    fn from(value: &str) -> Self {
        CronValue::Expr(value.to_string())
    }
}

impl From<u32> for CronValue {
    fn from(value: u32) -> Self {
        CronValue::Number(value)
    }
}

impl fmt::Display for CronValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronValue::Number(value) => write!(f, "{value}"),
            CronValue::Expr(expr) => write!(f, "{expr}"),
        }
    }
}

/// The trigger of a job as given in a configuration.
///
/// Which fields are used depends on `type`:
///
/// | `type`       | Fields                                                  |
/// |--------------|---------------------------------------------------------|
/// | `"absolute"` | `date`                                                  |
/// | `"cron"`     | `year`, `month`, `day`, `week`, `day_of_week`, `hour`, `minute`, `second` |
/// | `"interval"` | `weeks`, `days`, `hours`, `minutes`, `seconds`          |
/// | `"polled"`   | `minimum_interval`, optionally `maximum_interval`       |
///
/// The configuration is only checked by [`TriggerConfig::validate`], which the scheduler calls
/// when jobs are added.
///
/// # Example
///
/// ```
/// use protocolrs::TriggerConfig;
///
/// let config: TriggerConfig = toml::from_str(
///     r#"
///     type = "polled"
///     minimum_interval = { seconds = 5 }
///     "#,
/// )
/// .unwrap();
/// assert!(config.validate("status").unwrap().is_polled());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// One of `absolute`, `cron`, `interval` or `polled`.
    #[serde(rename = "type")]
    pub trigger_type: Option<String>,
    /// Time of an absolute trigger.
    pub date: Option<DateTime<Utc>>,
    /// Cron year.
    pub year: Option<CronValue>,
    /// Cron month.
    pub month: Option<CronValue>,
    /// Cron day of the month.
    pub day: Option<CronValue>,
    /// Cron ISO week.
    pub week: Option<CronValue>,
    /// Cron day of the week.
    pub day_of_week: Option<CronValue>,
    /// Cron hour.
    pub hour: Option<CronValue>,
    /// Cron minute.
    pub minute: Option<CronValue>,
    /// Cron second.
    pub second: Option<CronValue>,
    /// Interval weeks.
    pub weeks: Option<u32>,
    /// Interval days.
    pub days: Option<u32>,
    /// Interval hours.
    pub hours: Option<u32>,
    /// Interval minutes.
    pub minutes: Option<u32>,
    /// Interval seconds.
    pub seconds: Option<u32>,
    /// Polled: minimal time between runs.
    pub minimum_interval: Option<IntervalSpec>,
    /// Polled: maximal time between runs.
    pub maximum_interval: Option<IntervalSpec>,
}

impl TriggerConfig {
    /// An absolute trigger at `date`.
    pub fn absolute(date: DateTime<Utc>) -> Self {
        TriggerConfig {
            trigger_type: Some("absolute".to_string()),
            date: Some(date),
            ..Default::default()
        }
    }

    /// An interval trigger.
    pub fn interval(interval: IntervalSpec) -> Self {
        TriggerConfig {
            trigger_type: Some("interval".to_string()),
            weeks: Some(interval.weeks),
            days: Some(interval.days),
            hours: Some(interval.hours),
            minutes: Some(interval.minutes),
            seconds: Some(interval.seconds),
            ..Default::default()
        }
    }

    /// A polled trigger.
    pub fn polled(minimum: IntervalSpec, maximum: Option<IntervalSpec>) -> Self {
        TriggerConfig {
            trigger_type: Some("polled".to_string()),
            minimum_interval: Some(minimum),
            maximum_interval: maximum,
            ..Default::default()
        }
    }

    /// A cron trigger from `(field name, value)` pairs.
    ///
    /// Unknown field names are kept and reported by [`TriggerConfig::validate`].
    pub fn cron(fields: &[(&str, CronValue)]) -> Self {
        let mut config = TriggerConfig {
            trigger_type: Some("cron".to_string()),
            ..Default::default()
        };
        for (name, value) in fields {
            match config.cron_field_mut(name) {
                Some(field) => *field = Some(value.clone()),
                // Stored as an invalid type, such that validation fails with a useful message.
                None => {
                    config.trigger_type = Some(format!("cron with unknown field '{name}'"));
                }
            }
        }
        config
    }

    /// Check the configuration and turn it into a typed trigger.
    ///
    /// Fails with [`InstrumentError::Config`] naming `job_name` if the type is missing or
    /// unknown, or if the fields for the type are missing or malformed.
    pub fn validate(&self, job_name: &str) -> Result<TriggerSpec, InstrumentError> {
        let config_error =
            |msg: String| InstrumentError::Config(format!("Job '{job_name}': {msg}"));

        let trigger_type = self
            .trigger_type
            .as_deref()
            .ok_or_else(|| config_error("missing trigger type".to_string()))?;

        match trigger_type {
            "absolute" => {
                let at = self
                    .date
                    .ok_or_else(|| config_error("absolute trigger needs a date".to_string()))?;
                Ok(TriggerSpec::Absolute { at })
            }
            "cron" => {
                let values: Vec<(&str, String)> = FIELD_NAMES
                    .iter()
                    .zip(self.cron_fields())
                    .filter_map(|(name, value)| value.map(|v| (*name, v.to_string())))
                    .collect();
                let fields: Vec<(&str, &str)> = values
                    .iter()
                    .map(|(name, value)| (*name, value.as_str()))
                    .collect();
                let cron = CronSpec::new(&fields).map_err(|e| match e {
                    InstrumentError::Config(msg) => config_error(msg),
                    other => other,
                })?;
                Ok(TriggerSpec::Cron(cron))
            }
            "interval" => {
                let interval = IntervalSpec {
                    weeks: self.weeks.unwrap_or_default(),
                    days: self.days.unwrap_or_default(),
                    hours: self.hours.unwrap_or_default(),
                    minutes: self.minutes.unwrap_or_default(),
                    seconds: self.seconds.unwrap_or_default(),
                };
                if interval.is_zero() {
                    return Err(config_error("interval must not be zero".to_string()));
                }
                Ok(TriggerSpec::Interval(interval))
            }
            "polled" => {
                let min = self.minimum_interval.ok_or_else(|| {
                    config_error("polled trigger needs a minimum_interval".to_string())
                })?;
                if min.is_zero() {
                    return Err(config_error(
                        "minimum_interval must not be zero".to_string(),
                    ));
                }
                if let Some(max) = self.maximum_interval {
                    if max.duration() < min.duration() {
                        return Err(config_error(format!(
                            "maximum_interval ({max}) is shorter than minimum_interval ({min})"
                        )));
                    }
                }
                Ok(TriggerSpec::PolledInterval {
                    min,
                    max: self.maximum_interval,
                })
            }
            other => Err(config_error(format!("unknown trigger type '{other}'"))),
        }
    }

    fn cron_fields(&self) -> [Option<&CronValue>; 8] {
        [
            self.year.as_ref(),
            self.month.as_ref(),
            self.day.as_ref(),
            self.week.as_ref(),
            self.day_of_week.as_ref(),
            self.hour.as_ref(),
            self.minute.as_ref(),
            self.second.as_ref(),
        ]
    }

    fn cron_field_mut(&mut self, name: &str) -> Option<&mut Option<CronValue>> {
        match name {
            "year" => Some(&mut self.year),
            "month" => Some(&mut self.month),
            "day" => Some(&mut self.day),
            "week" => Some(&mut self.week),
            "day_of_week" => Some(&mut self.day_of_week),
            "hour" => Some(&mut self.hour),
            "minute" => Some(&mut self.minute),
            "second" => Some(&mut self.second),
            _ => None,
        }
    }
}

/// A job to add to the scheduler: its trigger and what to invoke when it fires.
#[derive(Clone)]
pub struct JobConfig {
    /// When the job fires.
    pub trigger: TriggerConfig,
    /// What the job does.
    pub callback: Arc<dyn Callback>,
}

impl JobConfig {
    /// Create a job.
    pub fn new(trigger: TriggerConfig, callback: Arc<dyn Callback>) -> Self {
        JobConfig { trigger, callback }
    }
}

impl fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConfig")
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}
