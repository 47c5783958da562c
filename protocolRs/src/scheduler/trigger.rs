//! Typed job triggers.

use std::fmt::Display;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use super::CronSpec;

/// A time span given in weeks, days, hours, minutes and seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IntervalSpec {
    /// Weeks.
    pub weeks: u32,
    /// Days.
    pub days: u32,
    /// Hours.
    pub hours: u32,
    /// Minutes.
    pub minutes: u32,
    /// Seconds.
    pub seconds: u32,
}

impl IntervalSpec {
    /// An interval of `seconds` seconds.
    pub fn from_seconds(seconds: u32) -> Self {
        IntervalSpec {
            seconds,
            ..Default::default()
        }
    }

    /// The total length of the interval.
    pub fn duration(&self) -> TimeDelta {
        TimeDelta::weeks(i64::from(self.weeks))
            + TimeDelta::days(i64::from(self.days))
            + TimeDelta::hours(i64::from(self.hours))
            + TimeDelta::minutes(i64::from(self.minutes))
            + TimeDelta::seconds(i64::from(self.seconds))
    }

    /// `true` if all parts are zero.
    pub fn is_zero(&self) -> bool {
        self.duration().is_zero()
    }
}

impl Display for IntervalSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}w {}d {}h {}m {}s",
            self.weeks, self.days, self.hours, self.minutes, self.seconds
        )
    }
}

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSpec {
    /// Fire once at the given time, then remove the job.
    Absolute {
        /// The time to fire at.
        at: DateTime<Utc>,
    },
    /// Fire whenever the cron expression matches.
    Cron(CronSpec),
    /// Fire every interval, counting from when the job was added.
    Interval(IntervalSpec),
    /// Fire on request, at most once per `min`. If `max` is given, also fire on its own once
    /// `max` passed since the last run.
    PolledInterval {
        /// Minimal time between two runs.
        min: IntervalSpec,
        /// Maximal time between two runs.
        max: Option<IntervalSpec>,
    },
}

impl TriggerSpec {
    /// `true` for polled triggers, which can be run by name.
    pub fn is_polled(&self) -> bool {
        matches!(self, TriggerSpec::PolledInterval { .. })
    }

    /// The first time a job with this trigger fires if it is added at `added`.
    ///
    /// `None` means the job only fires on request, or never.
    pub fn first_fire_time(&self, added: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TriggerSpec::Absolute { at } => Some(*at),
            TriggerSpec::Cron(cron) => cron.next_fire_time(added),
            TriggerSpec::Interval(interval) => Some(added + interval.duration()),
            TriggerSpec::PolledInterval { max, .. } => max.map(|max| added + max.duration()),
        }
    }

    /// The time a job with this trigger fires next after it was scheduled to fire at `scheduled`
    /// and actually ran at `now`. `None` means the job does not fire on its own again.
    pub fn next_fire_time(
        &self,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            TriggerSpec::Absolute { .. } => None,
            TriggerSpec::Cron(cron) => cron.next_fire_time(now.max(scheduled)),
            TriggerSpec::Interval(interval) => {
                // Stay on the original grid, but skip runs that were missed.
                let step = interval.duration();
                let mut next = scheduled + step;
                while next <= now {
                    next += step;
                }
                Some(next)
            }
            TriggerSpec::PolledInterval { max, .. } => max.map(|max| now + max.duration()),
        }
    }
}
