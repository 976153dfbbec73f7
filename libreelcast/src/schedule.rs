//! Weekly posting timetable
//!
//! A [`ScheduleConfig`] is an immutable value describing on which weekdays and
//! at which local times uploads may go out. It only enumerates candidate
//! slots; deciding which of them are free is the job of
//! [`crate::scheduler`].

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::ScheduleSection;
use crate::error::{ConfigError, Result};

/// How far ahead slot generation searches.
pub const SCHEDULE_HORIZON_DAYS: u64 = 90;

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    /// Indexed by `Weekday::num_days_from_monday`
    weekdays: [bool; 7],
    times: Vec<NaiveTime>,
    timezone: Tz,
    one_per_day: bool,
}

impl ScheduleConfig {
    pub fn new(
        weekdays: &[Weekday],
        times: &[NaiveTime],
        timezone: Tz,
        one_per_day: bool,
    ) -> Result<Self> {
        if weekdays.is_empty() {
            return Err(ConfigError::InvalidSchedule("no weekdays selected".to_string()).into());
        }
        if times.is_empty() {
            return Err(ConfigError::InvalidSchedule("no times of day configured".to_string()).into());
        }

        let mut days = [false; 7];
        for day in weekdays {
            days[day.num_days_from_monday() as usize] = true;
        }

        let mut times = times.to_vec();
        times.sort();
        times.dedup();

        Ok(Self {
            weekdays: days,
            times,
            timezone,
            one_per_day,
        })
    }

    /// Validate the raw `[schedule]` table.
    pub fn from_section(section: &ScheduleSection) -> Result<Self> {
        let weekdays = section
            .weekdays
            .iter()
            .map(|raw| parse_weekday(raw))
            .collect::<Result<Vec<_>>>()?;

        let times = section
            .times
            .iter()
            .map(|raw| {
                NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|_| {
                    ConfigError::InvalidSchedule(format!("'{}' is not an HH:MM time", raw)).into()
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let timezone: Tz = section.timezone.trim().parse().map_err(|_| {
            ConfigError::InvalidSchedule(format!("unknown timezone '{}'", section.timezone))
        })?;

        Self::new(&weekdays, &times, timezone, section.one_per_day)
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn one_per_day(&self) -> bool {
        self.one_per_day
    }

    pub fn times(&self) -> &[NaiveTime] {
        &self.times
    }

    pub fn is_active_day(&self, day: Weekday) -> bool {
        self.weekdays[day.num_days_from_monday() as usize]
    }

    /// Calendar date of `at` in the schedule's timezone.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }

    /// All timetable slots strictly after `after`, ascending, within the
    /// search horizon.
    ///
    /// Local times that do not exist on a given day (DST gaps) are skipped;
    /// ambiguous ones resolve to the earlier instant.
    pub fn slots_after(&self, after: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let start = self.local_date(after);
        let mut slots = Vec::new();

        for offset in 0..=SCHEDULE_HORIZON_DAYS {
            let Some(date) = start.checked_add_days(Days::new(offset)) else {
                break;
            };
            if !self.is_active_day(date.weekday()) {
                continue;
            }
            for time in &self.times {
                let Some(local) = self
                    .timezone
                    .from_local_datetime(&date.and_time(*time))
                    .earliest()
                else {
                    continue;
                };
                let slot = local.with_timezone(&Utc);
                if slot > after {
                    slots.push(slot);
                }
            }
        }

        slots
    }
}

/// Accepts `mon`, `Monday` or `0`..`6` (Monday = 0).
fn parse_weekday(raw: &str) -> Result<Weekday> {
    let trimmed = raw.trim();
    if let Ok(index) = trimmed.parse::<u8>() {
        return match index {
            0 => Ok(Weekday::Mon),
            1 => Ok(Weekday::Tue),
            2 => Ok(Weekday::Wed),
            3 => Ok(Weekday::Thu),
            4 => Ok(Weekday::Fri),
            5 => Ok(Weekday::Sat),
            6 => Ok(Weekday::Sun),
            _ => Err(ConfigError::InvalidSchedule(format!("weekday index {} out of range", index)).into()),
        };
    }
    trimmed
        .parse::<Weekday>()
        .map_err(|_| ConfigError::InvalidSchedule(format!("unknown weekday '{}'", raw)).into())
}
