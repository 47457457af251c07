//! Sleep schedule evaluation
//!
//! Turns a `KronosAppSpec` and a reference instant into a decision: is this
//! a holiday, should the workloads be asleep, and how long until the
//! decision needs to be re-evaluated. Pure computation, no cluster access.
//!
//! The sleep window is anchored to the current calendar day in the app's
//! timezone. Windows that cross midnight (e.g. 20:00 → 08:00) are shifted by
//! a day so that `[start, end)` is a single interval that contains "now"
//! whenever "now" is inside the window.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::crd::KronosAppSpec;
use crate::Error;

/// Timezone used when a KronosApp does not set one
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::UTC;

// =============================================================================
// Parsing
// =============================================================================

/// Resolve an IANA timezone name, defaulting to UTC when unset or empty
pub fn parse_timezone(name: Option<&str>) -> Result<Tz, Error> {
    match name.map(str::trim) {
        None | Some("") => Ok(DEFAULT_TIMEZONE),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| Error::InvalidTimezone(name.to_string())),
    }
}

/// Parse a `HH:MM` wall-clock time
pub fn parse_time_of_day(literal: &str) -> Result<NaiveTime, Error> {
    NaiveTime::parse_from_str(literal.trim(), "%H:%M")
        .map_err(|_| Error::InvalidTimeOfDay(literal.to_string()))
}

/// Parse a holiday date notation into calendar dates
///
/// Accepts `YYYY-MM-DD` followed by any number of `/DD` days in the same
/// month: `2025-12-24/25/26` yields three dates.
pub fn parse_holiday_dates(name: &str, notation: &str) -> Result<Vec<NaiveDate>, Error> {
    let invalid = || Error::InvalidHolidayFormat {
        holiday: name.to_string(),
        date: notation.to_string(),
    };

    let mut parts = notation.trim().splitn(3, '-');
    let (Some(year), Some(month), Some(days)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };

    days.split('/')
        .map(|day| {
            NaiveDate::parse_from_str(&format!("{}-{}-{}", year, month, day.trim()), "%Y-%m-%d")
                .map_err(|_| invalid())
        })
        .collect()
}

/// Set of weekdays a sleep window applies to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    /// Every day of the week
    pub fn all() -> Self {
        Self(0b111_1111)
    }

    /// No days at all
    pub fn empty() -> Self {
        Self(0)
    }

    /// Add a day by ISO number (1 = Monday … 7 = Sunday)
    fn insert_number(&mut self, day: u8) {
        self.0 |= 1 << (day - 1);
    }

    /// Whether `day` is in the set
    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    /// Whether the set matches no day
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Parse a weekday expression
///
/// Grammar: `*`, or a comma-separated list of days (`1`..`7`, Monday first)
/// and inclusive ranges (`1-5`). An empty expression is an empty set; a
/// reversed range contributes no days.
pub fn parse_weekdays(expr: &str) -> Result<WeekdaySet, Error> {
    let expr = expr.trim();
    if expr == "*" {
        return Ok(WeekdaySet::all());
    }

    let mut set = WeekdaySet::empty();
    if expr.is_empty() {
        return Ok(set);
    }

    let invalid = || Error::InvalidWeekdayFormat(expr.to_string());
    for item in expr.split(',') {
        match item.split_once('-') {
            Some((first, last)) => {
                let first = parse_day(first).ok_or_else(invalid)?;
                let last = parse_day(last).ok_or_else(invalid)?;
                for day in first..=last {
                    set.insert_number(day);
                }
            }
            None => set.insert_number(parse_day(item).ok_or_else(invalid)?),
        }
    }
    Ok(set)
}

fn parse_day(literal: &str) -> Option<u8> {
    literal
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|day| (1..=7).contains(day))
}

// =============================================================================
// Evaluated schedule
// =============================================================================

/// Outcome of evaluating a schedule at one instant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Evaluation {
    /// "Now" falls on a holiday
    pub is_holiday: bool,
    /// Workloads should be asleep according to holidays, weekdays and window
    pub should_sleep: bool,
    /// Time until the day after the current holiday run (zero outside holidays)
    pub holiday_backlog: Duration,
}

/// A schedule resolved against a reference instant
///
/// Lives for a single reconcile and is never persisted.
#[derive(Clone, Debug)]
pub struct SleepSchedule {
    now: DateTime<Tz>,
    start: DateTime<Tz>,
    end: DateTime<Tz>,
    weekdays: WeekdaySet,
    timezone: Tz,
    holidays: Vec<(String, Vec<NaiveDate>)>,
}

impl SleepSchedule {
    /// Resolve `spec` against `now`
    pub fn new(spec: &KronosAppSpec, now: DateTime<Utc>) -> Result<Self, Error> {
        let timezone = parse_timezone(spec.timezone.as_deref())?;

        let mut holidays: Vec<(String, Vec<NaiveDate>)> = Vec::new();
        for holiday in &spec.holidays {
            let dates = parse_holiday_dates(&holiday.name, &holiday.date)?;
            match holidays.iter_mut().find(|(name, _)| *name == holiday.name) {
                Some((_, existing)) => existing.extend(dates),
                None => holidays.push((holiday.name.clone(), dates)),
            }
        }

        let weekdays = parse_weekdays(&spec.weekdays)?;
        let start_time = parse_time_of_day(&spec.start_sleep)?;
        let end_time = parse_time_of_day(&spec.end_sleep)?;

        let now = now.with_timezone(&timezone);
        let today = now.date_naive();
        let mut start = local_instant(timezone, today, start_time);
        let mut end = local_instant(timezone, today, end_time);

        let day = TimeDelta::hours(24);
        if end < start && now > end {
            end = end + day;
        } else if end < start && now < end {
            start = start - day;
        }

        Ok(Self {
            now,
            start,
            end,
            weekdays,
            timezone,
            holidays,
        })
    }

    /// Reference instant in the schedule's timezone
    pub fn now(&self) -> DateTime<Tz> {
        self.now
    }

    /// Anchored start of the sleep window
    pub fn start(&self) -> DateTime<Tz> {
        self.start
    }

    /// Anchored end of the sleep window
    pub fn end(&self) -> DateTime<Tz> {
        self.end
    }

    /// Resolved timezone
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Resolved weekday set
    pub fn weekdays(&self) -> WeekdaySet {
        self.weekdays
    }

    /// Resolved holidays, grouped by name in declaration order
    pub fn holidays(&self) -> &[(String, Vec<NaiveDate>)] {
        &self.holidays
    }

    /// Decide whether workloads should sleep right now
    ///
    /// Holidays force sleep. Outside holidays, sleep happens only on an
    /// included weekday while "now" is in `[start, end)`.
    pub fn evaluate(&self) -> Evaluation {
        if let Some(holiday_backlog) = self.holiday_backlog() {
            return Evaluation {
                is_holiday: true,
                should_sleep: true,
                holiday_backlog,
            };
        }

        Evaluation {
            is_holiday: false,
            should_sleep: self.weekdays.contains(self.now.weekday()) && self.in_window(),
            holiday_backlog: Duration::ZERO,
        }
    }

    /// Name of the holiday "now" falls on, if any
    pub fn current_holiday(&self) -> Option<&str> {
        let today = self.now.date_naive();
        self.holidays
            .iter()
            .find(|(_, dates)| dates.contains(&today))
            .map(|(name, _)| name.as_str())
    }

    /// Time from "now" until the day after the holiday run containing today
    ///
    /// Holiday dates from every name are merged, so back-to-back holidays
    /// with different names form one run. `None` when today is not a holiday.
    pub fn holiday_backlog(&self) -> Option<Duration> {
        self.current_holiday()?;
        let today = self.now.date_naive();

        let mut dates: Vec<NaiveDate> = self
            .holidays
            .iter()
            .flat_map(|(_, dates)| dates.iter().copied())
            .collect();
        dates.sort_unstable();
        dates.dedup();

        let mut last = today;
        for date in dates.into_iter().filter(|date| *date > today) {
            if last.succ_opt() != Some(date) {
                break;
            }
            last = date;
        }

        let resume_day = last.succ_opt().unwrap_or(last);
        let resume = local_instant(self.timezone, resume_day, NaiveTime::MIN);
        Some(to_std(resume - self.now))
    }

    /// Whether "now" is inside `[start, end)`
    pub fn in_window(&self) -> bool {
        self.now >= self.start && self.now < self.end
    }

    /// Delay until the sleep window next opens or closes
    ///
    /// Only meaningful outside holidays; holiday runs use `holiday_backlog`.
    pub fn next_requeue_delay(&self) -> Duration {
        let next = if self.now < self.start {
            self.start
        } else if self.in_window() {
            self.end
        } else {
            self.start + TimeDelta::hours(24)
        };
        to_std(next - self.now)
    }
}

/// Instant of `time` on `date` in `tz`
///
/// Ambiguous local times (DST fall-back) take the earlier instant. Times
/// inside a DST gap move forward to the first valid wall-clock hour.
fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    let naive = date.and_time(time);
    (0..=3)
        .find_map(|hours| {
            tz.from_local_datetime(&(naive + TimeDelta::hours(hours)))
                .earliest()
        })
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive).with_timezone(&tz))
}

fn to_std(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

/// Render a duration as `{hours}h{minutes}m` for logs
pub fn format_duration(d: Duration) -> String {
    let minutes = d.as_secs() / 60;
    format!("{}h{:02}m", minutes / 60, minutes % 60)
}

// =============================================================================
// Tests
// =============================================================================
