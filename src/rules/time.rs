use anyhow::Result;
use chrono::{Datelike, Timelike, Utc, Weekday};

use super::{Context, Rule, RuleResult};

/// A recurring window: a set of weekdays plus a [start, end) interval of
/// minutes since midnight. Windows never wrap across midnight; a
/// configuration that needs wraparound supplies two windows.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    pub days: Vec<Weekday>,
    pub start_min: u32,
    pub end_min: u32,
}

impl TimeWindow {
    fn contains(&self, day: Weekday, minute: u32) -> bool {
        self.days.contains(&day) && minute >= self.start_min && minute < self.end_min
    }
}

fn parse_day(s: &str) -> Result<Weekday> {
    match s.to_lowercase().as_str() {
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        "sun" | "sunday" => Ok(Weekday::Sun),
        other => anyhow::bail!("invalid day: {:?}", other),
    }
}

fn parse_time_of_day(s: &str) -> Result<u32> {
    let (hh, mm) = s
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid time of day: {:?}", s))?;
    let hours: u32 = hh
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid time of day: {:?}", s))?;
    let minutes: u32 = mm
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid time of day: {:?}", s))?;

    // "24:00" marks end of day
    if (hours > 23 && !(hours == 24 && minutes == 0)) || minutes > 59 {
        anyhow::bail!("invalid time of day: {:?}", s);
    }

    Ok(hours * 60 + minutes)
}

/// Parse a window from config strings ("mon", "09:00", "17:00")
pub fn parse_time_window(days: &[String], start: &str, end: &str) -> Result<TimeWindow> {
    let days = days
        .iter()
        .map(|d| parse_day(d))
        .collect::<Result<Vec<_>>>()?;

    Ok(TimeWindow {
        days,
        start_min: parse_time_of_day(start)?,
        end_min: parse_time_of_day(end)?,
    })
}

/// Matches when the current UTC wall-clock time falls within any window
pub struct TimeRule {
    windows: Vec<TimeWindow>,
}

impl TimeRule {
    pub fn new(windows: Vec<TimeWindow>) -> Self {
        Self { windows }
    }
}

impl Rule for TimeRule {
    fn evaluate(&self, _ctx: &Context) -> RuleResult {
        let now = Utc::now();
        let day = now.weekday();
        let minute = now.hour() * 60 + now.minute();

        if self.windows.iter().any(|w| w.contains(day, minute)) {
            RuleResult::hit("current time within configured window", self.type_tag())
        } else {
            RuleResult::miss("current time outside configured windows")
        }
    }

    fn type_tag(&self) -> &'static str {
        "time_window"
    }
}
