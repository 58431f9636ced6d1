//! ICS rendering of extracted schedules.
//!
//! Output is CRLF-joined and, apart from `DTSTAMP`, a pure function of the
//! input schedule. Timestamps are written as wall-clock values without an
//! offset; an offset on the input is consumed while parsing and dropped.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::models::{Event, Recurrence, Schedule};

pub const PRODUCT_ID: &str = "-//Syllendar//AI Generated Calendar//EN";
pub const UID_DOMAIN: &str = "syllendar.com";

const ICS_DATETIME: &str = "%Y%m%dT%H%M%S";

#[derive(Error, Debug, PartialEq)]
pub enum IcsError {
    #[error("Invalid {field} for event '{title}': {value:?}")]
    InvalidTimestamp {
        field: &'static str,
        title: String,
        value: String,
    },
}

/// Source of the generation timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant.
#[cfg(test)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Clone)]
pub struct IcsRenderer {
    clock: Arc<dyn Clock>,
    /// Pinned end year for weekly rules; `None` follows the clock's year.
    recurrence_until_year: Option<i32>,
}

impl IcsRenderer {
    pub fn new(clock: Arc<dyn Clock>, recurrence_until_year: Option<i32>) -> Self {
        Self {
            clock,
            recurrence_until_year,
        }
    }

    /// Renders `schedule`, failing as a whole on the first bad timestamp.
    pub fn render(&self, schedule: &Schedule) -> Result<String, IcsError> {
        let course_name = schedule.course_name();
        let course_code = schedule.course_code();
        let now = self.clock.now();
        let stamp = format!("{}Z", now.format(ICS_DATETIME));
        let until_year = self.recurrence_until_year.unwrap_or_else(|| now.year());

        let mut lines = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            format!("PRODID:{PRODUCT_ID}"),
            "CALSCALE:GREGORIAN".to_string(),
            "METHOD:PUBLISH".to_string(),
            format!("X-WR-CALNAME:{course_name} ({course_code})"),
            "X-WR-TIMEZONE:UTC".to_string(),
        ];

        for event in &schedule.events {
            render_event(&mut lines, event, course_code, &stamp, until_year)?;
        }

        lines.push("END:VCALENDAR".to_string());
        Ok(lines.join("\r\n"))
    }
}

fn render_event(
    lines: &mut Vec<String>,
    event: &Event,
    course_code: &str,
    stamp: &str,
    until_year: i32,
) -> Result<(), IcsError> {
    let start = parse_timestamp("start_time", &event.start_time, event)?
        .format(ICS_DATETIME)
        .to_string();
    let end = parse_timestamp("end_time", &event.end_time, event)?
        .format(ICS_DATETIME)
        .to_string();

    lines.push("BEGIN:VEVENT".to_string());
    lines.push(format!(
        "UID:{course_code}-{}-{start}@{UID_DOMAIN}",
        event.title
    ));
    lines.push(format!("DTSTART:{start}"));
    lines.push(format!("DTEND:{end}"));
    lines.push(format!("DTSTAMP:{stamp}"));
    lines.push(format!("SUMMARY:{}", event.title));
    lines.push(format!("DESCRIPTION:{}", event.description));

    if !event.location.is_empty() {
        lines.push(format!("LOCATION:{}", event.location));
    }

    if event.recurrence == Recurrence::Weekly && !event.days.is_empty() {
        let by_day: Vec<&str> = event.days.iter().map(|d| weekday_code(d)).collect();
        lines.push(format!(
            "RRULE:FREQ=WEEKLY;BYDAY={};UNTIL={}1231T235959",
            by_day.join(","),
            until_year
        ));
    }

    lines.push("END:VEVENT".to_string());
    Ok(())
}

/// Two-letter RFC 5545 code for a full weekday name; unknown input passes through.
pub fn weekday_code(day: &str) -> &str {
    match day {
        "Monday" => "MO",
        "Tuesday" => "TU",
        "Wednesday" => "WE",
        "Thursday" => "TH",
        "Friday" => "FR",
        "Saturday" => "SA",
        "Sunday" => "SU",
        other => other,
    }
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
];
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

fn parse_timestamp(
    field: &'static str,
    raw: &str,
    event: &Event,
) -> Result<NaiveDateTime, IcsError> {
    parse_wall_clock(raw).ok_or_else(|| IcsError::InvalidTimestamp {
        field,
        title: event.title.clone(),
        value: raw.to_string(),
    })
}

/// Parses an ISO 8601 date-time and returns its wall-clock components.
pub fn parse_wall_clock(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    let normalized = match trimmed.strip_suffix('Z') {
        Some(rest) => format!("{rest}+00:00"),
        None => trimmed.to_string(),
    };

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, format) {
            return Some(dt.naive_local());
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}
