// ABOUTME: Next-occurrence computation for weekly recurring posts.
// ABOUTME: Everything here is UTC; callers convert user-local times before calling.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};

/// Upper bound on day steps when searching for the next matching weekday.
const MAX_SEARCH_DAYS: u32 = 365;

/// Parse `"1,3,5"` into weekday indices, 0 = Sunday through 6 = Saturday.
/// The result is sorted and deduplicated.
pub fn parse_weekdays(days: &str) -> Result<Vec<u32>> {
    let mut parsed = Vec::new();
    for part in days.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let day: u32 = part
            .parse()
            .with_context(|| format!("Invalid weekday index '{}'", part))?;
        if day > 6 {
            anyhow::bail!("Weekday index {} out of range (0=Sunday..6=Saturday)", day);
        }
        parsed.push(day);
    }
    if parsed.is_empty() {
        anyhow::bail!("Recurrence needs at least one weekday");
    }
    parsed.sort_unstable();
    parsed.dedup();
    Ok(parsed)
}

/// Parse an `HH:MM` time of day.
pub fn parse_time_of_day(input: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(input.trim(), "%H:%M")
        .with_context(|| format!("Invalid time of day '{}', expected HH:MM", input))
}

/// Earliest instant strictly after `after` that falls on one of
/// `recurrence_days` at `original_time`.
pub fn next_occurrence(
    recurrence_days: &str,
    original_time: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let days = parse_weekdays(recurrence_days)?;
    let time = parse_time_of_day(original_time)?;

    let mut date = after.date_naive();
    if date.and_time(time).and_utc() <= after {
        date = next_day(date)?;
    }

    for _ in 0..MAX_SEARCH_DAYS {
        if days.contains(&date.weekday().num_days_from_sunday()) {
            return Ok(date.and_time(time).and_utc());
        }
        date = next_day(date)?;
    }
    anyhow::bail!(
        "No occurrence of days '{}' within {} days of {}",
        recurrence_days,
        MAX_SEARCH_DAYS,
        after
    )
}

fn next_day(date: NaiveDate) -> Result<NaiveDate> {
    date.checked_add_days(Days::new(1))
        .context("Date out of range while computing next occurrence")
}
