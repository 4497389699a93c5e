use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::Serialize;

use stride_core::resource::{Delivery, Source};

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Column value for a record's confirmation state.
pub(crate) fn sync_marker(synced: bool) -> &'static str {
    if synced { "" } else { "pending" }
}

/// Suffix for a write confirmation line.
pub(crate) fn delivery_note(delivery: Delivery) -> &'static str {
    match delivery {
        Delivery::Sent => "",
        Delivery::Queued => " (offline, queued for sync)",
    }
}

pub(crate) fn warn_if_cached(source: Source) {
    if source == Source::Cache {
        eprintln!("Offline: showing cached data.");
    }
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
