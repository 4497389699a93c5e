use anyhow::{Result, bail};
use chrono::Duration;
use tabled::{Table, Tabled, settings::Style};

use stride_core::cache::CacheQuery;
use stride_core::models::CalendarEvent;

use super::Service;
use super::helpers::{delivery_note, parse_date, print_json, sync_marker, truncate, warn_if_cached};

#[allow(clippy::too_many_arguments)]
pub(crate) async fn cmd_event_add(
    svc: &Service,
    title: &str,
    date: Option<String>,
    start: Option<String>,
    end: Option<String>,
    location: Option<String>,
    category: Option<String>,
    json: bool,
) -> Result<()> {
    let title = title.trim();
    if title.is_empty() {
        bail!("Event title cannot be empty");
    }
    let saved = svc
        .events()
        .create(CalendarEvent {
            event_id: String::new(),
            title: title.to_string(),
            date: parse_date(date)?,
            start_time: start,
            end_time: end,
            location,
            category,
        })
        .await?;

    if json {
        print_json(&serde_json::json!({ "event": saved.item, "delivery": saved.delivery }))?;
    } else {
        println!(
            "Added '{}' on {} ({}){}",
            saved.item.title,
            saved.item.date.format("%Y-%m-%d"),
            saved.item.event_id,
            delivery_note(saved.delivery)
        );
    }
    Ok(())
}

pub(crate) async fn cmd_event_list(
    svc: &Service,
    from: Option<String>,
    days: u32,
    json: bool,
) -> Result<()> {
    let from = parse_date(from)?;
    let query = CacheQuery::between(from, from + Duration::days(i64::from(days)));
    let fetched = svc.events().fetch(&query).await?;

    if json {
        return print_json(&fetched.records);
    }
    warn_if_cached(fetched.source);
    if fetched.records.is_empty() {
        eprintln!("No events in the next {days} days.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct EventRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "Title")]
        title: String,
        #[tabled(rename = "Location")]
        location: String,
        #[tabled(rename = "Sync")]
        sync: &'static str,
    }

    let rows: Vec<EventRow> = fetched
        .records
        .iter()
        .map(|c| EventRow {
            id: c.item.event_id.clone(),
            date: c.item.date.format("%Y-%m-%d").to_string(),
            time: match (&c.item.start_time, &c.item.end_time) {
                (Some(s), Some(e)) => format!("{s}-{e}"),
                (Some(s), None) => s.clone(),
                _ => String::new(),
            },
            title: truncate(&c.item.title, 35),
            location: c.item.location.clone().unwrap_or_default(),
            sync: sync_marker(c.synced),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) async fn cmd_event_delete(svc: &Service, event_id: &str, json: bool) -> Result<()> {
    let delivery = svc.events().delete(event_id).await?;
    if json {
        print_json(&serde_json::json!({ "deleted": event_id, "delivery": delivery }))?;
    } else {
        println!("Deleted event {event_id}{}", delivery_note(delivery));
    }
    Ok(())
}
