use anyhow::{Result, bail};
use tabled::{Table, Tabled, settings::Style};

use stride_core::cache::CacheQuery;
use stride_core::models::{Habit, HabitEntry};

use super::Service;
use super::helpers::{delivery_note, parse_date, print_json, sync_marker, truncate, warn_if_cached};

pub(crate) async fn cmd_habit_add(
    svc: &Service,
    name: &str,
    color: Option<String>,
    frequency: Option<String>,
    json: bool,
) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Habit name cannot be empty");
    }
    let saved = svc
        .habits()
        .create(Habit {
            habit_id: String::new(),
            name: name.to_string(),
            color,
            frequency,
            archived: false,
        })
        .await?;

    if json {
        print_json(&serde_json::json!({ "habit": saved.item, "delivery": saved.delivery }))?;
    } else {
        println!(
            "Added habit '{}' ({}){}",
            saved.item.name,
            saved.item.habit_id,
            delivery_note(saved.delivery)
        );
    }
    Ok(())
}

pub(crate) async fn cmd_habit_list(svc: &Service, archived: bool, json: bool) -> Result<()> {
    let query = if archived {
        CacheQuery::all()
    } else {
        CacheQuery::all().field("archived", false)
    };
    let fetched = svc.habits().fetch(&query).await?;

    if json {
        return print_json(&fetched.records);
    }
    warn_if_cached(fetched.source);
    if fetched.records.is_empty() {
        eprintln!("No habits yet. Use `stride habit add` to create one.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct HabitRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Frequency")]
        frequency: String,
        #[tabled(rename = "Sync")]
        sync: &'static str,
    }

    let rows: Vec<HabitRow> = fetched
        .records
        .iter()
        .map(|c| HabitRow {
            id: c.item.habit_id.clone(),
            name: truncate(&c.item.name, 30),
            frequency: c.item.frequency.clone().unwrap_or_default(),
            sync: sync_marker(c.synced),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) async fn cmd_habit_check(
    svc: &Service,
    habit_id: &str,
    date: Option<String>,
    value: Option<f64>,
    json: bool,
) -> Result<()> {
    let date = parse_date(date)?;
    let saved = svc
        .habit_entries()
        .create(HabitEntry {
            habit_id: habit_id.to_string(),
            date,
            completed: true,
            value,
        })
        .await?;

    if json {
        print_json(&serde_json::json!({ "entry": saved.item, "delivery": saved.delivery }))?;
    } else {
        println!(
            "Checked {} for {}{}",
            habit_id,
            date.format("%Y-%m-%d"),
            delivery_note(saved.delivery)
        );
    }
    Ok(())
}

pub(crate) async fn cmd_habit_delete(svc: &Service, habit_id: &str, json: bool) -> Result<()> {
    let delivery = svc.habits().delete(habit_id).await?;
    if json {
        print_json(&serde_json::json!({ "deleted": habit_id, "delivery": delivery }))?;
    } else {
        println!("Deleted habit {habit_id}{}", delivery_note(delivery));
    }
    Ok(())
}
