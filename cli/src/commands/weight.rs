use anyhow::{Result, bail};
use chrono::{Duration, Local};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use stride_core::cache::CacheQuery;
use stride_core::models::WeightEntry;

use super::Service;
use super::helpers::{
    delivery_note, no_neg_zero, parse_date, print_json, sync_marker, warn_if_cached,
};

const LBS_PER_KG: f64 = 2.20462;
const KG_PER_LB: f64 = 0.453_592;

fn to_kg(value: f64, unit: &str) -> Result<f64> {
    if value <= 0.0 {
        bail!("Weight must be greater than 0");
    }
    match unit.to_lowercase().as_str() {
        "kg" => Ok(value),
        "lbs" | "lb" => Ok(no_neg_zero(value * KG_PER_LB)),
        _ => bail!("Invalid unit '{unit}'. Use 'kg' or 'lbs'"),
    }
}

pub(crate) async fn cmd_weight_log(
    svc: &Service,
    value: f64,
    unit: &str,
    date: Option<String>,
    note: Option<String>,
    json: bool,
) -> Result<()> {
    let weight = to_kg(value, unit)?;
    let entry = WeightEntry {
        date: parse_date(date)?,
        weight,
        note,
    };

    let saved = svc.weights().create(entry).await?;

    if json {
        print_json(&serde_json::json!({ "entry": saved.item, "delivery": saved.delivery }))?;
    } else {
        let e = &saved.item;
        println!(
            "Logged {:.1} kg ({:.1} lbs) for {}{}",
            e.weight,
            e.weight * LBS_PER_KG,
            e.date.format("%Y-%m-%d"),
            delivery_note(saved.delivery)
        );
        if let Some(ref n) = e.note {
            println!("  Note: {n}");
        }
    }

    Ok(())
}

pub(crate) async fn cmd_weight_history(svc: &Service, days: u32, json: bool) -> Result<()> {
    let today = Local::now().date_naive();
    let query = CacheQuery::between(today - Duration::days(i64::from(days)), today);
    let fetched = svc.weights().fetch(&query).await?;

    if json {
        return print_json(&fetched.records);
    }
    warn_if_cached(fetched.source);
    if fetched.records.is_empty() {
        eprintln!("No weight entries found. Use `stride weight log` to record your weight.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct WeightRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Weight (kg)")]
        kg: String,
        #[tabled(rename = "Weight (lbs)")]
        lbs: String,
        #[tabled(rename = "Note")]
        note: String,
        #[tabled(rename = "Sync")]
        sync: &'static str,
    }

    let rows: Vec<WeightRow> = fetched
        .records
        .iter()
        .map(|c| WeightRow {
            date: c.item.date.format("%Y-%m-%d").to_string(),
            kg: format!("{:.1}", c.item.weight),
            lbs: format!("{:.1}", c.item.weight * LBS_PER_KG),
            note: c.item.note.clone().unwrap_or_default(),
            sync: sync_marker(c.synced),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

pub(crate) async fn cmd_weight_delete(svc: &Service, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let key = date.format("%Y-%m-%d").to_string();
    let delivery = svc.weights().delete(&key).await?;

    if json {
        print_json(&serde_json::json!({ "deleted": key, "delivery": delivery }))?;
    } else {
        println!("Deleted weight entry for {key}{}", delivery_note(delivery));
    }

    Ok(())
}
