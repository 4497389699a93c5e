use anyhow::{Context, Result, bail};
use tabled::{Table, Tabled, settings::Style};

use stride_core::cache::CacheQuery;
use stride_core::models::Todo;

use super::Service;
use super::helpers::{delivery_note, parse_date, print_json, sync_marker, truncate, warn_if_cached};

pub(crate) async fn cmd_todo_add(
    svc: &Service,
    title: &str,
    due: Option<String>,
    category: Option<String>,
    notes: Option<String>,
    json: bool,
) -> Result<()> {
    let title = title.trim();
    if title.is_empty() {
        bail!("Todo title cannot be empty");
    }
    let due_date = due.map(|d| parse_date(Some(d))).transpose()?;
    let saved = svc
        .todos()
        .create(Todo {
            todo_id: String::new(),
            title: title.to_string(),
            notes,
            completed: false,
            due_date,
            category,
        })
        .await?;

    if json {
        print_json(&serde_json::json!({ "todo": saved.item, "delivery": saved.delivery }))?;
    } else {
        println!(
            "Added todo '{}' ({}){}",
            saved.item.title,
            saved.item.todo_id,
            delivery_note(saved.delivery)
        );
    }
    Ok(())
}

pub(crate) async fn cmd_todo_list(
    svc: &Service,
    all: bool,
    category: Option<String>,
    json: bool,
) -> Result<()> {
    let mut query = CacheQuery::all();
    if !all {
        query = query.field("completed", false);
    }
    if let Some(category) = category {
        query = query.field("category", category);
    }
    let fetched = svc.todos().fetch(&query).await?;

    if json {
        return print_json(&fetched.records);
    }
    warn_if_cached(fetched.source);
    if fetched.records.is_empty() {
        eprintln!("Nothing to do.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct TodoRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "")]
        done: &'static str,
        #[tabled(rename = "Title")]
        title: String,
        #[tabled(rename = "Due")]
        due: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Sync")]
        sync: &'static str,
    }

    let rows: Vec<TodoRow> = fetched
        .records
        .iter()
        .map(|c| TodoRow {
            id: c.item.todo_id.clone(),
            done: if c.item.completed { "x" } else { " " },
            title: truncate(&c.item.title, 40),
            due: c
                .item
                .due_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            category: c.item.category.clone().unwrap_or_default(),
            sync: sync_marker(c.synced),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) async fn cmd_todo_done(svc: &Service, todo_id: &str, json: bool) -> Result<()> {
    let mut todo = svc
        .todos()
        .get(todo_id)?
        .with_context(|| format!("No cached todo '{todo_id}'. Run `stride todo list` first"))?
        .item;
    todo.completed = true;
    let saved = svc.todos().update(todo).await?;

    if json {
        print_json(&serde_json::json!({ "todo": saved.item, "delivery": saved.delivery }))?;
    } else {
        println!(
            "Completed '{}'{}",
            saved.item.title,
            delivery_note(saved.delivery)
        );
    }
    Ok(())
}

pub(crate) async fn cmd_todo_delete(svc: &Service, todo_id: &str, json: bool) -> Result<()> {
    let delivery = svc.todos().delete(todo_id).await?;
    if json {
        print_json(&serde_json::json!({ "deleted": todo_id, "delivery": delivery }))?;
    } else {
        println!("Deleted todo {todo_id}{}", delivery_note(delivery));
    }
    Ok(())
}
