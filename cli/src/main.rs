mod commands;
mod config;
mod http;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

use crate::commands::{
    Service, cmd_event_add, cmd_event_delete, cmd_event_list, cmd_habit_add, cmd_habit_check,
    cmd_habit_delete, cmd_habit_list, cmd_logout, cmd_prune, cmd_queue_list, cmd_queue_purge,
    cmd_queue_retry, cmd_status, cmd_sync, cmd_todo_add, cmd_todo_delete, cmd_todo_done,
    cmd_todo_list, cmd_watch, cmd_weight_delete, cmd_weight_history, cmd_weight_log,
};
use crate::config::Config;
use crate::http::{HttpConfig, HttpRequester};
use stride_core::SyncPolicy;

#[derive(Parser)]
#[command(
    name = "stride",
    version,
    about = "Track weight, habits, todos and events, online or off"
)]
struct Cli {
    /// Log debug output to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record and review body weight
    Weight {
        #[command(subcommand)]
        command: WeightCommands,
    },
    /// Manage habits and check them off
    Habit {
        #[command(subcommand)]
        command: HabitCommands,
    },
    /// Manage todos
    Todo {
        #[command(subcommand)]
        command: TodoCommands,
    },
    /// Manage calendar events
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },
    /// Send queued changes to the server now
    Sync {
        #[arg(long)]
        json: bool,
    },
    /// Show pending changes and last sync time
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Inspect and manage queued changes
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Drop old confirmed history from the local cache
    Prune {
        #[arg(long)]
        json: bool,
    },
    /// Clear all local data and the stored token
    Logout {
        #[arg(long)]
        json: bool,
    },
    /// Stay running and sync whenever the server becomes reachable
    Watch {
        /// Seconds between connectivity probes
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum WeightCommands {
    /// Log a weight entry (one per day; logging again replaces it)
    Log {
        /// Weight value
        value: f64,
        /// Unit: kg or lbs
        #[arg(short, long, default_value = "kg")]
        unit: String,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show recent weight history
    History {
        /// Number of days to show
        #[arg(short, long, default_value = "30")]
        days: u32,
        #[arg(long)]
        json: bool,
    },
    /// Delete the entry for a date
    Delete {
        /// Date (YYYY-MM-DD; default: today)
        date: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum HabitCommands {
    /// Create a habit
    Add {
        name: String,
        #[arg(long)]
        color: Option<String>,
        /// e.g. daily, weekly
        #[arg(long)]
        frequency: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List habits
    List {
        /// Include archived habits
        #[arg(long)]
        archived: bool,
        #[arg(long)]
        json: bool,
    },
    /// Mark a habit done for a day
    Check {
        habit_id: String,
        /// Date (YYYY-MM-DD, today, yesterday; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Optional measured value (minutes, pages, ...)
        #[arg(long)]
        value: Option<f64>,
        #[arg(long)]
        json: bool,
    },
    /// Delete a habit
    Delete {
        habit_id: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TodoCommands {
    /// Add a todo
    Add {
        title: String,
        /// Due date (YYYY-MM-DD, today, tomorrow)
        #[arg(long)]
        due: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List open todos
    List {
        /// Include completed todos
        #[arg(short, long)]
        all: bool,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Mark a todo completed
    Done {
        todo_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Delete a todo
    Delete {
        todo_id: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum EventCommands {
    /// Add a calendar event
    Add {
        title: String,
        /// Date (YYYY-MM-DD, today, tomorrow; default: today)
        #[arg(long)]
        date: Option<String>,
        /// Start time (HH:MM)
        #[arg(long)]
        start: Option<String>,
        /// End time (HH:MM)
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List upcoming events
    List {
        /// First day to show (default: today)
        #[arg(long)]
        from: Option<String>,
        #[arg(short, long, default_value = "14")]
        days: u32,
        #[arg(long)]
        json: bool,
    },
    /// Delete an event
    Delete {
        event_id: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued changes, oldest first
    List {
        #[arg(long)]
        json: bool,
    },
    /// Give a parked change a fresh set of retries
    Retry {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Permanently discard parked changes
    Purge {
        /// Confirm the data loss
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let http = HttpConfig::default();
    let requester = HttpRequester::new(&config.server_url, config.token.clone(), &http)?;
    let svc: Service = Service::new(&config.db_path, requester, SyncPolicy::default())?;

    let result = match cli.command {
        Commands::Weight { command } => match command {
            WeightCommands::Log {
                value,
                unit,
                date,
                note,
                json,
            } => cmd_weight_log(&svc, value, &unit, date, note, json).await,
            WeightCommands::History { days, json } => cmd_weight_history(&svc, days, json).await,
            WeightCommands::Delete { date, json } => cmd_weight_delete(&svc, date, json).await,
        },
        Commands::Habit { command } => match command {
            HabitCommands::Add {
                name,
                color,
                frequency,
                json,
            } => cmd_habit_add(&svc, &name, color, frequency, json).await,
            HabitCommands::List { archived, json } => cmd_habit_list(&svc, archived, json).await,
            HabitCommands::Check {
                habit_id,
                date,
                value,
                json,
            } => cmd_habit_check(&svc, &habit_id, date, value, json).await,
            HabitCommands::Delete { habit_id, json } => {
                cmd_habit_delete(&svc, &habit_id, json).await
            }
        },
        Commands::Todo { command } => match command {
            TodoCommands::Add {
                title,
                due,
                category,
                notes,
                json,
            } => cmd_todo_add(&svc, &title, due, category, notes, json).await,
            TodoCommands::List {
                all,
                category,
                json,
            } => cmd_todo_list(&svc, all, category, json).await,
            TodoCommands::Done { todo_id, json } => cmd_todo_done(&svc, &todo_id, json).await,
            TodoCommands::Delete { todo_id, json } => cmd_todo_delete(&svc, &todo_id, json).await,
        },
        Commands::Event { command } => match command {
            EventCommands::Add {
                title,
                date,
                start,
                end,
                location,
                category,
                json,
            } => cmd_event_add(&svc, &title, date, start, end, location, category, json).await,
            EventCommands::List { from, days, json } => cmd_event_list(&svc, from, days, json).await,
            EventCommands::Delete { event_id, json } => {
                cmd_event_delete(&svc, &event_id, json).await
            }
        },
        Commands::Sync { json } => cmd_sync(&svc, json).await,
        Commands::Status { json } => cmd_status(&svc, &config, json),
        Commands::Queue { command } => match command {
            QueueCommands::List { json } => cmd_queue_list(&svc, json),
            QueueCommands::Retry { id, json } => cmd_queue_retry(&svc, id, json),
            QueueCommands::Purge { yes, json } => cmd_queue_purge(&svc, yes, json),
        },
        Commands::Prune { json } => cmd_prune(&svc, json),
        Commands::Logout { json } => cmd_logout(&svc, &config, json).await,
        Commands::Watch { interval } => {
            let prober = HttpRequester::new(&config.server_url, None, &http)?;
            cmd_watch(&svc, prober, interval).await
        }
    };

    let closed = svc.close().await;
    result.and(closed)
}
