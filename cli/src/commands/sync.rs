use std::time::Duration;

use anyhow::{Result, bail};
use tabled::{Table, Tabled, settings::Style};
use tokio::sync::mpsc;

use stride_core::models::PendingMutation;
use stride_core::trigger::SyncSignal;
use stride_core::{DrainOutcome, DrainReport};

use super::Service;
use super::helpers::{print_json, truncate};
use crate::config::Config;
use crate::http::HttpRequester;

fn describe(report: &DrainReport) -> String {
    let mut parts = vec![format!("{} sent", report.succeeded)];
    if report.discarded > 0 {
        parts.push(format!("{} already gone", report.discarded));
    }
    if report.failed > 0 {
        parts.push(format!("{} failed", report.failed));
    }
    if report.skipped > 0 {
        parts.push(format!("{} parked", report.skipped));
    }
    parts.join(", ")
}

pub(crate) async fn cmd_sync(svc: &Service, json: bool) -> Result<()> {
    let outcome = svc.sync().await?;
    let pending = svc.pending_count()?;

    if json {
        return print_json(&serde_json::json!({ "result": outcome, "pending": pending }));
    }
    match outcome {
        DrainOutcome::AlreadyRunning => eprintln!("A sync is already running."),
        DrainOutcome::Completed(report) if report.attempted == 0 && report.skipped == 0 => {
            println!("Nothing to sync.");
        }
        DrainOutcome::Completed(report) => {
            println!("Synced: {}. {pending} change(s) pending.", describe(&report));
            if report.halted {
                eprintln!("Session expired. Sign in again, then re-run `stride sync`.");
            }
        }
    }
    Ok(())
}

pub(crate) fn cmd_status(svc: &Service, config: &Config, json: bool) -> Result<()> {
    let pending = svc.pending_count()?;
    let parked = svc.failed_mutations()?.len();
    let last_sync = svc.last_sync_at()?;

    if json {
        return print_json(&serde_json::json!({
            "server": config.server_url,
            "signedIn": config.token.is_some(),
            "pending": pending,
            "parked": parked,
            "lastSyncAt": last_sync,
        }));
    }
    println!("Server:    {}", config.server_url);
    println!(
        "Signed in: {}",
        if config.token.is_some() { "yes" } else { "no" }
    );
    println!("Pending:   {pending}");
    if parked > 0 {
        println!("Parked:    {parked} (see `stride queue list`)");
    }
    println!("Last sync: {}", last_sync.as_deref().unwrap_or("never"));
    Ok(())
}

pub(crate) fn cmd_queue_list(svc: &Service, json: bool) -> Result<()> {
    let queue = svc.queue()?;
    let max_retries = svc.engine().policy().max_retries;

    if json {
        return print_json(&queue);
    }
    if queue.is_empty() {
        eprintln!("Queue is empty.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct QueueRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Method")]
        method: String,
        #[tabled(rename = "Endpoint")]
        endpoint: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Retries")]
        retries: u32,
        #[tabled(rename = "Queued at")]
        created_at: String,
    }

    let row = |m: &PendingMutation| QueueRow {
        id: m.id,
        method: m.method.to_string(),
        endpoint: truncate(&m.endpoint, 40),
        status: if m.retries > max_retries {
            "parked".to_string()
        } else {
            m.status.as_str().to_string()
        },
        retries: m.retries,
        created_at: m.created_at.clone(),
    };
    let rows: Vec<QueueRow> = queue.iter().map(row).collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) fn cmd_queue_retry(svc: &Service, id: i64, json: bool) -> Result<()> {
    svc.requeue(id)?;
    if json {
        print_json(&serde_json::json!({ "requeued": id }))?;
    } else {
        println!("Mutation {id} will be retried on the next sync.");
    }
    Ok(())
}

/// Discards parked changes for good, so it needs `--yes`.
pub(crate) fn cmd_queue_purge(svc: &Service, yes: bool, json: bool) -> Result<()> {
    let parked = svc.failed_mutations()?;
    if parked.is_empty() {
        if json {
            print_json(&serde_json::json!({ "purged": 0 }))?;
        } else {
            eprintln!("No parked changes.");
        }
        return Ok(());
    }
    if !yes {
        bail!(
            "This permanently discards {} change(s). Re-run with --yes to confirm",
            parked.len()
        );
    }
    let purged = svc.clear_failed()?;
    if json {
        print_json(&serde_json::json!({ "purged": purged }))?;
    } else {
        println!("Discarded {purged} parked change(s).");
    }
    Ok(())
}

pub(crate) fn cmd_prune(svc: &Service, json: bool) -> Result<()> {
    let removed = svc.prune()?;
    if json {
        print_json(&serde_json::json!({ "pruned": removed }))?;
    } else {
        println!("Pruned {removed} old cached row(s).");
    }
    Ok(())
}

pub(crate) async fn cmd_logout(svc: &Service, config: &Config, json: bool) -> Result<()> {
    let pending = svc.pending_count()?;
    svc.sign_out().await?;
    let had_token = config.forget_token()?;

    if json {
        print_json(&serde_json::json!({ "signedOut": true, "discarded": pending }))?;
    } else {
        if pending > 0 {
            eprintln!("Discarded {pending} unsynced change(s).");
        }
        if had_token {
            println!("Signed out and cleared local data.");
        } else {
            println!("Cleared local data.");
        }
    }
    Ok(())
}

/// Probe the server every `interval` and drain whenever it comes back.
pub(crate) async fn cmd_watch(svc: &Service, prober: HttpRequester, interval: u64) -> Result<()> {
    let (tx, rx) = mpsc::channel(16);
    svc.engine().set_observer(|pending| {
        if pending > 0 {
            eprintln!("{pending} change(s) pending");
        }
    });
    let trigger = tokio::spawn(svc.trigger().run(rx));

    eprintln!("Watching connectivity every {interval}s. Press Ctrl-C to stop.");
    let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
    let mut last = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let online = prober.probe().await;
                if last != Some(online) {
                    eprintln!("{}", if online { "Online" } else { "Offline" });
                    last = Some(online);
                }
                if tx.send(SyncSignal::Connectivity(online)).await.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(tx);
    trigger.await?;
    Ok(())
}
