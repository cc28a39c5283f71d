//! `conductor run`: the orchestrator in the foreground.

use anyhow::{Context, Result};
use clap::Args;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use crate::application::{EventSystem, EventSystemDeps};
use crate::cli::commands::open_database;
use crate::domain::models::Config;
use crate::services::event_bus::{Envelope, EventKind};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Log a status snapshot every N seconds (0 disables)
    #[arg(long, default_value = "60")]
    pub status_interval: u64,

    /// Print every bus event to stdout
    #[arg(long)]
    pub watch: bool,
}

pub async fn execute(args: RunArgs, config: Config, json: bool) -> Result<()> {
    let pool = open_database(&config).await?;
    let deps = EventSystemDeps::production(pool.clone(), &config);
    let system = EventSystem::new(config, deps);

    system.init().await.context("Failed to start the event system")?;
    info!(database = %system.config().database.path, "Conductor running; Ctrl-C to stop");

    let mut events = args.watch.then(|| system.bus().watch(&EventKind::ALL));
    let mut ticker = (args.status_interval > 0).then(|| {
        let mut t = tokio::time::interval(Duration::from_secs(args.status_interval));
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        t
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("Failed to listen for Ctrl-C")?;
                info!("Interrupt received, shutting down");
                break;
            }
            envelope = next_event(&mut events) => {
                match envelope {
                    Some(envelope) => print_event(&envelope, json),
                    None => events = None,
                }
            }
            () = next_tick(&mut ticker) => {
                let status = system.status().await;
                info!(
                    qa_queue = status.qa.queue_length,
                    qa_active = status.qa.active_count,
                    spawn_queue = status.spawn.queue_length,
                    in_flight = status.spawn.in_flight,
                    rate_limited = status.spawn.rate_limited,
                    cpu = status.resources.cpu_percent,
                    memory = status.resources.memory_percent,
                    events = status.bus.total_published,
                    "Status"
                );
            }
        }
    }

    system.shutdown().await;
    pool.close().await;
    Ok(())
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<Envelope>>) -> Option<Envelope> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn print_event(envelope: &Envelope, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(envelope) {
            println!("{line}");
        }
    } else {
        let task = envelope
            .event
            .task_id()
            .map(|id| format!(" task={id}"))
            .unwrap_or_default();
        println!(
            "{} #{} {}{}",
            envelope.timestamp.format("%H:%M:%S%.3f"),
            envelope.sequence,
            envelope.event.name(),
            task
        );
    }
}
