//! Queue load simulator
//!
//! Runs an in-process engine against the services and counters from a
//! config file: citizens join concurrently with a fixed priority mix, every
//! counter works its queue, and a share of calls is left unanswered so the
//! no-show sweeper fires. Prints per-service stats and the metrics summary.
//!
//! Usage:
//!   cargo run --bin queue-sim -- --config config/dev.toml --citizens 500

use clap::Parser;
use queue_engine::domain::types::{CounterId, PriorityClass, StaffId, TokenStatus};
use queue_engine::domain::Token;
use queue_engine::infra::{Config, Metrics};
use queue_engine::io::create_intent_channel;
use queue_engine::services::no_show::run_sweeper;
use queue_engine::services::QueueEngine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Priority mix applied by citizen index (1 emergency, 2 disabled, 3 senior per 20)
const PRIORITY_CYCLE: [PriorityClass; 20] = {
    let mut cycle = [PriorityClass::Normal; 20];
    cycle[3] = PriorityClass::Emergency;
    cycle[7] = PriorityClass::Disabled;
    cycle[15] = PriorityClass::Disabled;
    cycle[1] = PriorityClass::Senior;
    cycle[10] = PriorityClass::Senior;
    cycle[18] = PriorityClass::Senior;
    cycle
};

#[derive(Parser, Debug)]
#[command(name = "queue-sim", about = "In-process load simulation for the queue engine")]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Number of citizens joining
    #[arg(long, default_value = "200")]
    citizens: usize,

    /// Every Nth call is left unanswered (0 disables)
    #[arg(long, default_value = "7")]
    no_show_every: u64,

    /// No-show timeout applied for the run
    #[arg(long, default_value = "1")]
    no_show_timeout_secs: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config =
        Config::load(args.config.as_deref()).with_no_show_timeout_secs(args.no_show_timeout_secs);
    let metrics = Arc::new(Metrics::new());

    println!("\n=== QUEUE SIMULATION ===");
    println!("  config:       {}", config.config_file());
    println!("  services:     {}", config.services().len());
    println!("  counters:     {}", config.counters().len());
    println!("  citizens:     {}", args.citizens);
    println!("  no-show each: {}", args.no_show_every);
    println!("  timeout:      {}s", config.no_show_timeout_secs());

    let (sender, mut intents) =
        create_intent_channel(args.citizens * 8 + 64, config.site_id().to_string(), metrics.clone());
    let intent_counter = tokio::spawn(async move {
        let mut counts: HashMap<&'static str, u64> = HashMap::new();
        while let Some(intent) = intents.recv().await {
            *counts.entry(intent.kind.as_str()).or_default() += 1;
        }
        counts
    });

    let engine = Arc::new(QueueEngine::from_config(&config, metrics.clone(), Some(sender), None)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweeper(engine.clone(), Duration::from_millis(100), shutdown_rx));

    let services = engine.service_ids();
    if services.is_empty() {
        anyhow::bail!("no services configured");
    }

    // Joins
    let started = Instant::now();
    let mut joins = Vec::with_capacity(args.citizens);
    for i in 0..args.citizens {
        let engine = engine.clone();
        let service = services[i % services.len()].clone();
        joins.push(tokio::spawn(async move {
            let priority = PRIORITY_CYCLE[i % PRIORITY_CYCLE.len()];
            engine.join(format!("citizen-{i}").into(), &service, priority, None).await
        }));
    }
    let mut rejected = 0usize;
    for join in joins {
        if join.await?.is_err() {
            rejected += 1;
        }
    }
    let join_elapsed = started.elapsed();

    // Counters work their queues concurrently
    let counters: Vec<CounterId> =
        config.counters().iter().filter(|c| c.active).map(|c| c.id.clone()).collect();
    let mut workers = Vec::with_capacity(counters.len());
    for counter in counters {
        let engine = engine.clone();
        let no_show_every = args.no_show_every;
        workers.push(tokio::spawn(async move { work_counter(&engine, &counter, no_show_every).await }));
    }
    let mut served = 0usize;
    for worker in workers {
        served += worker.await?;
    }

    let _ = shutdown_tx.send(true);
    sweeper.await?;

    println!("\n=== RESULTS ({} joins in {:?}, {} rejected) ===", args.citizens, join_elapsed, rejected);
    println!(
        "{:<16} {:>8} {:>10} {:>9} {:>9} {:>10}",
        "service", "waiting", "completed", "no_show", "cancel", "avg_wait"
    );
    for service in &services {
        let stats = engine.stats(service).await?;
        println!(
            "{:<16} {:>8} {:>10} {:>9} {:>9} {:>9.2}m",
            service.as_str(),
            stats.waiting,
            stats.completed_today,
            stats.no_show_today,
            stats.cancelled_today,
            stats.average_wait_minutes
        );
    }
    println!("\nserved: {served}");

    let summary = metrics.report(0, engine.no_show_monitor().pending());
    println!(
        "created: {}, called: {}, completed: {}, no-shows: {}/{} (timeout/staff), intents sent/dropped: {}/{}",
        summary.tokens_created,
        summary.tokens_called,
        summary.tokens_completed,
        summary.no_show_auto,
        summary.no_show_manual,
        summary.intents_sent,
        summary.intents_dropped
    );

    drop(engine);
    let mut counts: Vec<_> = intent_counter.await?.into_iter().collect();
    counts.sort();
    println!("\nintents by kind:");
    for (kind, count) in counts {
        println!("  {kind:<18} {count}");
    }
    Ok(())
}

/// Call, serve and complete until the counter's queue is empty. Every
/// `no_show_every`-th token goes unanswered: staff mark every second one
/// NO_SHOW, the rest are left for the sweeper while the counter waits.
async fn work_counter(engine: &QueueEngine, counter: &CounterId, no_show_every: u64) -> usize {
    let staff: StaffId = format!("staff-{counter}").into();
    let mut served = 0;
    let mut skipped = 0u64;
    loop {
        let token = match engine.call_next(counter, &staff) {
            Ok(Some(token)) => token,
            Ok(None) => return served,
            Err(e) => {
                eprintln!("{counter}: {e}");
                return served;
            }
        };

        if no_show_every > 0 && token.seq % no_show_every == 0 {
            skipped += 1;
            if skipped % 2 == 0 {
                if let Err(e) = engine.mark_no_show(token.id, &staff, Some("not at desk".into())) {
                    eprintln!("{counter}: {e}");
                }
            } else {
                wait_until_released(engine, counter, &token).await;
            }
            continue;
        }

        let finished = engine
            .mark_serving(token.id, &staff, None)
            .and_then(|_| engine.complete(token.id, &staff, None));
        match finished {
            Ok(t) if t.status == TokenStatus::Completed => served += 1,
            Ok(_) => {}
            Err(e) => eprintln!("{counter}: {e}"),
        }
    }
}

async fn wait_until_released(engine: &QueueEngine, counter: &CounterId, token: &Token) {
    loop {
        match engine.get_counter(counter) {
            Ok(c) if c.current_token == Some(token.id) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            _ => return,
        }
    }
}
