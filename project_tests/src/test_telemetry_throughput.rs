use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Opens N WebSocket clients against server_telemetry and reports update rates", long_about = None)]
struct Args {
    /// Server WebSocket endpoint
    #[clap(short, long, default_value = "ws://127.0.0.1:8000/ws")]
    url: String,

    /// Number of concurrent clients
    #[clap(short, long, default_value_t = 10)]
    clients: usize,

    /// Cadence each client asks for, in milliseconds
    #[clap(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct UpdateMessage {
    #[serde(rename = "type")]
    msg_type: String,
    status: Option<String>,
}

#[derive(Default)]
struct Stats {
    global_timestamps: VecDeque<chrono::DateTime<Utc>>,
    client_timestamps: HashMap<usize, VecDeque<chrono::DateTime<Utc>>>,
    error_batches: usize,
}

fn lock(stats: &Mutex<Stats>) -> std::sync::MutexGuard<'_, Stats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_client(id: usize, url: String, stats: Arc<Mutex<Stats>>) -> Result<()> {
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("client {id} failed to connect to {url}"))?;
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        let Message::Text(text) = msg? else { continue };
        let Ok(parsed) = serde_json::from_str::<UpdateMessage>(text.as_str()) else {
            continue;
        };
        if parsed.msg_type != "update" {
            continue;
        }
        let now = Utc::now();
        let mut data = lock(&stats);
        data.global_timestamps.push_back(now);
        data.client_timestamps.entry(id).or_default().push_back(now);
        if parsed.status.as_deref() == Some("ERROR") {
            data.error_batches += 1;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let url = format!("{}?interval={}", args.url, args.interval_ms);
    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let report_interval = args.report_interval_secs.max(1);
    let expected_per_min = 60_000 / args.interval_ms.max(1);
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval)).await;
            let one_minute_ago = Utc::now() - Duration::minutes(1);
            let mut data = lock(&stats_reporter);

            while data.global_timestamps.front().is_some_and(|&t| t < one_minute_ago) {
                data.global_timestamps.pop_front();
            }
            let global_rate = data.global_timestamps.len();

            let mut rates: Vec<(usize, usize)> = Vec::new();
            for (client, dq) in data.client_timestamps.iter_mut() {
                while dq.front().is_some_and(|&t| t < one_minute_ago) {
                    dq.pop_front();
                }
                rates.push((*client, dq.len()));
            }
            rates.sort_by(|a, b| b.1.cmp(&a.1));

            let slowest = rates.last().map_or(0, |r| r.1);
            let fastest = rates.first().map_or(0, |r| r.1);

            println!("\n----- 1-Minute Summary -----");
            println!("Global rate: {} msg/min ({} clients)", global_rate, rates.len());
            println!("Per client: fastest {} / slowest {} msg/min, expected {}", fastest, slowest, expected_per_min);
            println!("ERROR batches so far: {}", data.error_batches);
            println!("----------------------------\n");
        }
    });

    println!("Connecting {} clients to {}...", args.clients, url);
    let mut handles = Vec::with_capacity(args.clients);
    for id in 0..args.clients {
        handles.push(tokio::spawn(run_client(id, url.clone(), Arc::clone(&stats))));
    }
    println!("Streaming. Press Ctrl+C to stop.");

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("{e:#}"),
            Err(e) => eprintln!("client task failed: {e}"),
        }
    }
    Ok(())
}
