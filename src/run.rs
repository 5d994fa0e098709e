//! `gatehouse run` — construct and run the full pipeline until SIGINT,
//! with a background collector writing periodic `GatewayStatsSnapshot`
//! entries to the configured JSONL log.

use anyhow::Result;
use gatehouse_core::stats::GatewayStatsSnapshot;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gatehouse::config::GatewayConfig;
use gatehouse::orchestrator;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

#[derive(Serialize)]
struct LogEntry {
    ts: u64,
    started_at: u64,
    stats: GatewayStatsSnapshot,
}

pub fn run(config: &GatewayConfig) -> Result<()> {
    eprintln!(
        "gatehouse run — tcp :{}  udp :{}  multicast {}:{} ({})  logging to {} every {}s",
        config.tcp.port,
        config.udp.port,
        config.multicast.group,
        config.multicast.port,
        if config.multicast.enabled { "enabled" } else { "disabled" },
        config.stats.log_path,
        config.stats.snapshot_interval_secs,
    );

    let handle = orchestrator::spawn(config, orchestrator::stub_engine_factory)?;

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    let started_at = now_secs();
    if let Ok(f) = std::fs::File::create(&config.stats.log_path) {
        drop(f);
    }

    let interval = Duration::from_secs(config.stats.snapshot_interval_secs.max(1));
    while RUNNING.load(Ordering::SeqCst) {
        let mut waited = Duration::ZERO;
        while waited < interval && RUNNING.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
            waited += Duration::from_millis(200);
        }
        if !RUNNING.load(Ordering::SeqCst) {
            break;
        }
        log_snapshot(&handle.stats, started_at, &config.stats.log_path);
    }

    eprintln!("gatehouse: shutting down...");
    handle.shutdown();
    handle.join();
    eprintln!("gatehouse: stopped.");
    Ok(())
}

fn log_snapshot(stats: &Arc<gatehouse_core::stats::GatewayStats>, started_at: u64, log_path: &str) {
    let snapshot = stats.snapshot();
    tracing::info!(
        rx_packets = snapshot.rx_packets,
        tx_packets = snapshot.tx_packets,
        active_clients = snapshot.active_clients,
        queue_full_drops = snapshot.queue_full_drops,
        "gateway snapshot",
    );
    let entry = LogEntry { ts: now_secs(), started_at, stats: snapshot };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
        if let Ok(line) = serde_json::to_string(&entry) {
            let _ = writeln!(file, "{}", line);
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
