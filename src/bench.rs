//! `gatehouse bench` — spins up a local pipeline, drives synthetic TCP and
//! UDP order traffic against it for a fixed duration, and reports
//! throughput/drop counters as a JSON report (plus a human-readable
//! summary on stderr), in the spirit of the teacher's timed benchmark.

use anyhow::Result;
use gatehouse_core::stats::GatewayStatsSnapshot;
use serde::Serialize;
use std::io::Write as _;
use std::net::{TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gatehouse::config::GatewayConfig;
use gatehouse::orchestrator;

/// TCP client connections, opened sequentially so each gets a predictable
/// sequential `client_id` from the TCP registry — synthetic traffic only,
/// the real admission check requires the declared `user_id` to match it.
const TCP_CLIENTS: u32 = 4;
const UDP_CLIENTS: u32 = 4;
const SYMBOLS: &[&str] = &["IBM", "ORCL", "TSLA", "MSFT"];

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub duration_secs: u64,
    pub tcp_clients: u32,
    pub udp_clients: u32,
    pub orders_sent: u64,
    pub orders_per_sec: f64,
    pub stats: GatewayStatsSnapshot,
}

pub fn run(config: &GatewayConfig, duration_secs: u64, output: Option<PathBuf>) -> Result<()> {
    eprintln!(
        "gatehouse bench — running for {duration_secs}s against a local pipeline \
         ({TCP_CLIENTS} tcp clients, {UDP_CLIENTS} udp clients)...",
    );

    let handle = orchestrator::spawn(config, orchestrator::stub_engine_factory)?;
    std::thread::sleep(Duration::from_millis(200));

    let running = Arc::new(AtomicBool::new(true));
    let sent = Arc::new(AtomicU64::new(0));
    let mut writers = Vec::new();

    for i in 0..TCP_CLIENTS {
        let user_id = i + 1;
        let stream = TcpStream::connect(("127.0.0.1", config.tcp.port))?;
        stream.set_nodelay(true)?;
        // Give the listener's accept loop a chance to claim this connection
        // before the next one arrives, keeping client_id == user_id true.
        std::thread::sleep(Duration::from_millis(20));
        let running = running.clone();
        let sent = sent.clone();
        writers.push(std::thread::spawn(move || tcp_writer(stream, user_id, running, sent)));
    }

    for i in 0..UDP_CLIENTS {
        let user_id = TCP_CLIENTS + i + 1;
        let socket = UdpSocket::bind("127.0.0.1:0")?;
        socket.connect(("127.0.0.1", config.udp.port))?;
        let running = running.clone();
        let sent = sent.clone();
        writers.push(std::thread::spawn(move || udp_writer(socket, user_id, running, sent)));
    }

    let start = Instant::now();
    let target = Duration::from_secs(duration_secs);
    let mut next_tick = 10u64;
    while start.elapsed() < target {
        std::thread::sleep(Duration::from_secs(1));
        let elapsed = start.elapsed().as_secs();
        if elapsed >= next_tick {
            eprintln!("  ...{elapsed}s / {duration_secs}s");
            next_tick += 10;
        }
    }

    running.store(false, Relaxed);
    for w in writers {
        let _ = w.join();
    }

    // Let the pipeline drain the last burst before snapshotting.
    std::thread::sleep(Duration::from_millis(200));
    let stats = handle.stats.snapshot();
    let elapsed_secs = start.elapsed().as_secs_f64();
    let orders_sent = sent.load(Relaxed);

    handle.shutdown();
    handle.join();

    let report = BenchReport {
        duration_secs,
        tcp_clients: TCP_CLIENTS,
        udp_clients: UDP_CLIENTS,
        orders_sent,
        orders_per_sec: orders_sent as f64 / elapsed_secs,
        stats,
    };

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(&path, &json)?;
            eprintln!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }

    eprintln!();
    eprintln!("=== BENCH SUMMARY ({elapsed_secs:.0}s) ===");
    eprintln!(
        "  orders/s={:.0}  rx_packets={}  tx_packets={}  queue_full_drops={}  admission_rejects={}  parse_errors={}",
        report.orders_per_sec,
        report.stats.rx_packets,
        report.stats.tx_packets,
        report.stats.queue_full_drops,
        report.stats.admission_rejects,
        report.stats.parse_errors,
    );

    Ok(())
}

fn tcp_writer(mut stream: TcpStream, user_id: u32, running: Arc<AtomicBool>, sent: Arc<AtomicU64>) {
    let mut order_id = 0u32;
    while running.load(Relaxed) {
        order_id += 1;
        let line = order_line(user_id, order_id);
        let mut frame = Vec::with_capacity(4 + line.len());
        frame.extend_from_slice(&(line.len() as u32).to_be_bytes());
        frame.extend_from_slice(line.as_bytes());
        if stream.write_all(&frame).is_err() {
            break;
        }
        sent.fetch_add(1, Relaxed);
        std::thread::sleep(Duration::from_micros(200));
    }
}

fn udp_writer(socket: UdpSocket, user_id: u32, running: Arc<AtomicBool>, sent: Arc<AtomicU64>) {
    let mut order_id = 0u32;
    while running.load(Relaxed) {
        order_id += 1;
        let line = order_line(user_id, order_id);
        if socket.send(line.as_bytes()).is_err() {
            break;
        }
        sent.fetch_add(1, Relaxed);
        std::thread::sleep(Duration::from_micros(200));
    }
}

fn order_line(user_id: u32, order_id: u32) -> String {
    let symbol = SYMBOLS[(order_id as usize + user_id as usize) % SYMBOLS.len()];
    let side = if order_id % 2 == 0 { "B" } else { "S" };
    let price = 100 + (order_id % 20);
    format!("N,{user_id},{symbol},{price},50,{side},{order_id}\n")
}
