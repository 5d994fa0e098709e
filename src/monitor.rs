//! `gatehouse monitor` — live dashboard reading the JSONL stats log written
//! by a running `gatehouse run`. Read-only: Ctrl-C closes the view, the
//! service keeps running.

use anyhow::Result;
use chrono::{TimeZone, Utc};

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::color;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn log_has_data(path: &str) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

pub fn run(log_path: &str, interval_secs: u64) -> Result<()> {
    if std::fs::metadata(log_path).is_err() {
        eprintln!("No stats log found at {}.", log_path);
        eprintln!();
        eprintln!("Start the gateway first:");
        eprintln!("  gatehouse run");
        eprintln!();
        eprintln!("Then run `gatehouse monitor` again.");
        return Ok(());
    }

    if !log_has_data(log_path) {
        println!("{}", color::yellow("Gateway recently started — first snapshot appears shortly..."));
        let mut waited = 0u32;
        loop {
            std::thread::sleep(std::time::Duration::from_secs(1));
            waited += 1;
            if log_has_data(log_path) {
                print!("\x1b[1A\x1b[2K");
                break;
            }
            if waited >= 30 {
                println!("{}", color::yellow("Still waiting for the first snapshot; check `gatehouse run`'s output."));
                return Ok(());
            }
        }
    }

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    println!("{}", color::bold("GATEHOUSE MONITOR  —  Ctrl-C to close  (gateway keeps running)"));
    println!();

    let mut lines_drawn = 0usize;

    while RUNNING.load(Ordering::SeqCst) {
        let snapshot = read_last_entry(log_path);

        if lines_drawn > 0 {
            print!("\x1b[{}A\x1b[0J", lines_drawn);
        }

        lines_drawn = match snapshot {
            Some(entry) => draw_dashboard(&entry),
            None => {
                println!("Waiting for first snapshot...");
                1
            }
        };
        std::io::stdout().flush().ok();

        let mut waited = 0u64;
        while waited < interval_secs && RUNNING.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_secs(1));
            waited += 1;
        }
    }

    println!();
    println!("View closed.  Gateway is still running in the background.");
    Ok(())
}

fn read_last_entry(path: &str) -> Option<serde_json::Value> {
    let content = std::fs::read_to_string(path).ok()?;
    let line = content.lines().rfind(|l| !l.is_empty())?;
    serde_json::from_str(line).ok()
}

fn draw_dashboard(entry: &serde_json::Value) -> usize {
    const W: usize = 88;
    let mut out: Vec<String> = Vec::new();

    let ts = entry["ts"].as_u64().unwrap_or(0) as i64;
    let time_str = Utc
        .timestamp_opt(ts, 0)
        .single()
        .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "—".into());

    let started_at = entry["started_at"].as_u64().unwrap_or(0) as i64;
    let uptime_str = if started_at > 0 {
        let secs = (ts - started_at).max(0) as u64;
        let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
        if h > 0 { format!("{h}h {m}m {s}s") } else if m > 0 { format!("{m}m {s}s") } else { format!("{s}s") }
    } else {
        "—".into()
    };

    out.push(color::bold(&"=".repeat(W)));
    out.push(color::bold_cyan(&format!("{:^W$}", format!("  GATEHOUSE STATS  {}  ", time_str))));
    out.push(color::bold(&"=".repeat(W)));
    out.push(color::dim(&format!("  Uptime: {}", uptime_str)));
    out.push(String::new());

    let stats = &entry["stats"];
    let get = |k: &str| stats[k].as_u64().unwrap_or(0);

    out.push(color::bold(&format!(
        "{:<28}  {:>12}  {:<28}  {:>12}",
        "RX packets", fmt_num(get("rx_packets")), "TX packets", fmt_num(get("tx_packets")),
    )));
    out.push(format!(
        "{:<28}  {:>12}  {:<28}  {:>12}",
        "RX bytes", fmt_num(get("rx_bytes")), "TX bytes", fmt_num(get("tx_bytes")),
    ));
    out.push(String::new());

    out.push(color::bold("DISPATCH"));
    out.push(format!(
        "  shard0: {:<10}  shard1: {:<10}  active clients: {}",
        fmt_num(get("shard0_dispatches")),
        fmt_num(get("shard1_dispatches")),
        get("active_clients"),
    ));
    out.push(String::new());

    let parse_errors = get("parse_errors");
    let admission_rejects = get("admission_rejects");
    let queue_full_drops = get("queue_full_drops");
    let dropped_queue_full = get("messages_dropped_queue_full");
    let dropped_inactive = get("messages_dropped_client_inactive");
    let drop_total = parse_errors + admission_rejects + queue_full_drops + dropped_queue_full + dropped_inactive;

    out.push(color::bold("ERRORS & DROPS"));
    let drops_line = format!(
        "  parse={parse_errors}  admission={admission_rejects}  input-queue-full={queue_full_drops}  \
         output-queue-full={dropped_queue_full}  client-inactive={dropped_inactive}"
    );
    out.push(if drop_total == 0 { color::green(&drops_line) } else { color::yellow(&drops_line) });
    out.push(String::new());

    out.push(color::dim(&format!(
        "poll: empty={}  full={}",
        fmt_num(get("poll_empty")),
        fmt_num(get("poll_full")),
    )));
    out.push(color::dim(&"-".repeat(W)));

    let count = out.len();
    for line in out {
        println!("{}", line);
    }
    count
}

fn fmt_num(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out.chars().rev().collect()
}
