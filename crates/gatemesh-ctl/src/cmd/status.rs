//! Node status and metrics commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    node_id: String,
    overlay_addr: String,
    http_addr: String,
    uptime_secs: u64,
    peers: PeerCounts,
    active_requests: usize,
    local_score: Score,
    score_threshold: f64,
    local_backend: bool,
}

#[derive(Deserialize)]
struct PeerCounts {
    connected: usize,
    stale: usize,
    joining: usize,
    max: usize,
}

#[derive(Deserialize)]
pub struct Score {
    pub cpu: f64,
    pub memory: f64,
    pub rps: f64,
    pub latency: f64,
    pub total: f64,
}

#[derive(Deserialize)]
struct MetricsResponse {
    local: NodeMetrics,
    peers: Vec<NodeMetrics>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct NodeMetrics {
    node_id: String,
    address: String,
    cpu_usage: f64,
    memory_usage: f64,
    requests_per_sec: f64,
    average_latency_ms: f64,
    active_requests: u64,
    error_rate: f64,
    timestamp: u64,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(host: &str, port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(host, port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Gatemesh Node Status");
    println!("═══════════════════════════════════════");
    println!("  Node ID          : {}", resp.node_id);
    println!("  Overlay address  : {}", resp.overlay_addr);
    println!("  HTTP address     : {}", resp.http_addr);
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!(
        "  Peers            : {} connected, {} stale, {} joining (max {})",
        resp.peers.connected, resp.peers.stale, resp.peers.joining, resp.peers.max
    );
    println!("  Active requests  : {}", resp.active_requests);
    println!("  Local score      : {:.3}", resp.local_score.total);
    println!("  Relay threshold  : {:.3}", resp.score_threshold);
    println!(
        "  Local backend    : {}",
        if resp.local_backend { "yes" } else { "no (relay only)" }
    );

    Ok(())
}

pub async fn cmd_metrics(host: &str, port: u16) -> Result<()> {
    let resp: MetricsResponse = get_json(&format!("{}/metrics", base_url(host, port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Load Metrics");
    println!("═══════════════════════════════════════");
    println!("  {:<24} {:>6} {:>6} {:>8} {:>9} {:>6}", "NODE", "CPU%", "MEM%", "REQ/S", "LAT(ms)", "ERR%");
    print_row("(local)", &resp.local);
    for m in &resp.peers {
        print_row(&m.node_id, m);
    }
    if resp.peers.is_empty() {
        println!("\n  No peer metrics received yet.");
    }

    Ok(())
}

fn print_row(label: &str, m: &NodeMetrics) {
    println!(
        "  {:<24} {:>6.1} {:>6.1} {:>8.2} {:>9.1} {:>6.1}",
        label, m.cpu_usage, m.memory_usage, m.requests_per_sec, m.average_latency_ms, m.error_rate
    );
}
