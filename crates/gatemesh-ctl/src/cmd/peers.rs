//! Peer directory, scoring and selection commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, delete_json, get_json};
use super::status::Score;

#[derive(Deserialize)]
struct PeersResponse {
    peers: Vec<PeerView>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct PeerView {
    node_id: String,
    address: String,
    state: String,
    last_seen_secs: u64,
    stale_secs: Option<u64>,
    http_addr: Option<String>,
    rtt_ms: Option<f64>,
    score: f64,
}

pub async fn cmd_peers(host: &str, port: u16) -> Result<()> {
    let resp: PeersResponse = get_json(&format!("{}/peers", base_url(host, port))).await?;

    if resp.peers.is_empty() {
        println!("No peers yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Peers ({})", resp.peers.len());
    println!("═══════════════════════════════════════");

    for p in &resp.peers {
        println!("  ┌─ {}", p.node_id);
        println!("  │  overlay   : {}", p.address);
        println!("  │  http      : {}", p.http_addr.as_deref().unwrap_or("-"));
        println!("  │  state     : {}", p.state);
        match p.rtt_ms {
            Some(rtt) => println!("  │  rtt       : {:.1}ms", rtt),
            None => println!("  │  rtt       : -"),
        }
        println!("  │  score     : {:.3}", p.score);
        println!("  └─ last seen : {}s ago", p.last_seen_secs);
    }

    Ok(())
}

pub async fn cmd_peer_drop(host: &str, port: u16, node_id: &str) -> Result<()> {
    #[derive(Deserialize)]
    struct DropResponse {
        node_id: String,
        address: String,
    }

    let resp: DropResponse =
        delete_json(&format!("{}/peers/{}", base_url(host, port), node_id)).await?;
    println!("✓ Peer dropped: {} ({})", resp.node_id, resp.address);
    Ok(())
}

pub async fn cmd_scores(host: &str, port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ScoredPeer {
        node_id: String,
        score: Score,
    }

    #[derive(Deserialize)]
    struct ScoresResponse {
        local: Score,
        peers: Vec<ScoredPeer>,
    }

    let resp: ScoresResponse = get_json(&format!("{}/scores", base_url(host, port))).await?;

    println!("  {:<24} {:>6} {:>6} {:>6} {:>6} {:>7}", "NODE", "CPU", "MEM", "RPS", "LAT", "TOTAL");
    print_score("(local)", &resp.local);
    for p in &resp.peers {
        print_score(&p.node_id, &p.score);
    }
    Ok(())
}

fn print_score(label: &str, s: &Score) {
    println!(
        "  {:<24} {:>6.3} {:>6.3} {:>6.3} {:>6.3} {:>7.3}",
        label, s.cpu, s.memory, s.rps, s.latency, s.total
    );
}

pub async fn cmd_select(host: &str, port: u16) -> Result<()> {
    let resp: serde_json::Value = get_json(&format!("{}/select", base_url(host, port))).await?;

    let best = match resp["selection"]["node_id"].as_str() {
        Some(id) => id.to_string(),
        None => "(none, local)".to_string(),
    };
    println!("  Best peer : {}", best);
    println!("  Route now : {}", resp["route"].as_str().unwrap_or("?"));
    Ok(())
}
