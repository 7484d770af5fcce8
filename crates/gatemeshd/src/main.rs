//! gatemeshd: gateway overlay node.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use gatemesh_core::config::GatemeshConfig;
use gatemesh_core::NodeId;
use gatemesh_services::{
    Balancer, Collector, NetworkCore, NetworkSettings, PeerDirectory, TcpTransport, Weights,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // ── Config ───────────────────────────────────────────────────────────────
    if let Err(e) = GatemeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = GatemeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GatemeshConfig::default()
    });

    let node_id = if config.node.node_id.is_empty() {
        NodeId::generate()
    } else {
        NodeId::new(config.node.node_id.clone())
    };
    let overlay_addr = config.advertise_addr().to_string();
    let http_addr = config.http_advertise_addr();
    tracing::info!(
        node_id = %node_id,
        overlay = %overlay_addr,
        http = %http_addr,
        max_peers = config.node.max_peers,
        behind_nat = config.nat.behind_nat,
        "gatemeshd starting"
    );
    if overlay_addr
        .parse::<SocketAddr>()
        .is_ok_and(|addr| addr.ip().is_unspecified())
    {
        tracing::warn!(
            overlay = %overlay_addr,
            "advertised host is unspecified; peers will record the address they observe"
        );
    }

    // ── State ────────────────────────────────────────────────────────────────
    let collector = Arc::new(Collector::new(
        node_id.clone(),
        http_addr,
        config.window(),
        Weights::from(config.metrics.weights),
    ));
    let directory = Arc::new(PeerDirectory::new(
        node_id,
        overlay_addr,
        config.node.max_peers,
    ));
    let transport = Arc::new(TcpTransport::new(config.request_timeout()));
    let core = Arc::new(NetworkCore::new(
        collector.clone(),
        directory.clone(),
        transport,
        NetworkSettings::from(&config),
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let listener = TcpListener::bind(&config.node.listen_addr)
        .await
        .with_context(|| format!("binding overlay listener on {}", config.node.listen_addr))?;

    let overlay_task = tokio::spawn(gatemesh_services::serve(
        listener,
        core.clone(),
        shutdown_tx.subscribe(),
    ));

    let heartbeat_task = {
        let core = core.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { core.run_heartbeat(shutdown).await })
    };

    let api_task = {
        let mut state = gatemesh_api::ApiState::new(
            collector,
            directory,
            Balancer::new(config.balancer.score_threshold),
        )
        .with_relay_timeout(config.relay_timeout());
        if !config.node.upstream_url.is_empty() {
            tracing::info!(upstream = %config.node.upstream_url, "local backend enabled");
            let backend = gatemesh_api::relay::upstream_router(
                state.http.clone(),
                config.node.upstream_url.clone(),
                config.relay_timeout(),
            );
            state = state.with_local(backend);
        }
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.node.http_port));
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = gatemesh_api::serve(state, addr, shutdown).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        })
    };

    let mut shutdown_rx = shutdown_tx.subscribe();

    if !config.node.seed_peers.is_empty() {
        let outcome = core.bootstrap(&config.node.seed_peers).await;
        if !outcome.is_joined() {
            tracing::warn!(
                seeds = config.node.seed_peers.len(),
                failures = outcome.failures.len(),
                "could not join any peer, running alone"
            );
        }
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = overlay_task        => tracing::error!("overlay listener exited: {:?}", r),
        r = heartbeat_task      => tracing::error!("heartbeat exited: {:?}", r),
        r = api_task            => tracing::error!("HTTP server exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    core.leave().await;
    Ok(())
}
