//! Service wiring: bring up the store, daemons and relay, start the
//! background loops, and drain gracefully on shutdown.

use std::sync::Arc;
use std::time::Duration;

use daemons::DaemonManager;
use relay::RelayClient;
use store::{AssetType, Store};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::{error, info, warn};

use crate::assets::AssetManager;
use crate::config::Config;
use crate::constants::{
    GRACEFUL_SHUTDOWN_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, INVENTORY_MONITOR_INTERVAL_SECS,
    RECONCILIATION_INTERVAL_SECS, SETTLEMENT_INTERVAL_SECS, SHUTDOWN_PROGRESS_INTERVAL_SECS,
    SWEEPER_INTERVAL_SECS,
};
use crate::dispatcher::Dispatcher;
use crate::error::{GatewayError, Result};
use crate::lightning::LightningManager;
use crate::outbound::RelayNotifier;
use crate::session::SessionManager;
use crate::settlement::SettlementCoordinator;
use crate::state::SharedState;
use crate::vtxo::VtxoManager;

pub async fn start(config: Config) -> Result<()> {
    info!("🚀 Starting Ark Relay Gateway");

    let store = Store::connect(&config.database_url, config.database_max_connections).await?;
    store.create_schema().await?;

    let daemons = DaemonManager::new(&config.daemon_config())
        .map_err(|e| GatewayError::BackendUnavailable(e.to_string()))?;
    let health = daemons.health().await;
    if !health.all_healthy() {
        warn!(
            "⚠️ not all daemons are healthy yet: arkd={} tapd={} lnd={}",
            health.arkd, health.tapd, health.lnd
        );
    }

    let relay = Arc::new(
        RelayClient::connect(&config.relay_secret_key, &config.relay_urls).await?,
    );
    info!("🔑 Gateway identity: {}", relay.public_key());
    let notifier = Arc::new(RelayNotifier::new(relay.clone()));

    let config = Arc::new(config);
    let state = SharedState::new(
        store,
        daemons.ark(),
        daemons.tap(),
        daemons.lightning(),
        notifier,
        config.clone(),
    );

    // the native fee asset always exists
    let assets = AssetManager::new(state.clone());
    assets
        .ensure_asset(
            &config.native_asset_id,
            "Gateway Bitcoin",
            &config.native_asset_id,
            AssetType::Native,
        )
        .await?;

    // inbound pipeline: relay -> channel -> dispatcher
    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    {
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(err) = relay.run_inbound(inbound_tx).await {
                error!("relay inbound loop ended: {err}");
            }
        });
    }
    {
        let dispatcher = Dispatcher::new(state.clone());
        tokio::spawn(async move { dispatcher.run(inbound_rx).await });
    }

    spawn_loops(&state);
    install_signal_handlers(&state);

    info!("✅ Gateway initialized, serving intents");

    // park until shutdown is requested, then drain
    while !state.is_shutting_down() {
        sleep(Duration::from_millis(250)).await;
    }
    shutdown(&state, &relay).await
}

fn spawn_loops(state: &SharedState) {
    // expiry sweeper: sessions, challenges
    {
        let state = state.clone();
        let sessions = SessionManager::new(state.clone());
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(SWEEPER_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if state.is_shutting_down() {
                    break;
                }
                if let Err(err) = sessions.sweep_expired().await {
                    warn!("session sweeper error: {err}");
                }
                match store::challenges::delete_expired(state.store.connection(), chrono::Utc::now())
                    .await
                {
                    Ok(0) => {}
                    Ok(n) => info!("dropped {n} expired challenges"),
                    Err(err) => warn!("challenge sweeper error: {err}"),
                }
            }
        });
    }

    // VTXO expiry sweeper
    {
        let state = state.clone();
        let vtxo = VtxoManager::new(state.clone());
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(SWEEPER_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if state.is_shutting_down() {
                    break;
                }
                if let Err(err) = vtxo.sweep_expired().await {
                    warn!("vtxo sweeper error: {err}");
                }
            }
        });
    }

    // inventory monitor
    {
        let state = state.clone();
        let vtxo = VtxoManager::new(state.clone());
        let assets = AssetManager::new(state.clone());
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(INVENTORY_MONITOR_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if state.is_shutting_down() {
                    break;
                }
                let active = match assets.list_assets().await {
                    Ok(list) => list.into_iter().map(|a| a.asset_id).collect::<Vec<_>>(),
                    Err(err) => {
                        warn!("inventory monitor could not list assets: {err}");
                        continue;
                    }
                };
                if let Err(err) = vtxo.check_inventory(&active).await {
                    warn!("inventory monitor error: {err}");
                }
            }
        });
    }

    // hourly L1 settlement
    {
        let state = state.clone();
        let settlement = SettlementCoordinator::new(state.clone());
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(SETTLEMENT_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if state.is_shutting_down() {
                    break;
                }
                if let Err(err) = settlement.run_once().await {
                    warn!("settlement run failed: {err}");
                }
            }
        });
    }

    // Lightning reconciliation watcher
    {
        let state = state.clone();
        let lightning = LightningManager::new(state.clone());
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(RECONCILIATION_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if state.is_shutting_down() {
                    break;
                }
                if let Err(err) = lightning.reconcile().await {
                    warn!("invoice reconciliation error: {err}");
                }
            }
        });
    }

    // heartbeat
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if state.is_shutting_down() {
                    break;
                }
                info!("💓 {}", state.metrics.snapshot().summary());
            }
        });
    }
}

fn install_signal_handlers(state: &SharedState) {
    let state = state.clone();
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                error!("failed to install SIGINT handler: {err}");
                return;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = sigint.recv() => {
                warn!("⚠️ SIGINT received, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                warn!("⚠️ SIGTERM received, initiating graceful shutdown");
            }
        }
        state.set_shutdown();
    });
}

/// Drain in-flight ceremonies for the grace period, then cancel the rest.
async fn shutdown(state: &SharedState, relay: &RelayClient) -> Result<()> {
    info!("🛑 Shutting down, draining in-flight ceremonies");
    let sessions = SessionManager::new(state.clone());
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS);
    let mut progress = interval(Duration::from_secs(SHUTDOWN_PROGRESS_INTERVAL_SECS));

    loop {
        let active = store::sessions::count_active(state.store.connection()).await?;
        if active == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("grace period over with {active} sessions still active, cancelling");
            for session in store::sessions::list_active(state.store.connection()).await? {
                if let Err(err) = sessions.cancel(&session.session_id).await {
                    warn!("could not cancel {}: {err}", session.session_id);
                }
            }
            break;
        }
        progress.tick().await;
        info!("⏳ waiting for {active} sessions to finish");
    }

    relay.shutdown().await;
    info!("✅ Gateway stopped");
    Ok(())
}
