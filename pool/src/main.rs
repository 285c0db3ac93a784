// Ergo pool: PPLNS + SOLO stratum, Autolykos2 validation, crash-safe payouts

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse, routing::get, Json};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ergo_pool::blockchain::{ErgoNodeClient, NodeClient, WalletClient};
use ergo_pool::config::{Config, StoreBackend};
use ergo_pool::metrics::prometheus as metrics;
use ergo_pool::notify::WebhookNotifier;
use ergo_pool::payout::{
    MaturityTracker, PayoutConfig, PayoutManager, PayoutScheduler, PoolWallet, ScheduleConfig,
};
use ergo_pool::pplns::{RewardConfig, RewardDistributor};
use ergo_pool::shares::{BlockIdRetry, ShareProcessor, ShareValidator};
use ergo_pool::storage::{MemoryStore, PostgresStore, Store};
use ergo_pool::stratum::{ConnectionSettings, StratumServer, StratumSettings};

#[derive(Clone)]
struct ApiState {
    store: Arc<dyn Store>,
    server: Arc<StratumServer>,
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let store_ok = state.store.ping().await.is_ok();
    let counts = state.server.session_counts(None).await;
    Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "store": store_ok,
        "connected": counts.connected,
        "authorized": counts.authorized,
        "network_difficulty": state.server.network_difficulty(),
    }))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn open_store(cfg: &Config) -> Result<Arc<dyn Store>> {
    match cfg.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store, nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Postgres => {
            let store = PostgresStore::connect(&cfg.database_url, cfg.db_timeout())
                .await
                .context("database connection failed")?;
            store.init_schema().await.context("schema setup failed")?;
            tracing::info!("✅ Database ready");
            Ok(Arc::new(store))
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
            },
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C, shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    println!("🚀 Ergo pool v{}", env!("CARGO_PKG_VERSION"));

    let store = open_store(&cfg).await?;

    let node_client = Arc::new(ErgoNodeClient::new(
        &cfg.node_url,
        &cfg.node_api_key,
        cfg.node_timeout(),
        cfg.payment_timeout(),
    ));
    let node: Arc<dyn NodeClient> = node_client.clone();
    let wallet_client: Arc<dyn WalletClient> = node_client;

    let wallet = PoolWallet::new(wallet_client, cfg.wallet_pass.as_deref());
    if let Some(w) = &wallet {
        // a previous process may have died with the wallet unlocked
        w.lock().await;
    }

    match node.info().await {
        Ok(info) => tracing::info!(
            height = info.full_height,
            headers = info.headers_height,
            difficulty = info.difficulty,
            peers = info.peers_count,
            "Connected to Ergo node"
        ),
        Err(e) => tracing::warn!(error = %e, "Ergo node not reachable yet"),
    }

    let distributor = Arc::new(RewardDistributor::new(
        store.clone(),
        node.clone(),
        RewardConfig {
            pool_fee_bps: cfg.pool_fee_bps(),
            solo_fee_bps: cfg.solo_fee_bps(),
            pplns_factor: cfg.pplns_factor,
            pool_address: cfg.pool_address.clone(),
        },
    ));

    let mut processor = ShareProcessor::new(store.clone(), node.clone(), distributor.clone(), BlockIdRetry::default());
    if let Some(url) = &cfg.webhook_url {
        match WebhookNotifier::new(url, Duration::from_secs(10)) {
            Ok(n) => processor = processor.with_notifier(Arc::new(n)),
            Err(e) => tracing::warn!(error = %e, "Block webhook disabled"),
        }
    }

    let settings = StratumSettings {
        host: cfg.stratum_host.clone(),
        pplns_port: cfg.pplns_port,
        solo_port: cfg.solo_port,
        poll_interval: cfg.poll_interval(),
        extranonce2_size: cfg.extranonce2_size,
        job_history: cfg.job_history,
        connection: ConnectionSettings {
            retarget_interval: cfg.vardiff.retarget_time,
            ..Default::default()
        },
        vardiff: cfg.vardiff,
        guard: cfg.guard,
        ..Default::default()
    };
    let server = StratumServer::new(
        settings,
        node.clone(),
        Arc::new(processor),
        ShareValidator::with_default_parallelism(),
    );

    let stratum = server.clone();
    tokio::spawn(async move {
        if let Err(e) = stratum.start().await {
            tracing::error!(error = %e, "Stratum server failed to start");
        }
    });

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(PayoutScheduler::new(
        MaturityTracker::new(store.clone(), node.clone(), distributor, cfg.confirmations),
        PayoutManager::new(
            store.clone(),
            wallet.clone(),
            PayoutConfig {
                min_payout: cfg.min_payout,
                max_per_batch: cfg.payout_max_per_batch,
                pool_address: cfg.pool_address.clone(),
                ..Default::default()
            },
        ),
        store.clone(),
        ScheduleConfig {
            interval: cfg.payout_interval(),
            share_retention: cfg.share_retention(),
            ..Default::default()
        },
    ));
    let scheduler_task = scheduler.start(shutdown.clone());

    let api = axum::Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .with_state(ApiState { store, server: server.clone() });
    let listener = tokio::net::TcpListener::bind(&cfg.metrics_listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.metrics_listen))?;
    tracing::info!(
        pplns = cfg.pplns_port,
        solo = cfg.solo_port,
        metrics = %cfg.metrics_listen,
        payouts = wallet.is_some(),
        "📡 Pool running"
    );

    axum::serve(listener, api)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("metrics server failed")?;

    shutdown.cancel();
    let _ = scheduler_task.await;
    if let Some(w) = &wallet {
        w.lock().await;
    }
    server.stop().await;

    tracing::info!("🏁 Pool shut down cleanly");
    Ok(())
}
