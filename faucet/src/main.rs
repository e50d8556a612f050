// PoW Faucet server
//
// Miner TCP protocol on `listen`, health and Prometheus metrics on `api_listen`.

use anyhow::Result;
use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse, routing::get, Json};
use serde_json::json;
use std::future::IntoFuture;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pow_faucet::config::FaucetConfig;
use pow_faucet::metrics::prometheus as metrics;
use pow_faucet::payout::{ClaimPipeline, ClaimQueue};
use pow_faucet::rewards::StaticRewardLimiter;
use pow_faucet::server::FaucetServer;
use pow_faucet::session::SessionManager;
use pow_faucet::shares::{PowValidator, ShareVerifier};
use pow_faucet::storage::{MarkStore, MemoryMarkStore, RedisMarkStore};

#[derive(Clone)]
struct ApiState {
    server: Arc<FaucetServer>,
    verifier: Arc<ShareVerifier>,
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.server.sessions().active_count().await,
        "connections": state.server.connection_count(),
        "validatorQueue": state.verifier.validator().queue_len(),
        "pendingVerifications": state.verifier.in_flight_count().await,
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

async fn mark_store(cfg: &FaucetConfig) -> Result<Arc<dyn MarkStore>> {
    match &cfg.redis_url {
        Some(url) => {
            let store = RedisMarkStore::new(url)?;
            match store.ping().await {
                Ok(()) => tracing::info!("✅ Connected to Redis mark store"),
                Err(e) => tracing::warn!("⚠️ Redis not reachable yet ({}), marks will retry per request", e),
            }
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("⚠️ No redis_url configured, session marks are kept in memory only");
            Ok(Arc::new(MemoryMarkStore::new()))
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ No SIGTERM handler ({}), waiting for Ctrl+C only", e);
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
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = Arc::new(FaucetConfig::load());
    tracing::info!(
        "🚀 PoW Faucet starting: params {}, {} nonces/share, reward {}",
        cfg.pow_params_string(),
        cfg.pow_nonce_count,
        cfg.pow_share_reward
    );

    let marks = mark_store(&cfg).await?;
    let validator = Arc::new(PowValidator::new(&cfg.pow_scrypt_params, cfg.validator_threads)?);
    tracing::info!("🧮 Share validator running on {} thread(s)", validator.threads());
    let claims: Arc<dyn ClaimPipeline> = Arc::new(ClaimQueue::new(cfg.faucet_balance));
    let rewards = Arc::new(StaticRewardLimiter::new(cfg.clone(), claims.clone()));
    let sessions = SessionManager::new(cfg.clone(), marks)?;
    let verifier = Arc::new(ShareVerifier::new(sessions.clone(), validator, rewards));
    let server = Arc::new(FaucetServer::new(cfg.clone(), sessions, verifier.clone(), claims));

    let api = axum::Router::new()
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .with_state(ApiState { server: server.clone(), verifier });
    let api_listener = tokio::net::TcpListener::bind(&cfg.api_listen).await?;
    tracing::info!("📡 Faucet API listening on {}", cfg.api_listen);

    tokio::select! {
        res = server.start() => {
            if let Err(e) = res {
                tracing::error!("❌ Faucet server stopped: {}", e);
                return Err(e);
            }
        }
        res = axum::serve(api_listener, api).with_graceful_shutdown(shutdown_signal()).into_future() => {
            res?;
        }
    }

    tracing::info!("🏁 PoW Faucet shut down cleanly");
    Ok(())
}
