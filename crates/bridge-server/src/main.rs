//! Bridge server entry point: load configuration, bootstrap storage, wire
//! the service layer, and serve the HTTP surface until shut down.
//!
//! Tracing initialization follows the `tracing_subscriber::registry()` +
//! `EnvFilter` + `fmt::layer()` pattern used across the pack's axum-style
//! services (the companion server itself only reaches for the bare `log`
//! facade, since it reports through Tauri's own event log instead).

use std::net::SocketAddr;
use std::sync::Arc;

use bridge_server::cache::{Cache, SqliteCache};
use bridge_server::config::Config;
use bridge_server::db::pool::create_pool;
use bridge_server::db::user_credential;
use bridge_server::http::{self, AppState};
use bridge_server::models::Principal;
use bridge_server::services::device_flow::DeviceFlowService;
use bridge_server::services::patrol_score::PatrolScoreService;
use bridge_server::services::rate_limiter::RateLimiter;
use bridge_server::services::score_update::ScoreUpdateService;
use bridge_server::services::token_refresh;
use bridge_server::services::upstream_client::{UpstreamClient, UpstreamClientConfig};
use bridge_server::services::web_flow::WebFlowService;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
const TOKEN_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);
    init_tracing(&config);

    let pool = create_pool(&config.database_url).await?;
    let cache: Arc<dyn Cache> = Arc::new(SqliteCache::new(pool.clone()));
    let upstream = Arc::new(UpstreamClient::new(
        UpstreamClientConfig {
            base_url: config.upstream_base_url.clone(),
            client_id: config.upstream_client_id.clone(),
            client_secret: config.upstream_client_secret.clone(),
        },
        cache.clone(),
    )?);
    let rate_limiter = RateLimiter::new(cache.clone());

    let device_flow = Arc::new(DeviceFlowService::new(
        pool.clone(),
        cache.clone(),
        rate_limiter.clone(),
        upstream.clone(),
        config.clone(),
    ));
    let web_flow = Arc::new(WebFlowService::new(pool.clone(), cache.clone(), upstream.clone(), config.clone()));
    let patrol_score = Arc::new(PatrolScoreService::new(pool.clone(), cache.clone(), upstream.clone()));
    let score_update = Arc::new(ScoreUpdateService::new(pool.clone(), cache.clone(), upstream.clone()));

    let state = AppState {
        pool: pool.clone(),
        cache: cache.clone(),
        config: config.clone(),
        rate_limiter,
        device_flow: device_flow.clone(),
        web_flow,
        patrol_score,
        score_update,
    };

    let shutdown = CancellationToken::new();
    spawn_cleanup_job(device_flow, shutdown.clone());
    spawn_token_refresh_job(pool, upstream, shutdown.clone());
    spawn_shutdown_signal_listener(shutdown.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    http::serve(addr, state, shutdown).await?;
    Ok(())
}

/// Reap expired device codes and authorization sessions, and sweep expired
/// cache entries, on a fixed interval.
fn spawn_cleanup_job(device_flow: Arc<DeviceFlowService>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match device_flow.cleanup_expired().await {
                        Ok(count) if count > 0 => tracing::info!(count, "cleanup swept expired records"),
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "cleanup sweep failed"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

/// Proactively refresh upstream tokens for every active credential within
/// the refresh threshold, so the first admin-UI or device request after a
/// long idle period doesn't pay for a synchronous refresh round trip.
fn spawn_token_refresh_job(
    pool: bridge_server::db::pool::DbPool,
    upstream: Arc<UpstreamClient>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TOKEN_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = refresh_stale_credentials(&pool, &upstream).await {
                        tracing::warn!(error = %err, "background token refresh sweep failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

async fn refresh_stale_credentials(
    pool: &bridge_server::db::pool::DbPool,
    upstream: &Arc<UpstreamClient>,
) -> Result<(), bridge_server::error::AppError> {
    let credentials = user_credential::list_active(pool).await?;
    let now = chrono::Utc::now();
    for cred in credentials {
        if !cred.token_needs_refresh(now) {
            continue;
        }
        let principal = Principal::from_user_credential(&cred);
        let pool = pool.clone();
        let osm_user_id = cred.osm_user_id.clone();
        let pool_revoke = pool.clone();
        let osm_user_id_revoke = osm_user_id.clone();
        let result = token_refresh::refresh_token(
            upstream,
            principal.refresh_token(),
            move |access, refresh, expiry| {
                let pool = pool.clone();
                let osm_user_id = osm_user_id.clone();
                async move {
                    user_credential::upsert(&pool, &osm_user_id, &access, &refresh, expiry).await?;
                    Ok(())
                }
            },
            move || {
                let pool = pool_revoke.clone();
                let osm_user_id = osm_user_id_revoke.clone();
                async move {
                    user_credential::mark_revoked(&pool, &osm_user_id).await?;
                    Ok(())
                }
            },
        )
        .await;
        if let Err(err) = result {
            tracing::warn!(osm_user_id = %cred.osm_user_id, error = %err, "background token refresh failed");
        }
    }
    Ok(())
}

fn spawn_shutdown_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
            _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
}
