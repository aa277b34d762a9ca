//! `hub-relayd` — cloud-side reverse-tunnel relay node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hub_relay::connection_store::{InMemoryConnectionStore, LookupCache, RedisConnectionStore};
use hub_relay::hub_directory::{HubDirectory, InMemoryHubDirectory};
use hub_relay::push_fanout::provider::{PushProvider, WebPushProvider};
use hub_relay::push_fanout::vapid::VapidKeys;
use hub_relay::push_fanout::PushFanout;
use hub_relay::user_directory::{InMemoryUserDirectory, UserDirectory};
use hub_relay::{AppState, Config};

static SHUTDOWN: std::sync::LazyLock<Arc<AtomicBool>> = std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(Config::parse());
    log::info!(
        "[hub-relayd] starting: internal_addr={} public_addr={}",
        config.internal_addr, config.public_addr
    );

    let connection_store: Arc<dyn hub_relay::connection_store::ConnectionStore> =
        match RedisConnectionStore::connect(&config.redis_url).await {
            Ok(redis) => {
                log::info!("[hub-relayd] connected to Redis at {}", config.redis_url);
                Arc::new(LookupCache::new(Arc::new(redis), config.lookup_cache_ttl()))
            }
            Err(e) => {
                log::warn!(
                    "[hub-relayd] Redis unavailable ({e:#}), falling back to single-node in-memory store \
                     — do NOT run more than one node against this configuration"
                );
                Arc::new(LookupCache::new(Arc::new(InMemoryConnectionStore::new()), config.lookup_cache_ttl()))
            }
        };

    let hub_directory: Arc<dyn HubDirectory> = Arc::new(InMemoryHubDirectory::new());
    let user_directory: Arc<dyn UserDirectory> = Arc::new(InMemoryUserDirectory::new());

    let vapid = VapidKeys::generate().context("failed to generate VAPID keypair")?;
    log::info!("[hub-relayd] VAPID public key: {}", vapid.public_key_base64url());
    let push_provider: Arc<dyn PushProvider> =
        Arc::new(WebPushProvider::new(vapid.private_key_base64url().to_string(), "mailto:ops@example.org".to_string()));
    let push_fanout = Arc::new(PushFanout::new(Arc::clone(&user_directory), push_provider));

    let state = AppState::new(Arc::clone(&config), connection_store, hub_directory, user_directory, push_fanout);
    let app = hub_relay::http::router(state);

    let shutdown = Arc::clone(&SHUTDOWN);
    ctrlc::set_handler(move || {
        log::info!("[hub-relayd] shutdown signal received");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let listener = tokio::net::TcpListener::bind(&config.public_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.public_addr))?;
    log::info!("[hub-relayd] listening on {}", config.public_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("server error")?;

    log::info!("[hub-relayd] stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}
