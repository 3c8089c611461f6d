mod admin;
mod bot;
mod broadcast;
mod config;
mod handler;
mod identity;
mod platform;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;
mod web;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::Admin;
use crate::bot::{Bot, Outbox};
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::handler::fallback::FallbackHandler;
use crate::handler::keyword::KeywordEngine;
use crate::handler::HandlerChain;
use crate::identity::{IdentityCache, IdentityResolver, SyncOptions};
use crate::platform::lark::LarkClient;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Initialize logging; RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Configuration loaded from: {}", config_path.display());
    info!("  App: {}", config.lark.app_id);
    info!("  Database: {}", config.database.path.display());
    info!("  Port: {}", config.server.port);

    let store = Store::open(&config.database.path)?;
    let broadcaster = Broadcaster::new();

    let lark = Arc::new(LarkClient::new(config.lark.clone())?);
    if let Err(e) = lark.fetch_bot_info().await {
        warn!("Could not load bot info, mentions will not be detected: {:#}", e);
    }

    let resolver = IdentityResolver::new(
        IdentityCache::new(),
        Arc::new(store.clone()),
        lark.clone(),
        SyncOptions::from(&config.identity),
    );

    let engine = Arc::new(KeywordEngine::new(Vec::new()));
    let chain = HandlerChain::new(vec![engine.clone(), Arc::new(FallbackHandler)]);
    info!("Handler chain: {:?}", chain.names());

    let outbox = Arc::new(Outbox::new(lark.clone(), store.clone(), broadcaster.clone()));
    let scheduler = Arc::new(
        Scheduler::new(outbox.clone(), Arc::new(store.clone()))
            .await?
            .with_send_timeout(Duration::from_secs(config.scheduler.send_timeout_secs)),
    );

    let admin = Arc::new(Admin::new(
        store.clone(),
        engine,
        scheduler.clone(),
        resolver.clone(),
        outbox.clone(),
    ));
    if let Err(e) = admin.reload_rules().await {
        warn!("Failed to load keyword rules: {:#}", e);
    }
    admin.load_tasks().await?;

    scheduler.start().await?;
    scheduler::tasks::register_builtin_tasks(&scheduler, store.clone(), &config.scheduler).await?;

    let bot = Arc::new(Bot::new(
        resolver,
        chain,
        outbox,
        store,
        broadcaster.clone(),
    ));
    let state = AppState {
        bot,
        admin,
        broadcaster,
        bot_open_id: lark.bot_open_id(),
        verification_token: config.lark.verification_token.clone(),
    };

    info!("Bot is starting...");
    web::serve(state, config.server.port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("Shutdown signal received");
    })
    .await?;

    scheduler.stop().await?;
    Ok(())
}
