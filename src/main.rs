use anyhow::Context as _;
use serenity::Client;
use serenity::all::GatewayIntents;
use std::sync::Arc;
use tracing::{error, info};

mod accounting;
mod config;
mod duration;
mod error;
mod logging;
mod report;
mod session;
mod store;
mod voice_tracker;
use crate::accounting::Accounting;
use crate::config::{Config, StorageConfig};
use crate::error::StoreError;
use crate::session::SystemClock;
use crate::store::{JsonFileStore, PostgresStore, TimeStore};
use crate::voice_tracker::VoiceHandler;

async fn open_store(storage: &StorageConfig) -> Result<Arc<dyn TimeStore>, StoreError> {
    match storage {
        StorageConfig::File { path } => {
            info!(path = %path.display(), "using JSON file storage");
            Ok(Arc::new(JsonFileStore::new(path.clone())))
        }
        StorageConfig::Postgres { url, require_ssl } => {
            let store = PostgresStore::connect(url, *require_ssl).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init();

    let config = Config::from_env().context("invalid configuration")?;
    let store = open_store(&config.storage)
        .await
        .context("failed to open storage")?;
    let accounting = Arc::new(
        Accounting::load(store, Arc::new(SystemClock))
            .await
            .context("failed to load stored voice time")?,
    );

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(VoiceHandler::new(accounting.clone(), &config))
        .await
        .context("failed to build client")?;

    let shard_manager = client.shard_manager.clone();
    let on_signal = accounting.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for shutdown signal");
            return;
        }
        info!("shutting down, saving data");
        match on_signal.flush().await {
            Ok(users) => info!(users, "final flush complete"),
            Err(e) => error!(error = %e, "final flush failed"),
        }
        shard_manager.shutdown_all().await;
    });

    info!("starting bot");
    if let Err(why) = client.start().await {
        error!(error = %why, "client error");
        if let Err(e) = accounting.flush().await {
            error!(error = %e, "flush after client error failed");
        }
        return Err(why.into());
    }
    Ok(())
}
