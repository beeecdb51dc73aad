use std::sync::Arc;

use config::Config;
use queue::QueueSettings;
use service::VirtualHost;
use store::MessageStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod channel;
pub mod config;
pub mod error;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod service;
pub mod store;
pub mod subscription;
pub mod txn;

/// Returns a builder for the main application.
#[bon::builder(finish_fn = start)]
pub async fn run(
    store: Option<Arc<dyn MessageStore>>,
    #[builder(default)] queues: Vec<QueueSettings>,
) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("COURIER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("COURIER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let host = VirtualHost::connect_with()
        .config(config)
        .maybe_store(store)
        .call();

    for settings in queues {
        host.create_queue(settings)?;
    }

    host.recover().await?;

    let housekeeping = host.spawn_housekeeping();

    tracing::info!("courier started");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    host.close().await;
    housekeeping.abort();

    Ok(())
}
