use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rollup_bot::config::Config;
use rollup_bot::rollup::RollupEngine;
use rollup_bot::server::{build_router, AppState};
use rollup_bot::store::{HttpTaskStore, StaticTokenProvider, TaskStore};
use rollup_bot::worker::{Dispatcher, DispatcherConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rollup_bot=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("reading configuration")?;

    let auth = Arc::new(StaticTokenProvider::new(config.api_token.clone()));
    let store: Arc<dyn TaskStore> = Arc::new(
        HttpTaskStore::new(
            config.base_url.clone(),
            auth,
            config.retry_config(),
            config.request_timeout,
        )
        .context("building task store client")?,
    );

    let engine = Arc::new(RollupEngine::new(store.clone(), config.rollup_fields()));
    let dispatcher = Arc::new(Dispatcher::new(
        engine,
        store,
        DispatcherConfig {
            idle_eviction: config.idle_eviction,
            ..DispatcherConfig::default()
        },
    ));

    // Background reaping of idle worker handles.
    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await });
    }

    let app = build_router(AppState::new(
        config.webhook_secret.as_bytes().to_vec(),
        dispatcher.clone(),
    ));

    tracing::info!(addr = %config.bind_addr, "listening");

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("binding listen address")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(dispatcher))
        .await
        .context("serving")?;

    Ok(())
}

/// Resolves on Ctrl-C and drains the worker queues before the server stops.
async fn shutdown_signal(dispatcher: Arc<Dispatcher>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    dispatcher.shutdown_all().await;
}
