// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! voicebridge server: AudioSocket listener plus the registration API.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use voicebridge::config::BridgeConfig;
use voicebridge::error::BridgeError;
use voicebridge::flows::{FlowEngine, InMemoryFlowStateStore};
use voicebridge::services::{CloudConnector, ProviderConnector};
use voicebridge::session::BridgeContext;
use voicebridge::transports::AudioSocketServer;

#[tokio::main]
async fn main() -> Result<(), BridgeError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,voicebridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(BridgeConfig::from_env()?);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config,
        "voicebridge starting"
    );

    let connector: Arc<dyn ProviderConnector> = Arc::new(CloudConnector::new(Arc::clone(&config)));
    let mut engine = FlowEngine::new(Arc::new(InMemoryFlowStateStore::new()));
    match connector.llm(None) {
        Some(llm) => engine = engine.with_llm(llm),
        None => tracing::warn!("no LLM configured; aiResponse and branch nodes will fail"),
    }
    let ctx = Arc::new(BridgeContext::new(
        Arc::clone(&config),
        connector,
        Arc::new(engine),
    ));

    let shutdown = CancellationToken::new();
    ctx.spawn_registration_sweeper(shutdown.child_token());

    let audiosocket = AudioSocketServer::bind(config.audiosocket_bind, Arc::clone(&ctx)).await?;
    let audiosocket_task = tokio::spawn(audiosocket.serve(shutdown.child_token()));

    let http_listener = TcpListener::bind(config.http_bind).await?;
    tracing::info!("http: listening on {}", http_listener.local_addr()?);
    let app = voicebridge::http::router(Arc::clone(&ctx));
    let http_shutdown = shutdown.child_token();
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl-C: {}", e);
    }
    tracing::info!("shutting down");
    shutdown.cancel();
    let _ = audiosocket_task.await;
    ctx.close_all("server shutdown").await;
    match http_task.await {
        Ok(Err(e)) => tracing::warn!("http server error: {}", e),
        Err(e) => tracing::warn!("http task failed: {}", e),
        Ok(Ok(())) => {}
    }
    tracing::info!("voicebridge stopped");
    Ok(())
}
