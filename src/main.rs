//! int-activitypub binary entry point

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use int_activitypub::config::AppConfig;
use int_activitypub::data::{CachedSourceStorage, Database, SourceStorage};
use int_activitypub::event::{WriterPool, bus::WsQueueClient, bus::WsWriterClient};
use int_activitypub::federation::{HttpActivityPubClient, HttpWebFinger, Signer};
use int_activitypub::service::{
    EventPublisher, FederationService, LocalActors, QueueConsumer, RESTART_DELAY,
};
use int_activitypub::{AppState, build_internal_router, build_router};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Open storage, bus writers and federation clients
/// 4. Start the queue consumer (when configured)
/// 5. Serve the public and internal HTTP APIs until Ctrl-C
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = AppConfig::load()?;

    // 2. Initialize tracing/logging; RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "int_activitypub={level},tower_http={level}",
            level = config.log.filter_directive()
        ))
    });
    if config.log.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!(host = %config.api.http.host, "Starting int-activitypub...");
    int_activitypub::metrics::init_metrics();

    // 3. Storage
    let db = Arc::new(Database::connect(&config.db.uri, &config.db.table.name).await?);
    let sources: Arc<dyn SourceStorage> = Arc::new(CachedSourceStorage::new(
        db.clone(),
        config.api.source.cache.size,
        config.api.source.cache.ttl,
    ));
    tracing::info!("Database connected");

    // 4. Federation clients
    let signer = Arc::new(Signer::from_pem(&config.api.key.private)?);
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("int-activitypub/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()?;
    let client = Arc::new(HttpActivityPubClient::new(http_client.clone(), signer));
    let webfinger = Arc::new(HttpWebFinger::new(http_client));

    // 5. Bus writers
    let writers = Arc::new(WriterPool::new(
        Arc::new(WsWriterClient::new(config.api.writer.uri.clone())),
        config.api.writer.cache.size,
        config.api.writer.cache.ttl,
        config.api.writer.backoff,
    ));

    let actors = LocalActors::new(
        &config.api.http.base_url(),
        &config.api.actor.name,
        &config.api.key.public,
    );
    let federation = FederationService::new(
        sources,
        db.clone(),
        webfinger,
        client.clone(),
        writers,
        actors.clone(),
    );
    federation.refresh_gauges().await;
    let publisher = Arc::new(EventPublisher::new(client, actors));

    let shutdown = CancellationToken::new();
    let state = AppState {
        config: Arc::new(config.clone()),
        federation: federation.clone(),
        publisher: publisher.clone(),
        shutdown: shutdown.clone(),
    };

    // 6. Queue consumer
    let consumer = if config.api.queue.uri.is_empty() {
        tracing::info!("Queue URI not set; outbound queue consumer disabled");
        None
    } else {
        let consumer = QueueConsumer::new(
            Arc::new(WsQueueClient::new(config.api.queue.uri.clone())),
            federation.clone(),
            publisher,
            &config.api.queue.name,
            &config.api.queue.subj,
            config.api.queue.batch.size,
        );
        let token = shutdown.child_token();
        Some(tokio::spawn(async move {
            consumer.supervise(&token, RESTART_DELAY).await;
        }))
    };

    // 7. HTTP servers
    let public_addr = format!("0.0.0.0:{}", config.api.http.port);
    let internal_addr = format!("0.0.0.0:{}", config.api.port);
    let public_listener = tokio::net::TcpListener::bind(&public_addr).await?;
    let internal_listener = tokio::net::TcpListener::bind(&internal_addr).await?;
    tracing::info!("Public API listening on {}", public_addr);
    tracing::info!("Internal API listening on {}", internal_addr);
    tracing::info!("Public URL: {}", config.api.http.base_url());

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown requested"),
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
            }
            shutdown.cancel();
        }
    });

    let public = axum::serve(public_listener, build_router(state.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    let internal = axum::serve(internal_listener, build_internal_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    let served = tokio::try_join!(public, internal);
    shutdown.cancel();

    // 8. Teardown
    if let Some(handle) = consumer {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Queue consumer task failed");
        }
    }
    federation.close().await;
    db.close().await;
    tracing::info!("Stopped");

    served?;
    Ok(())
}
