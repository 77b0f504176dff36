use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use catalog_rabbitmq::config::{self, CONFIG_FILE_NAME};
use catalog_rabbitmq::rabbitmq::{
    spawn_supervised, ConnectionManager, ConsumerLoop, ImageProcessingHandler, LapinDialer,
    LoggingImageProcessor, QueueDescriptor,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    if let Some(flag) = args.next() {
        if flag == "--write-default-config" {
            let path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            return config::create_default_config_file(&path);
        }
        anyhow::bail!("Unknown argument: {}", flag);
    }

    let config = config::load_config().context("Failed to load configuration")?;
    info!(queue = %config.queues.image_processing, "Configuration loaded");

    let dialer = LapinDialer::new(&config.rabbitmq.uri, config.connect_timeout(), config.channel_config());
    let connection_manager = Arc::new(
        ConnectionManager::connect(dialer)
            .await
            .context("Failed to connect to RabbitMQ at startup")?,
    );

    let policy = config.reconnect_policy();
    let consumer = Arc::new(ConsumerLoop::new(
        connection_manager.clone(),
        ImageProcessingHandler::new(LoggingImageProcessor),
        QueueDescriptor::durable(&config.queues.image_processing),
        policy,
    ));

    let shutdown = CancellationToken::new();
    let supervisor = spawn_supervised("image-processing-consumer", policy.delay(), shutdown.clone(), {
        let shutdown = shutdown.clone();
        move || {
            let consumer = consumer.clone();
            let shutdown = shutdown.clone();
            async move { consumer.run(shutdown).await }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    shutdown.cancel();
    if let Err(e) = supervisor.await {
        error!(error = %e, "Supervisor task failed");
    }
    connection_manager.close().await;

    info!("Shutdown complete");
    Ok(())
}
