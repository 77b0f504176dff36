use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::config::AppConfig;

/// Overlay process environment variables onto `config`.
pub fn apply_env_overrides(config: AppConfig) -> Result<AppConfig> {
    apply_overrides_from(config, |key| env::var(key).ok())
}

/// Overlay values returned by `lookup` onto `config`. Unset or empty values
/// leave the field alone; unparsable values are an error.
pub fn apply_overrides_from<F>(mut config: AppConfig, lookup: F) -> Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(uri) = var("AMQP_ADDR") {
        config.rabbitmq.uri = uri;
    }
    if let Some(raw) = var("RABBITMQ_CONNECT_TIMEOUT_MS") {
        config.rabbitmq.connection_timeout_ms = parse("RABBITMQ_CONNECT_TIMEOUT_MS", &raw)?;
    }
    if let Some(raw) = var("RABBITMQ_PREFETCH_COUNT") {
        config.rabbitmq.prefetch_count = parse("RABBITMQ_PREFETCH_COUNT", &raw)?;
    }
    if let Some(raw) = var("RABBITMQ_CONFIRM_MODE") {
        config.rabbitmq.confirm_mode = parse("RABBITMQ_CONFIRM_MODE", &raw)?;
    }
    if let Some(raw) = var("RABBITMQ_RECONNECT_DELAY_MS") {
        config.rabbitmq.reconnect_delay_ms = parse("RABBITMQ_RECONNECT_DELAY_MS", &raw)?;
    }
    if let Some(raw) = var("RABBITMQ_RECONNECT_JITTER") {
        config.rabbitmq.reconnect_jitter = parse("RABBITMQ_RECONNECT_JITTER", &raw)?;
    }
    if let Some(queue) = var("IMAGE_PROCESSING_QUEUE") {
        config.queues.image_processing = queue;
    }
    if let Some(queue) = var("PRODUCT_QUEUE") {
        config.queues.product = queue;
    }
    if let Some(raw) = var("CACHE_TTL_SECONDS") {
        config.catalog.cache_ttl_seconds = parse("CACHE_TTL_SECONDS", &raw)?;
    }

    Ok(config)
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{} has an invalid value: {:?}", key, raw))
}
