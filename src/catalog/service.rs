use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::ProductCache;
use super::store::{ProductRepository, StoreError};
use crate::config::AppConfig;
use crate::models::{Product, ProductFilter, User};
use crate::rabbitmq::{AmqpDialer, ConnectionManager, Publisher, RabbitMQError};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Product '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Product stored but not published: {0}")]
    Publish(#[from] RabbitMQError),
}

impl CatalogError {
    /// HTTP status the request layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            CatalogError::InvalidRequest(_) => 400,
            CatalogError::NotFound(_) => 404,
            CatalogError::Storage(StoreError::Conflict(_)) => 400,
            CatalogError::Storage(_) | CatalogError::Publish(_) => 500,
        }
    }
}

/// Product operations over the store, the cache and the broker.
pub struct ProductService<R, C, D: AmqpDialer> {
    repository: R,
    cache: C,
    publisher: Publisher<D>,
    product_queue: String,
    cache_ttl: Option<Duration>,
}

impl<R, C, D> ProductService<R, C, D>
where
    R: ProductRepository,
    C: ProductCache,
    D: AmqpDialer,
{
    pub fn new(repository: R, cache: C, publisher: Publisher<D>, product_queue: &str) -> Self {
        Self {
            repository,
            cache,
            publisher,
            product_queue: product_queue.to_string(),
            cache_ttl: None,
        }
    }

    /// Publish on the shared link to `queues.product`, caching reads for
    /// `catalog.cache_ttl_seconds`.
    pub fn from_config(
        repository: R,
        cache: C,
        connection_manager: Arc<ConnectionManager<D>>,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            repository,
            cache,
            Publisher::new(connection_manager),
            &config.queues.product,
        )
        .with_cache_ttl(config.cache_ttl())
    }

    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub async fn create_user(&self, mut user: User) -> Result<User, CatalogError> {
        if user.name.trim().is_empty() || !user.email.contains('@') {
            return Err(CatalogError::InvalidRequest(
                "user needs a name and a valid email".to_string(),
            ));
        }
        if user.id.is_empty() {
            user.id = Uuid::new_v4().to_string();
        }
        Ok(self.repository.create_user(user).await?)
    }

    /// Store the product, then publish it to the product queue.
    ///
    /// A publish failure is returned to the caller; the stored record stays.
    pub async fn create_product(&self, mut product: Product) -> Result<Product, CatalogError> {
        validate(&product)?;
        if product.id.is_empty() {
            product.id = Uuid::new_v4().to_string();
        }

        let product = self.repository.create_product(product).await?;
        info!(product_id = %product.id, "Product saved");

        self.publisher
            .publish_json(&self.product_queue, &product)
            .await?;
        Ok(product)
    }

    /// Fetch a product, reading through the cache.
    pub async fn get_product(&self, id: &str) -> Result<Product, CatalogError> {
        match self.cache.get(id).await {
            Ok(Some(cached)) => match serde_json::from_slice::<Product>(&cached) {
                Ok(product) => {
                    debug!(product_id = id, "Product served from cache");
                    return Ok(product);
                }
                Err(e) => warn!(product_id = id, error = %e, "Discarding unreadable cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(product_id = id, error = %e, "Cache lookup failed"),
        }

        let product = self
            .repository
            .find_product(id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;

        match serde_json::to_vec(&product) {
            Ok(encoded) => {
                if let Err(e) = self.cache.set(id, encoded, self.cache_ttl).await {
                    warn!(product_id = id, error = %e, "Failed to populate cache");
                }
            }
            Err(e) => warn!(product_id = id, error = %e, "Failed to encode product for cache"),
        }
        Ok(product)
    }

    pub async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, CatalogError> {
        Ok(self.repository.list_products(filter).await?)
    }
}

fn validate(product: &Product) -> Result<(), CatalogError> {
    if product.product_name.trim().is_empty() {
        return Err(CatalogError::InvalidRequest(
            "product_name must not be empty".to_string(),
        ));
    }
    if !product.product_price.is_finite() || product.product_price < 0.0 {
        return Err(CatalogError::InvalidRequest(
            "product_price must be a non-negative number".to_string(),
        ));
    }
    Ok(())
}

/// Build a filter from raw query parameters. Empty strings count as absent.
pub fn parse_filter(
    user_id: Option<&str>,
    min_price: Option<&str>,
    max_price: Option<&str>,
) -> Result<ProductFilter, CatalogError> {
    fn price(name: &str, raw: Option<&str>) -> Result<Option<f64>, CatalogError> {
        match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Some)
                .ok_or_else(|| CatalogError::InvalidRequest(format!("{} must be a number", name))),
        }
    }

    Ok(ProductFilter {
        user_id: user_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        min_price: price("min_price", min_price)?,
        max_price: price("max_price", max_price)?,
    })
}
