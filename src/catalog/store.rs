use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{Product, ProductFilter, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record '{0}' already exists")]
    Conflict(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Create/query access to user and product records.
#[async_trait]
pub trait ProductRepository: Send + Sync + 'static {
    async fn create_user(&self, user: User) -> Result<User, StoreError>;

    async fn create_product(&self, product: Product) -> Result<Product, StoreError>;

    async fn find_product(&self, id: &str) -> Result<Option<Product>, StoreError>;

    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryProductRepository {
    users: RwLock<HashMap<String, User>>,
    products: RwLock<HashMap<String, Product>>,
}

impl InMemoryProductRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProductRepository for InMemoryProductRepository {
    async fn create_user(&self, user: User) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.id) {
            return Err(StoreError::Conflict(user.id));
        }
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn create_product(&self, product: Product) -> Result<Product, StoreError> {
        let mut products = self.products.write().await;
        if products.contains_key(&product.id) {
            return Err(StoreError::Conflict(product.id));
        }
        products.insert(product.id.clone(), product.clone());
        Ok(product)
    }

    async fn find_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        Ok(self.products.read().await.get(id).cloned())
    }

    async fn list_products(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let mut products: Vec<Product> = self
            .products
            .read()
            .await
            .values()
            .filter(|product| filter.matches(product))
            .cloned()
            .collect();
        products.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(products)
    }
}
