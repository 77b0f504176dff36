// src/catalog/mod.rs
// Product catalog collaborators and the service that publishes on create

pub mod cache;
pub mod service;
pub mod store;

pub use cache::{CacheError, InMemoryCache, ProductCache};
pub use service::{parse_filter, CatalogError, ProductService};
pub use store::{InMemoryProductRepository, ProductRepository, StoreError};
