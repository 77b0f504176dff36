// src/models/entities.rs
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// A catalog product. Also the body published to the product queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub product_name: String,
    #[serde(default)]
    pub product_description: String,
    #[serde(default)]
    pub product_images: Vec<String>,
    #[serde(default)]
    pub compressed_product_images: Vec<String>,
    pub product_price: f64,
}

/// Optional constraints for listing products. Bounds are inclusive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProductFilter {
    pub user_id: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

impl ProductFilter {
    pub fn matches(&self, product: &Product) -> bool {
        self.user_id
            .as_ref()
            .map_or(true, |user_id| &product.user_id == user_id)
            && self
                .min_price
                .map_or(true, |min| product.product_price >= min)
            && self
                .max_price
                .map_or(true, |max| product.product_price <= max)
    }
}
