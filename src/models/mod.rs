// src/models/mod.rs

mod entities;
// Re-export everything from entities
pub use entities::*;
