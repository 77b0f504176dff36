//! Broker resilience layer for the product catalog service.
//!
//! `rabbitmq` owns the AMQP link, the publisher and the self-healing image
//! processing consumer. `catalog` holds the product operations that publish
//! through it.

pub mod catalog;
pub mod config;
pub mod env;
pub mod models;
pub mod rabbitmq;
