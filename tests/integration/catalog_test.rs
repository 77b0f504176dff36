use std::sync::Arc;
use std::time::Duration;

use catalog_rabbitmq::catalog::service::parse_filter;
use catalog_rabbitmq::config::AppConfig;
use catalog_rabbitmq::catalog::{
    CatalogError, InMemoryCache, InMemoryProductRepository, ProductService,
};
use catalog_rabbitmq::models::{Product, User};
use catalog_rabbitmq::rabbitmq::{ConnectionManager, MemoryBroker, Publisher, RabbitMQError};

type Service = ProductService<InMemoryProductRepository, InMemoryCache, MemoryBroker>;

async fn service(broker: &MemoryBroker) -> Service {
    let manager = Arc::new(ConnectionManager::connect(broker.clone()).await.unwrap());
    ProductService::new(
        InMemoryProductRepository::new(),
        InMemoryCache::new(),
        Publisher::new(manager),
        "product_queue",
    )
    .with_cache_ttl(Some(Duration::from_secs(60)))
}

fn product(name: &str, user_id: &str, price: f64) -> Product {
    Product {
        id: String::new(),
        user_id: user_id.to_string(),
        product_name: name.to_string(),
        product_description: format!("{} description", name),
        product_images: vec![format!("https://img/{}.png", name)],
        compressed_product_images: vec![],
        product_price: price,
    }
}

#[tokio::test]
async fn created_products_are_published_to_the_product_queue() {
    let broker = MemoryBroker::new();
    let service = service(&broker).await;

    let lamp = service.create_product(product("lamp", "u1", 10.0)).await.unwrap();
    let desk = service.create_product(product("desk", "u1", 120.0)).await.unwrap();

    let published: Vec<Product> = broker
        .take_messages("product_queue")
        .iter()
        .map(|message| serde_json::from_slice(&message.data).unwrap())
        .collect();
    assert_eq!(published, vec![lamp, desk]);
}

#[tokio::test]
async fn publish_failure_is_reported_but_product_is_kept() {
    let broker = MemoryBroker::new();
    let service = service(&broker).await;
    broker.drop_connections();

    let err = service
        .create_product(Product {
            id: "p-kept".to_string(),
            ..product("lamp", "u1", 10.0)
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CatalogError::Publish(RabbitMQError::LinkDown)));
    assert_eq!(err.status_code(), 500);
    assert_eq!(service.get_product("p-kept").await.unwrap().product_name, "lamp");
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let broker = MemoryBroker::new();
    let service = service(&broker).await;
    let fixed = Product {
        id: "p-1".to_string(),
        ..product("lamp", "u1", 10.0)
    };

    service.create_product(fixed.clone()).await.unwrap();
    let err = service.create_product(fixed).await.unwrap_err();

    assert!(matches!(err, CatalogError::Storage(_)));
    assert_eq!(broker.take_messages("product_queue").len(), 1);
}

#[tokio::test]
async fn listing_applies_price_and_owner_filters() {
    let broker = MemoryBroker::new();
    let service = service(&broker).await;
    for (name, owner, price) in [("a", "u1", 5.0), ("b", "u1", 15.0), ("c", "u2", 15.0), ("d", "u1", 25.0)] {
        service.create_product(product(name, owner, price)).await.unwrap();
    }

    let filter = parse_filter(Some("u1"), Some("10"), Some("25")).unwrap();
    let mut names: Vec<String> = service
        .list_products(&filter)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.product_name)
        .collect();
    names.sort();

    assert_eq!(names, vec!["b".to_string(), "d".to_string()]);
    assert_eq!(
        service.list_products(&parse_filter(None, None, None).unwrap()).await.unwrap().len(),
        4
    );
}

#[tokio::test]
async fn users_get_an_id_and_need_an_email() {
    let broker = MemoryBroker::new();
    let service = service(&broker).await;

    let user = service
        .create_user(User {
            id: String::new(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
        })
        .await
        .unwrap();
    assert!(!user.id.is_empty());

    let err = service
        .create_user(User {
            id: String::new(),
            name: "Nobody".to_string(),
            email: "not-an-email".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn configured_product_queue_is_used() {
    let broker = MemoryBroker::new();
    let manager = Arc::new(ConnectionManager::connect(broker.clone()).await.unwrap());
    let mut config = AppConfig::default();
    config.queues.product = "products_v2".to_string();
    config.catalog.cache_ttl_seconds = 30;

    let service = ProductService::from_config(
        InMemoryProductRepository::new(),
        InMemoryCache::new(),
        manager,
        &config,
    );
    let lamp = service.create_product(product("lamp", "u1", 10.0)).await.unwrap();

    assert!(broker.queue("product_queue").is_none());
    let published = broker.take_messages("products_v2");
    assert_eq!(published.len(), 1);
    assert_eq!(serde_json::from_slice::<Product>(&published[0].data).unwrap(), lamp);
    assert_eq!(service.get_product(&lamp.id).await.unwrap(), lamp);
}
