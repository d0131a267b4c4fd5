//! Runs against a live etcd named by `ETCD_ENDPOINTS`:
//! `cargo test --test etcd_integration_tests -- --ignored`

use std::time::Duration;

use service_discovery::{
    EventKind, RegistryConfig, RegistryError, ServiceNode, ServiceRegistry, SessionState,
};
use tokio_test::assert_ok;

fn test_config() -> RegistryConfig {
    let mut config = RegistryConfig::from_env().unwrap();
    config.root_path = format!("/service-discovery-test-{:08x}", rand::random::<u32>());
    config.with_session_timeout(Duration::from_secs(5))
}

async fn setup_registry(config: &RegistryConfig) -> ServiceRegistry {
    ServiceRegistry::connect(config).await.unwrap()
}

#[tokio::test]
#[ignore]
async fn test_etcd_registration_lifecycle() {
    let config = test_config();
    let provider = setup_registry(&config).await;
    let consumer = setup_registry(&config).await;

    assert!(consumer.get_nodes("db").await.unwrap().is_empty());

    let mut events = consumer.watch_service("db").await.unwrap();
    let first = provider
        .register(&ServiceNode::new("db", "127.0.0.1", 4000))
        .await
        .unwrap();
    let second = provider
        .register(&ServiceNode::new("db", "127.0.0.1", 4000))
        .await
        .unwrap();
    assert_ne!(first, second);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::ChildrenChanged);
    assert_eq!(consumer.get_nodes("db").await.unwrap().len(), 2);

    assert_ok!(provider.close().await);
    assert_eq!(provider.session_state(), SessionState::Closed);
    assert!(consumer.get_nodes("db").await.unwrap().is_empty());

    assert_ok!(consumer.unwatch_service("db").await);
    assert_ok!(consumer.delete("db").await);
    assert_ok!(consumer.close().await);
}

#[tokio::test]
#[ignore]
async fn test_etcd_versioned_modify() {
    let config = test_config();
    let provider = setup_registry(&config).await;
    let other = setup_registry(&config).await;

    let assigned = provider
        .register(&ServiceNode::new("db", "127.0.0.1", 4000))
        .await
        .unwrap();
    let (_, version) = provider.get_node(&assigned).await.unwrap();
    assert_eq!(version, 1);

    let updated = ServiceNode::new("db", "127.0.0.1", 5000);
    assert_eq!(
        provider.modify_if_version(&assigned, &updated, version).await.unwrap(),
        version + 1
    );
    let err = other
        .modify_if_version(&assigned, &updated, version)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::VersionConflict { .. }));

    // the record keeps its session after a modify
    assert_ok!(provider.close().await);
    assert!(other.get_nodes("db").await.unwrap().is_empty());
    assert_ok!(other.close().await);
}
