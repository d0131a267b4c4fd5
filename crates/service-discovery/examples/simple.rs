use service_discovery::{RegistryConfig, ServiceNode, ServiceRegistry};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Connect to etcd (ETCD_ENDPOINTS, default localhost:2379)
    let config = RegistryConfig::from_env()?;
    let registry = ServiceRegistry::connect(&config).await?;

    let events = registry.on_change(|event| {
        println!("path: {}", event.path);
        println!("type: {:?}", event.kind);
        println!("state: {:?}", event.state);
        println!("---------------------------");
    });
    registry.watch_service("db").await?;

    let db = ServiceNode::new("db", "127.0.0.1", 4000);
    let img = ServiceNode::new("img", "127.0.0.1", 4001);
    println!("Registered db at {}", registry.register(&db).await?);
    println!("Registered img at {}", registry.register(&img).await?);

    for node in registry.get_nodes("db").await? {
        println!("dbNode = {}:{}", node.host, node.port);
    }
    for node in registry.get_nodes("img").await? {
        println!("imgNode = {}", node.endpoint());
    }

    // Closing the session deregisters both endpoints
    registry.close().await?;
    events.await?;

    Ok(())
}
