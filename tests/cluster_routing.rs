//! Carts spread over several directories sharing one event log.

use std::sync::Arc;
use std::time::Duration;

use shopping_cart_es::{
    CartCommand, HashRing, ItemPopularityStore, MemoryItemPopularityStore, NodeId, Persistence,
    ShardAllocation, ShardDirectory, ShardDirectoryBuilder, ShoppingCart, ShoppingCartService,
};

const ASK: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ring(names: &[&str]) -> Arc<dyn ShardAllocation> {
    Arc::new(HashRing::new(names.iter().map(|n| NodeId::from(*n)), 32).unwrap())
}

fn cluster(persistence: &Persistence, names: &[&str]) -> Vec<ShardDirectory<ShoppingCart>> {
    let allocation = ring(names);
    let nodes: Vec<_> = names
        .iter()
        .map(|name| {
            ShardDirectoryBuilder::new(persistence.clone())
                .node_id(*name)
                .allocation(Arc::clone(&allocation))
                .build::<ShoppingCart>()
        })
        .collect();
    for node in &nodes {
        for peer in &nodes {
            if peer.node_id() != node.node_id() {
                node.connect_peer(peer.node_id().clone(), Arc::new(peer.clone()));
            }
        }
    }
    nodes
}

async fn shutdown(nodes: &[ShardDirectory<ShoppingCart>]) {
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn any_node_serves_any_cart() {
    init_tracing();
    let persistence = Persistence::in_memory();
    let nodes = cluster(&persistence, &["a", "b", "c"]);
    let popularity: Arc<dyn ItemPopularityStore> = Arc::new(MemoryItemPopularityStore::new());
    let services: Vec<_> = nodes
        .iter()
        .map(|n| ShoppingCartService::new(n.clone(), Arc::clone(&popularity), ASK))
        .collect();

    for i in 0..30 {
        let cart = format!("cart-{i}");
        services[i % 3].add_item(&cart, "socks", 1).await.unwrap();
        services[(i + 1) % 3].add_item(&cart, "hat", 2).await.unwrap();
        let got = services[(i + 2) % 3].get_cart(&cart).await.unwrap();
        assert_eq!(got.items.len(), 2);
    }

    let mut total = 0;
    for node in &nodes {
        let live = node.live_instances().await;
        total += live.len();
    }
    assert_eq!(total, 30, "each cart has exactly one live instance");
    shutdown(&nodes).await;
}

#[tokio::test]
async fn removing_a_node_keeps_every_cart() {
    init_tracing();
    let persistence = Persistence::in_memory();
    let nodes = cluster(&persistence, &["a", "b", "c"]);

    for i in 0..20 {
        nodes[0]
            .ask(
                &format!("cart-{i}"),
                CartCommand::AddItem {
                    item_id: format!("item-{i}"),
                    quantity: i + 1,
                },
                ASK,
            )
            .await
            .unwrap();
    }
    let on_c = nodes[2].live_instances().await;
    assert!(!on_c.is_empty());

    // The node losing shards applies the change first.
    let smaller = ring(&["a", "b"]);
    nodes[2].update_allocation(Arc::clone(&smaller)).await;
    nodes[0].update_allocation(Arc::clone(&smaller)).await;
    nodes[1].update_allocation(smaller).await;
    assert!(nodes[2].live_instances().await.is_empty());

    for i in 0..20 {
        let done = nodes[2]
            .ask(&format!("cart-{i}"), CartCommand::Checkout, ASK)
            .await
            .unwrap();
        let summary = done.state.summary();
        assert!(summary.checked_out);
        assert_eq!(summary.items.get(&format!("item-{i}")), Some(&(i + 1)));
        assert_eq!(done.sequence_nr, 2);
    }
    assert!(nodes[2].live_instances().await.is_empty());
    shutdown(&nodes).await;
}
