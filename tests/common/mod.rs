use std::{sync::Arc, time::Duration};

use kadstore::{
    memory::{MemoryNetwork, MemoryStorage, MemoryTransport},
    Addr, Config, Id, Node,
};
use tracing_subscriber::{fmt, EnvFilter};

#[allow(dead_code)]
pub fn enable_tracing() {
    fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

pub type TestNode = Node<MemoryTransport, MemoryStorage>;

/// A configuration with short timeouts so failing peers don't slow the tests down.
#[allow(dead_code)]
pub fn config(k: usize) -> Config {
    Config {
        k,
        request_timeout: Duration::from_millis(200),
        round_backoff: Duration::from_millis(1),
        retry_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Creates a node with the given identifier and makes it reachable on the network.
#[allow(dead_code)]
pub fn spawn_node(network: &MemoryNetwork, config: Config, id: Id) -> TestNode {
    let addr = Addr::new(format!("mem://{id}"));
    let node = Node::with_id(
        config,
        id,
        addr.clone(),
        network.transport(),
        MemoryStorage::default(),
    );
    network.register(addr, Arc::new(node.clone()));

    node
}

/// Returns the identifier whose XOR distance to `key` is `distance`.
#[allow(dead_code)]
pub fn at_distance(key: Id, distance: u16) -> Id {
    let mut bytes = key.bytes();
    for (b, d) in bytes.iter_mut().zip(Id::from_u16(distance).bytes()) {
        *b ^= d;
    }

    Id::new(bytes)
}

/// Makes `node` know about each of `peers`.
#[allow(dead_code)]
pub async fn introduce(node: &TestNode, peers: &[&TestNode]) {
    for peer in peers {
        node.routing_table()
            .insert_node(peer.contact(), node)
            .await;
    }
}
