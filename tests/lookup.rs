use std::collections::HashSet;

use kadstore::{memory::MemoryNetwork, message::Route, Error, Id, Record, TimeWindow};

mod common;
#[allow(unused_imports)]
use crate::common::{config, enable_tracing, introduce, spawn_node, TestNode};

#[tokio::test]
async fn find_node_walks_towards_target() {
    // enable_tracing();

    let network = MemoryNetwork::new();
    let node = |raw| spawn_node(&network, config(2), Id::from_u16(raw));

    let (n1, n2, n8, n9, n32, n33, origin) =
        (node(1), node(2), node(8), node(9), node(32), node(33), node(128));

    // Each pair only knows the next pair closer to 0.
    introduce(&origin, &[&n32, &n33]).await;
    introduce(&n32, &[&n8, &n9]).await;
    introduce(&n33, &[&n8, &n9]).await;
    introduce(&n8, &[&n1, &n2]).await;
    introduce(&n9, &[&n1, &n2]).await;
    introduce(&n1, &[&n2]).await;
    introduce(&n2, &[&n1]).await;

    let closest = origin.find_node(Id::from_u16(0)).await;

    let ids: Vec<_> = closest.iter().map(|peer| peer.id).collect();
    assert_eq!(ids, [n1.id(), n2.id()]);

    // Every hop was asked exactly once.
    for hop in [&n1, &n2, &n8, &n9, &n32, &n33] {
        assert_eq!(network.request_count(hop.addr(), Route::FindNode), 1);
    }

    // Every hop learnt about the origin from its request.
    for hop in [&n1, &n2, &n8, &n9, &n32, &n33] {
        assert!(hop.routing_table().contains(&origin.id()));
    }
}

#[tokio::test]
async fn find_node_survives_unresponsive_peers() {
    let network = MemoryNetwork::new();
    let node = |raw| spawn_node(&network, config(2), Id::from_u16(raw));

    let (n1, n2, n8, n9, origin) = (node(1), node(2), node(8), node(9), node(128));

    introduce(&origin, &[&n8, &n9]).await;
    introduce(&n8, &[&n1, &n2]).await;
    introduce(&n9, &[&n1]).await;
    network.set_down(n9.addr(), true);

    let closest = origin.find_node(Id::from_u16(0)).await;

    let ids: HashSet<_> = closest.iter().map(|peer| peer.id).collect();
    assert_eq!(ids, HashSet::from([n1.id(), n2.id()]));
    assert_eq!(network.request_count(n9.addr(), Route::FindNode), 0);
}

#[tokio::test]
async fn find_value_missing_key_is_empty() {
    let network = MemoryNetwork::new();
    let nodes: Vec<TestNode> = (0..5)
        .map(|_| spawn_node(&network, config(3), Id::rand()))
        .collect();
    for node in &nodes {
        let others: Vec<&TestNode> = nodes.iter().filter(|other| other.id() != node.id()).collect();
        introduce(node, &others).await;
    }

    let records = nodes[0].find_value(Id::rand(), None).await;

    assert!(records.is_empty());
}

#[tokio::test]
async fn fetch_window_spans_time_buckets() {
    let network = MemoryNetwork::new();
    let nodes: Vec<TestNode> = (0..4)
        .map(|_| spawn_node(&network, config(3), Id::rand()))
        .collect();
    for node in &nodes {
        let others: Vec<&TestNode> = nodes.iter().filter(|other| other.id() != node.id()).collect();
        introduce(node, &others).await;
    }

    let start = 1_699_999_200; // aligned on an hour
    let records = [
        Record::new("first", start + 10, "a"),
        Record::new("second", start + 3_600 + 20, "b"),
        Record::new("third", start + 7_200 + 30, "c"),
    ];
    for record in &records {
        let report = nodes[0].store(record.clone()).await.unwrap();
        assert!(!report.confirmed.is_empty());
    }

    let window = TimeWindow::new(start, start + 3_600 + 30);
    let fetched = nodes[3].fetch_window(window).await.unwrap();

    let signatures: Vec<_> = fetched
        .iter()
        .map(|record| String::from_utf8_lossy(&record.signature).into_owned())
        .collect();
    assert_eq!(signatures, ["first", "second"]);

    // Narrow windows filter inside a bucket too.
    let fetched = nodes[1]
        .find_value(
            records[1].key(3_600).unwrap(),
            Some(TimeWindow::new(start + 3_600, start + 3_610)),
        )
        .await;
    assert!(fetched.is_empty());
}

#[tokio::test]
async fn fetch_window_at_the_edges_of_time() {
    let network = MemoryNetwork::new();
    let node = spawn_node(&network, config(2), Id::rand());

    // The last bucket ends past i64::MAX.
    let fetched = node
        .fetch_window(TimeWindow::new(i64::MAX - 10, i64::MAX))
        .await
        .unwrap();
    assert!(fetched.is_empty());

    let result = node
        .fetch_window(TimeWindow::new(i64::MIN, i64::MIN + 10))
        .await;
    assert!(matches!(result, Err(Error::InvalidTimestamp(i64::MIN))));
}
