//! Multi-node end-to-end tests over the loopback fabric: nodes exchange
//! batches through the in-memory ledger, shared storage and point-to-point
//! router, and every delivery guarantee is asserted against the stores of the
//! receiving nodes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::types::{ApiSubscriptionRequest, DataInput, GroupInput, SubmitRequest};
use crate::config::{
    AggregatorConfig, BatchConfig, Configuration, HttpConfig, NodeConfig, OperationConfig,
    StorageConfig, WsConfig,
};
use crate::core::builder::NodeHandle;
use crate::core::NodeStarter;
use crate::events::EventIngress;
use crate::operations::runner::batch_envelope;
use crate::plugins::memory::MemoryNetwork;
use crate::plugins::{BatchPin, BatchPinEvent, PinnedContext};
use crate::storage::{txn, Filter, Query, SharedStore, SortDir, StorageTxn};
use crate::subscriptions::{Ack, DeliveryTransport, EventDelivery};
use crate::types::message::new_header;
use crate::types::{
    Batch, BatchRecord, BatchType, BlobRef, Data, DataRef, EventType, Member, Message,
    MessageState, MessageType, OpStatus, Subscription,
};
use crate::utilities::hash::HashType;

const NS: &str = "ns1";

struct ChannelTransport {
    tx: mpsc::Sender<(EventDelivery, mpsc::Sender<Ack>)>,
}

#[async_trait]
impl DeliveryTransport for ChannelTransport {
    async fn deliver(
        &self,
        _sub: &Subscription,
        delivery: &EventDelivery,
        acks: mpsc::Sender<Ack>,
    ) -> anyhow::Result<()> {
        self.tx
            .send((delivery.clone(), acks))
            .await
            .map_err(|_| anyhow::anyhow!("Test consumer gone"))
    }
}

struct TestNode {
    handle: NodeHandle,
    store: SharedStore,
    ingress: EventIngress,
    deliveries: mpsc::Receiver<(EventDelivery, mpsc::Sender<Ack>)>,
    _dir: tempfile::TempDir,
}

fn signing_key(org: &str) -> String {
    format!("0xkey-{org}")
}

async fn start_node(network: &MemoryNetwork, org: &str, node_name: &str) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let config = Configuration {
        node: NodeConfig {
            namespace: NS.to_string(),
            org: org.to_string(),
            node_name: node_name.to_string(),
            signing_key: signing_key(org),
        },
        storage: StorageConfig {
            sqlite_path: dir.path().join("weft.db").to_string_lossy().into_owned(),
        },
        batch: BatchConfig {
            max_messages: 10,
            max_bytes: 1024 * 1024,
            timeout_ms: 25,
            quiesce_ms: 5_000,
            retry_initial_ms: 10,
            retry_max_ms: 100,
        },
        aggregator: AggregatorConfig {
            read_page_size: 50,
            rewind_lookback: 100,
            cid_grace_ms: 60_000,
        },
        operations: OperationConfig {
            retry_initial_ms: 10,
            retry_multiplier: 2,
            retry_max_ms: 100,
            max_attempts: 5,
            stale_ms: 60_000,
            reconcile_interval_ms: 60_000,
        },
        http: HttpConfig::default(),
        websocket: WsConfig::default(),
    };

    let (tx, deliveries) = mpsc::channel(100);
    let node = NodeStarter::new(config)
        .with_memory_network(network.clone())
        .with_delivery_transport(Arc::new(ChannelTransport { tx }))
        .embedded()
        .init_tasks()
        .await
        .unwrap();

    let handle = node.handle();
    let store = node.store.clone();
    let ingress = node.ingress.clone();
    tokio::spawn(node.run());
    TestNode {
        handle,
        store,
        ingress,
        deliveries,
        _dir: dir,
    }
}

async fn message_state(node: &TestNode, id: &str) -> Option<MessageState> {
    let mut store = node.store.lock().await;
    txn(store.as_mut(), |t| t.get_message(NS, id))
        .unwrap()
        .map(|r| r.state)
}

async fn wait_for_state(node: &TestNode, id: &str, state: MessageState) {
    for _ in 0..250 {
        if message_state(node, id).await == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "Message {id} never reached {state:?}; currently {:?}",
        message_state(node, id).await
    );
}

async fn assert_stays_undelivered(node: &TestNode, id: &str) {
    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = message_state(node, id).await;
    assert!(
        state != Some(MessageState::Confirmed),
        "Message {id} was delivered prematurely"
    );
}

async fn confirmed_sequence(node: &TestNode, id: &str) -> i64 {
    let mut store = node.store.lock().await;
    let events = txn(store.as_mut(), |t| {
        t.query_events(
            &Query::new()
                .filter(Filter::And(vec![
                    Filter::Eq("etype", EventType::MessageConfirmed.as_str().into()),
                    Filter::Eq("reference", id.into()),
                ]))
                .sort("sequence", SortDir::Asc),
        )
    })
    .unwrap();
    assert_eq!(events.len(), 1, "Expected exactly one confirmation for {id}");
    events[0].sequence
}

fn submit_broadcast(topic: &str, org: &str, value: serde_json::Value) -> SubmitRequest {
    SubmitRequest {
        namespace: NS.to_string(),
        author: org.to_string(),
        message_type: MessageType::Broadcast,
        topics: vec![topic.to_string()],
        tag: None,
        cid: None,
        group: None,
        data: vec![DataInput::Value(value)],
    }
}

// Hand-crafted remote traffic for driving a single node's ingress directly.

fn wire_message(author: &str, topics: Vec<&str>, data: Vec<DataRef>) -> Message {
    let header = new_header(
        NS,
        author,
        MessageType::Broadcast,
        topics.into_iter().map(String::from).collect(),
    );
    Message::new(header, data).unwrap()
}

fn remote_batch(author: &str, messages: Vec<Message>, data: Vec<Data>) -> Batch {
    let mut batch = Batch::open(NS, author, None, BatchType::Broadcast);
    batch.payload.messages = messages;
    batch.payload.data = data;
    batch.recompute_hash().unwrap();
    batch
}

fn pin_event(batch: &Batch, signer: &str, nonces: &[u64]) -> BatchPinEvent {
    let mut contexts = Vec::new();
    let mut index = 0;
    for message in &batch.payload.messages {
        for topic in &message.header.topics {
            contexts.push(PinnedContext {
                context: crate::types::context_hash(NS, topic, None).unwrap(),
                nonce: nonces[index],
            });
            index += 1;
        }
    }
    BatchPinEvent {
        pin: BatchPin {
            namespace: NS.to_string(),
            batch_id: batch.id.clone(),
            batch_hash: batch.hash,
            payload_ref: None,
            contexts,
        },
        signer: signer.to_string(),
        block_number: 1,
        transaction_hash: "0xtest".to_string(),
    }
}

async fn deliver_remote(node: &TestNode, batch: &Batch, signer: &str, nonces: &[u64]) {
    let envelope = batch_envelope(
        &BatchRecord {
            batch: batch.clone(),
            sealed: true,
        },
        None,
    )
    .unwrap();
    node.ingress.batch_payload_arrived(&envelope).await.unwrap();
    node.ingress
        .batch_pin_complete(&pin_event(batch, signer, nonces))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_single_broadcast_delivered_everywhere() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, "orgA", "nodeA").await;
    let b = start_node(&network, "orgB", "nodeB").await;

    let message = a
        .handle
        .api
        .submit_message(submit_broadcast("t", "orgA", serde_json::json!("hello")))
        .await
        .unwrap();

    // Both the author and the remote node converge on confirmed.
    wait_for_state(&a, &message.id, MessageState::Confirmed).await;
    wait_for_state(&b, &message.id, MessageState::Confirmed).await;

    // The first pin on a fresh context carries nonce 0.
    let pins = {
        let mut store = b.store.lock().await;
        txn(store.as_mut(), |t| {
            let record = t.get_message(NS, &message.id)?;
            let batch_id = record.unwrap().batch.unwrap();
            t.pins_for_batch(NS, &batch_id)
        })
        .unwrap()
    };
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].nonce, 0);
    assert_eq!(pins[0].signer, signing_key("orgA"));

    confirmed_sequence(&a, &message.id).await;
    confirmed_sequence(&b, &message.id).await;
}

#[tokio::test]
async fn test_out_of_order_pins_park_then_deliver() {
    let network = MemoryNetwork::new();
    let b = start_node(&network, "orgB", "nodeB").await;
    network
        .register_identity("orgA", "orgA", "nodeA", &signing_key("orgA"))
        .await;

    let m1 = wire_message("orgA", vec!["t"], vec![]);
    let m2 = wire_message("orgA", vec!["t"], vec![]);
    let b1 = remote_batch("orgA", vec![m1.clone()], vec![]);
    let b2 = remote_batch("orgA", vec![m2.clone()], vec![]);

    // Nonce 1 lands first: it must park.
    deliver_remote(&b, &b2, &signing_key("orgA"), &[1]).await;
    assert_stays_undelivered(&b, &m2.id).await;

    // Nonce 0 lands: both deliver, in nonce order.
    deliver_remote(&b, &b1, &signing_key("orgA"), &[0]).await;
    wait_for_state(&b, &m1.id, MessageState::Confirmed).await;
    wait_for_state(&b, &m2.id, MessageState::Confirmed).await;

    let s1 = confirmed_sequence(&b, &m1.id).await;
    let s2 = confirmed_sequence(&b, &m2.id).await;
    assert!(s1 < s2, "Predecessor must be confirmed first");
}

#[tokio::test]
async fn test_blob_gates_delivery_until_received() {
    let network = MemoryNetwork::new();
    let b = start_node(&network, "orgB", "nodeB").await;
    network
        .register_identity("orgA", "orgA", "nodeA", &signing_key("orgA"))
        .await;

    let blob_hash = HashType::new([9; 32]);
    let data = Data::blob(
        NS,
        BlobRef {
            hash: blob_hash,
            size: 1024 * 1024,
            public_ref: None,
        },
    );
    let message = wire_message(
        "orgA",
        vec!["t"],
        vec![DataRef {
            id: data.id.clone(),
            hash: data.hash,
        }],
    );
    let batch = remote_batch("orgA", vec![message.clone()], vec![data]);

    // Pin and payload present, blob missing: parked.
    deliver_remote(&b, &batch, &signing_key("orgA"), &[0]).await;
    assert_stays_undelivered(&b, &message.id).await;

    // Blob lands: the context rewinds and the message delivers.
    b.ingress
        .blob_received(NS, &blob_hash, 1024 * 1024)
        .await
        .unwrap();
    wait_for_state(&b, &message.id, MessageState::Confirmed).await;
}

#[tokio::test]
async fn test_private_group_delivers_once_per_member() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, "orgA", "nodeA").await;
    let b = start_node(&network, "orgB", "nodeB").await;
    let c = start_node(&network, "orgC", "nodeC").await;

    let request = SubmitRequest {
        namespace: NS.to_string(),
        author: "orgA".to_string(),
        message_type: MessageType::Private,
        topics: vec!["t".to_string()],
        tag: None,
        cid: None,
        group: Some(GroupInput {
            name: Some("trio".to_string()),
            members: vec![
                Member {
                    org: "orgA".to_string(),
                    node: "nodeA".to_string(),
                },
                Member {
                    org: "orgB".to_string(),
                    node: "nodeB".to_string(),
                },
                Member {
                    org: "orgC".to_string(),
                    node: "nodeC".to_string(),
                },
            ],
        }),
        data: vec![DataInput::Value(serde_json::json!({"for": "the group"}))],
    };
    let message = a.handle.api.submit_message(request).await.unwrap();

    for node in [&a, &b, &c] {
        wait_for_state(node, &message.id, MessageState::Confirmed).await;
        // Exactly one confirmation each.
        confirmed_sequence(node, &message.id).await;
    }
}

#[tokio::test]
async fn test_transient_ledger_failures_retry_idempotently() {
    let network = MemoryNetwork::new();
    let a = start_node(&network, "orgA", "nodeA").await;

    network.fail_submissions(2).await;
    let message = a
        .handle
        .api
        .submit_message(submit_broadcast("t", "orgA", serde_json::json!("persist")))
        .await
        .unwrap();
    wait_for_state(&a, &message.id, MessageState::Confirmed).await;

    // Three attempts, one pin on-chain.
    assert_eq!(network.ledger_pin_count().await, 1);

    let ops = {
        let mut store = a.store.lock().await;
        txn(store.as_mut(), |t| {
            t.query_operations(
                &Query::new().filter(Filter::Eq("otype", "blockchain_pin_batch".into())),
            )
        })
        .unwrap()
    };
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OpStatus::Succeeded);
    assert_eq!(ops[0].retry_count, 2);
}

#[tokio::test]
async fn test_correlation_id_chains_block_until_predecessor() {
    let network = MemoryNetwork::new();
    let b = start_node(&network, "orgB", "nodeB").await;
    network
        .register_identity("orgA", "orgA", "nodeA", &signing_key("orgA"))
        .await;

    let m1 = wire_message("orgA", vec!["t1"], vec![]);
    let mut m2_header = new_header(NS, "orgA", MessageType::Broadcast, vec!["t2".to_string()]);
    m2_header.cid = Some(m1.id.clone());
    let m2 = Message::new(m2_header, vec![]).unwrap();

    let b1 = remote_batch("orgA", vec![m1.clone()], vec![]);
    let b2 = remote_batch("orgA", vec![m2.clone()], vec![]);

    // Different topics, so nonces alone would not hold m2 back; the
    // correlation id must.
    deliver_remote(&b, &b2, &signing_key("orgA"), &[0]).await;
    assert_stays_undelivered(&b, &m2.id).await;

    deliver_remote(&b, &b1, &signing_key("orgA"), &[0]).await;
    wait_for_state(&b, &m1.id, MessageState::Confirmed).await;
    wait_for_state(&b, &m2.id, MessageState::Confirmed).await;

    let s1 = confirmed_sequence(&b, &m1.id).await;
    let s2 = confirmed_sequence(&b, &m2.id).await;
    assert!(s1 < s2);
}

#[tokio::test]
async fn test_subscription_delivers_in_sequence_order() {
    let network = MemoryNetwork::new();
    let mut a = start_node(&network, "orgA", "nodeA").await;

    a.handle
        .api
        .create_subscription(ApiSubscriptionRequest {
            name: "app1".to_string(),
            filter: crate::types::SubscriptionFilter {
                events: vec![EventType::MessageConfirmed],
                ..Default::default()
            },
            options: Default::default(),
        })
        .await
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        let message = a
            .handle
            .api
            .submit_message(submit_broadcast("t", "orgA", serde_json::json!(i)))
            .await
            .unwrap();
        ids.push(message.id.clone());
        wait_for_state(&a, &message.id, MessageState::Confirmed).await;
    }

    let mut last_sequence = 0;
    for expected_id in &ids {
        let (delivery, acks) = tokio::time::timeout(
            Duration::from_secs(5),
            a.deliveries.recv(),
        )
        .await
        .expect("Timed out waiting for delivery")
        .expect("Transport closed");

        assert_eq!(delivery.event.event_type, EventType::MessageConfirmed);
        assert_eq!(&delivery.event.reference, expected_id);
        assert!(delivery.event.sequence > last_sequence);
        last_sequence = delivery.event.sequence;

        acks.send(Ack {
            sequence: delivery.event.sequence,
            ok: true,
        })
        .await
        .unwrap();
    }
}
