//! Cluster behavior against in-process mock servers: membership
//! tracking under node failure and peer discovery, batch
//! fan-out/reassembly, and scan streaming.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aerokv_client::cluster::node::MAX_TEND_FAILURES;
use aerokv_client::cluster::{Cluster, ClusterObserver, Node};
use aerokv_client::{
    AerokvError, BatchPolicy, BatchRead, BatchWrite, Client, ClientConfig, Host, ScanPolicy,
};
use aerokv_core::operations::Operation;
use aerokv_core::protocol::constants::{field_type, info3, msg_type, PROTO_VERSION};
use aerokv_core::protocol::message::{MessageBuilder, MessageHeader};
use aerokv_core::value::SendBoolAs;
use aerokv_core::{Key, Value};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

/// Canned responses for one fake server node. Peers and their
/// generation can be swapped mid-test to drive discovery rounds.
struct MockNode {
    name: String,
    peers: Mutex<String>,
    peers_generation: AtomicU32,
    replicas: String,
    batch_reply: Vec<u8>,
}

impl MockNode {
    fn new(name: &str, peers: &str, replicas: String, batch_reply: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            peers: Mutex::new(peers.to_string()),
            peers_generation: AtomicU32::new(1),
            replicas,
            batch_reply,
        })
    }

    fn set_peers(&self, peers: String) {
        *self.peers.lock().unwrap() = peers;
        self.peers_generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// Accepts connections until aborted; aborting also tears down every
/// in-flight connection handler, so pooled sockets die with the node.
fn spawn_node(listener: TcpListener, node: Arc<MockNode>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut handlers = JoinSet::new();
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let node = Arc::clone(&node);
            handlers.spawn(async move {
                let _ = handle(stream, node).await;
            });
        }
    })
}

async fn handle(mut stream: TcpStream, node: Arc<MockNode>) -> std::io::Result<()> {
    loop {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header).await?;
        let len = header[2..8]
            .iter()
            .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        match header[1] {
            t if t == msg_type::INFO => {
                let text = String::from_utf8_lossy(&payload);
                let mut reply = String::new();
                for command in text.split('\n').filter(|c| !c.is_empty()) {
                    let value = match command {
                        "node" => node.name.clone(),
                        "features" => "peers;batch-index".to_string(),
                        "cluster-name" => "mock".to_string(),
                        "peers-clear-std" => node.peers.lock().unwrap().clone(),
                        "peers-generation" => {
                            node.peers_generation.load(Ordering::SeqCst).to_string()
                        }
                        "partition-generation" => "1".to_string(),
                        "replicas" => node.replicas.clone(),
                        _ => String::new(),
                    };
                    reply.push_str(command);
                    reply.push('\t');
                    reply.push_str(&value);
                    reply.push('\n');
                }
                write_frame(&mut stream, msg_type::INFO, reply.as_bytes()).await?;
            }
            t if t == msg_type::MESSAGE => {
                stream.write_all(&node.batch_reply).await?;
            }
            _ => return Ok(()),
        }
    }
}

async fn write_frame(
    stream: &mut TcpStream,
    msg_type: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.push(PROTO_VERSION << 4);
    buf.push(msg_type);
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes()[2..]);
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await
}

/// A `replicas` info value with one master column marking the given
/// partitions as owned.
fn replicas_value(partitions: impl Iterator<Item = usize>) -> String {
    let mut bitmap = [0u8; 512];
    for p in partitions {
        bitmap[p >> 3] |= 0x80 >> (p & 7);
    }
    format!("test:1,1,{};", BASE64.encode(bitmap))
}

fn config_for(port: u16) -> ClientConfig {
    ClientConfig::builder()
        .add_seed(Host::new("127.0.0.1", port))
        .network(|n| n.tend_interval(Duration::from_secs(3600)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn tend_evicts_node_after_repeated_failures() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_node(
        listener,
        MockNode::new("BB1", "1,3000,[]", replicas_value(0..4096), Vec::new()),
    );

    let cluster = Cluster::connect(config_for(port)).await.unwrap();
    assert_eq!(cluster.current_view().nodes().len(), 1);
    assert!(cluster.partitions().has_namespace("test"));

    struct RemovalCounter(Arc<AtomicUsize>);
    impl ClusterObserver for RemovalCounter {
        fn node_removed(&self, _node: &Arc<Node>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    let removals = Arc::new(AtomicUsize::new(0));
    cluster.add_observer(Box::new(RemovalCounter(Arc::clone(&removals))));

    // Let the startup tend round settle before the node goes dark.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.abort();
    let _ = server.await;

    for _ in 0..MAX_TEND_FAILURES {
        cluster.tend().await;
    }

    assert!(cluster.current_view().is_empty());
    assert_eq!(removals.load(Ordering::SeqCst), 1);
    cluster.close();
}

fn batch_record(index: u32) -> Vec<u8> {
    let header = MessageHeader {
        n_fields: 1,
        n_ops: 1,
        ..Default::default()
    };
    let mut builder = MessageBuilder::new(header);
    builder.write_field(field_type::BATCH_INDEX, &index.to_be_bytes());
    builder
        .write_operation(
            &Operation::put("slot", Value::Int(i64::from(index) * 10))
                .encode(SendBoolAs::Bool)
                .unwrap(),
        )
        .unwrap();
    builder.finish().unwrap().payload.to_vec()
}

/// One wire frame holding the given slots (deliberately out of input
/// order) followed by the terminating message.
fn batch_reply(indexes: &[u32]) -> Vec<u8> {
    let mut payload = Vec::new();
    for &index in indexes.iter().rev() {
        payload.extend(batch_record(index));
    }
    let last = MessageHeader {
        info3: info3::LAST,
        ..Default::default()
    };
    payload.extend(MessageBuilder::new(last).finish().unwrap().payload.to_vec());

    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push(PROTO_VERSION << 4);
    frame.push(msg_type::MESSAGE);
    frame.extend_from_slice(&(payload.len() as u64).to_be_bytes()[2..]);
    frame.extend_from_slice(&payload);
    frame
}

#[tokio::test]
async fn batch_preserves_input_order_across_nodes() {
    let keys: Vec<Key> = (0..8)
        .map(|i| Key::new("test", "demo", format!("k{}", i)).unwrap())
        .collect();

    // Node A owns even partitions, node B odd ones.
    let (even_indexes, odd_indexes): (Vec<u32>, Vec<u32>) = {
        let mut even = Vec::new();
        let mut odd = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            if key.partition_id() % 2 == 0 {
                even.push(i as u32);
            } else {
                odd.push(i as u32);
            }
        }
        (even, odd)
    };

    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_b = listener_b.local_addr().unwrap().port();
    let server_b = spawn_node(
        listener_b,
        MockNode::new(
            "BB2",
            "1,3000,[]",
            replicas_value((0..4096).filter(|p| p % 2 == 1)),
            batch_reply(&odd_indexes),
        ),
    );

    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    let server_a = spawn_node(
        listener_a,
        MockNode::new(
            "BB1",
            &format!("1,3000,[[BB2,,[127.0.0.1:{}]]]", port_b),
            replicas_value((0..4096).filter(|p| p % 2 == 0)),
            batch_reply(&even_indexes),
        ),
    );

    let client = Client::connect(config_for(port_a)).await.unwrap();
    assert_eq!(client.cluster_view().nodes().len(), 2);

    let reads: Vec<BatchRead> = keys.iter().cloned().map(BatchRead::new).collect();
    let results = client
        .batch_get(&BatchPolicy::default(), &reads)
        .await
        .unwrap();

    assert_eq!(results.len(), keys.len());
    for (i, slot) in results.iter().enumerate() {
        let record = slot.as_ref().unwrap();
        assert_eq!(
            record.bins.get("slot"),
            Some(&Value::Int(i as i64 * 10)),
            "slot {} out of order",
            i
        );
    }

    client.close();
    server_a.abort();
    server_b.abort();
}

#[tokio::test]
async fn tend_admits_peer_after_two_observations() {
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_b = listener_b.local_addr().unwrap().port();
    let server_b = spawn_node(
        listener_b,
        MockNode::new(
            "BB2",
            "1,3000,[]",
            replicas_value((0..4096).filter(|p| p % 2 == 1)),
            Vec::new(),
        ),
    );

    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    let node_a = MockNode::new("BB1", "1,3000,[]", replicas_value(0..4096), Vec::new());
    let server_a = spawn_node(listener_a, Arc::clone(&node_a));

    let cluster = Cluster::connect(config_for(port_a)).await.unwrap();
    assert_eq!(cluster.current_view().nodes().len(), 1);

    // BB1 starts reporting BB2. One sighting is not enough.
    node_a.set_peers(format!("1,3000,[[BB2,,[127.0.0.1:{}]]]", port_b));
    cluster.tend().await;
    assert_eq!(cluster.current_view().nodes().len(), 1);
    assert!(cluster.current_view().node("BB2").is_none());

    // A second consecutive sighting admits it.
    node_a.set_peers(format!("1,3000,[[BB2,,[127.0.0.1:{}]]]", port_b));
    cluster.tend().await;
    assert_eq!(cluster.current_view().nodes().len(), 2);
    assert!(cluster.current_view().node("BB2").is_some());

    cluster.close();
    server_a.abort();
    server_b.abort();
}

#[tokio::test]
async fn scan_streams_records_from_every_node() {
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_b = listener_b.local_addr().unwrap().port();
    let server_b = spawn_node(
        listener_b,
        MockNode::new(
            "BB2",
            "1,3000,[]",
            replicas_value((0..4096).filter(|p| p % 2 == 1)),
            batch_reply(&[4, 5, 6, 7]),
        ),
    );

    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    let server_a = spawn_node(
        listener_a,
        MockNode::new(
            "BB1",
            &format!("1,3000,[[BB2,,[127.0.0.1:{}]]]", port_b),
            replicas_value((0..4096).filter(|p| p % 2 == 0)),
            batch_reply(&[0, 1, 2, 3]),
        ),
    );

    let client = Client::connect(config_for(port_a)).await.unwrap();
    assert_eq!(client.cluster_view().nodes().len(), 2);

    let mut stream = client
        .scan(&ScanPolicy::default(), "test", "demo", &[])
        .await
        .unwrap();
    let mut slots = Vec::new();
    while let Some(record) = stream.next().await {
        let record = record.unwrap();
        match record.bins.get("slot") {
            Some(Value::Int(v)) => slots.push(*v),
            other => panic!("unexpected slot bin: {:?}", other),
        }
    }

    // Both nodes' slices arrive; interleaving is unordered.
    slots.sort_unstable();
    let expected: Vec<i64> = (0..8).map(|i| i * 10).collect();
    assert_eq!(slots, expected);

    client.close();
    server_a.abort();
    server_b.abort();
}

#[tokio::test]
async fn batch_operate_preserves_input_order_across_nodes() {
    let keys: Vec<Key> = (0..8)
        .map(|i| Key::new("test", "demo", format!("k{}", i)).unwrap())
        .collect();

    let (even_indexes, odd_indexes): (Vec<u32>, Vec<u32>) = {
        let mut even = Vec::new();
        let mut odd = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            if key.partition_id() % 2 == 0 {
                even.push(i as u32);
            } else {
                odd.push(i as u32);
            }
        }
        (even, odd)
    };

    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_b = listener_b.local_addr().unwrap().port();
    let server_b = spawn_node(
        listener_b,
        MockNode::new(
            "BB2",
            "1,3000,[]",
            replicas_value((0..4096).filter(|p| p % 2 == 1)),
            batch_reply(&odd_indexes),
        ),
    );

    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    let server_a = spawn_node(
        listener_a,
        MockNode::new(
            "BB1",
            &format!("1,3000,[[BB2,,[127.0.0.1:{}]]]", port_b),
            replicas_value((0..4096).filter(|p| p % 2 == 0)),
            batch_reply(&even_indexes),
        ),
    );

    let client = Client::connect(config_for(port_a)).await.unwrap();
    assert_eq!(client.cluster_view().nodes().len(), 2);

    let writes: Vec<BatchWrite> = keys
        .iter()
        .cloned()
        .map(|key| BatchWrite::new(key, vec![Operation::put("slot", Value::Int(0))]))
        .collect();
    let results = client
        .batch_operate(&BatchPolicy::default(), &writes)
        .await
        .unwrap();

    assert_eq!(results.len(), keys.len());
    for (i, slot) in results.iter().enumerate() {
        let record = slot.as_ref().unwrap();
        assert_eq!(
            record.bins.get("slot"),
            Some(&Value::Int(i as i64 * 10)),
            "slot {} out of order",
            i
        );
    }

    client.close();
    server_a.abort();
    server_b.abort();
}

#[tokio::test]
async fn background_scan_rejects_non_record_reply() {
    // An info-typed frame where a record message is expected.
    let mut bogus = Vec::new();
    bogus.push(PROTO_VERSION << 4);
    bogus.push(msg_type::INFO);
    bogus.extend_from_slice(&4u64.to_be_bytes()[2..]);
    bogus.extend_from_slice(b"ok\t\n");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = spawn_node(
        listener,
        MockNode::new("BB1", "1,3000,[]", replicas_value(0..4096), bogus),
    );

    let client = Client::connect(config_for(port)).await.unwrap();
    let result = client
        .scan_background(
            &ScanPolicy::default(),
            "test",
            "demo",
            vec![Operation::put("touched", Value::Int(1))],
        )
        .await;
    assert!(matches!(result, Err(AerokvError::Protocol(_))));

    client.close();
    server.abort();
}
