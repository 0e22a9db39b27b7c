//! Multi-record streaming: scans, secondary-index queries and
//! background task handles.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use aerokv_core::operations::Operation;
use aerokv_core::protocol::constants::{field_type, info1, info2, info3, msg_type};
use aerokv_core::protocol::message::{MessageBuilder, MessageHeader, ParsedMessage};
use aerokv_core::protocol::proto::ProtoFrame;
use aerokv_core::value::{SendBoolAs, Value};
use aerokv_core::{AerokvError, Record, Result};
use bytes::BufMut;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cluster::{Cluster, Node};
use crate::policy::{QueryPolicy, ScanPolicy};

/// Records buffered between the fan-out workers and the consumer.
const STREAM_CAPACITY: usize = 256;

/// A stream of records produced by a scan or query. Dropping the
/// stream cancels the remaining work; the workers' sockets are
/// discarded rather than drained.
pub struct RecordStream {
    rx: mpsc::Receiver<Result<Record>>,
    task_id: u64,
}

impl RecordStream {
    /// The server-side transaction id shared by every node's slice.
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// The next record, or `None` when every node has finished.
    pub async fn next(&mut self) -> Option<Result<Record>> {
        self.rx.recv().await
    }
}

impl Stream for RecordStream {
    type Item = Result<Record>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A secondary-index predicate for queries.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexFilter {
    /// Exact match on an integer or string index.
    Equal {
        /// Indexed bin.
        bin: String,
        /// The value to match; integer or string.
        value: Value,
    },
    /// Inclusive integer range.
    Range {
        /// Indexed bin.
        bin: String,
        /// Low bound.
        low: i64,
        /// High bound.
        high: i64,
    },
}

impl IndexFilter {
    /// Equality predicate.
    pub fn equal(bin: impl Into<String>, value: impl Into<Value>) -> Self {
        IndexFilter::Equal {
            bin: bin.into(),
            value: value.into(),
        }
    }

    /// Inclusive numeric range predicate.
    pub fn range(bin: impl Into<String>, low: i64, high: i64) -> Self {
        IndexFilter::Range {
            bin: bin.into(),
            low,
            high,
        }
    }

    /// Encodes the index-range field payload: a range count, then per
    /// range the bin name, the particle type and the two bounds.
    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.put_u8(1);
        match self {
            IndexFilter::Equal { bin, value } => {
                write_filter_bin(&mut buf, bin)?;
                match value {
                    Value::Int(v) => {
                        buf.put_u8(aerokv_core::ParticleType::Integer as u8);
                        for _ in 0..2 {
                            buf.put_u32(8);
                            buf.put_i64(*v);
                        }
                    }
                    Value::String(s) => {
                        buf.put_u8(aerokv_core::ParticleType::String as u8);
                        for _ in 0..2 {
                            buf.put_u32(s.len() as u32);
                            buf.put_slice(s.as_bytes());
                        }
                    }
                    other => {
                        return Err(AerokvError::Param(format!(
                            "index equality filters take integers or strings, not {}",
                            other
                        )));
                    }
                }
            }
            IndexFilter::Range { bin, low, high } => {
                write_filter_bin(&mut buf, bin)?;
                buf.put_u8(aerokv_core::ParticleType::Integer as u8);
                buf.put_u32(8);
                buf.put_i64(*low);
                buf.put_u32(8);
                buf.put_i64(*high);
            }
        }
        Ok(buf)
    }
}

fn write_filter_bin(buf: &mut Vec<u8>, bin: &str) -> Result<()> {
    if bin.len() > u8::MAX as usize {
        return Err(AerokvError::Param(format!("filter bin name {:?} too long", bin)));
    }
    buf.put_u8(bin.len() as u8);
    buf.put_slice(bin.as_bytes());
    Ok(())
}

struct StreamSpec {
    namespace: String,
    set_name: String,
    bins: Vec<String>,
    filter: Option<IndexFilter>,
    records_per_second: u32,
    include_bin_data: bool,
    socket_timeout: Duration,
    filter_expression: Option<Vec<u8>>,
    task_id: u64,
    /// Operations to apply record-by-record; makes the pass a
    /// background write instead of a read stream.
    background_ops: Vec<Operation>,
    send_bool_as: SendBoolAs,
}

impl StreamSpec {
    fn build_frame(&self) -> Result<ProtoFrame> {
        let mut n_fields = 2; // namespace + task id
        if !self.set_name.is_empty() {
            n_fields += 1;
        }
        if self.filter.is_some() {
            n_fields += 1;
        }
        if self.records_per_second > 0 {
            n_fields += 1;
        }
        if !self.socket_timeout.is_zero() {
            n_fields += 1;
        }
        if self.filter_expression.is_some() {
            n_fields += 1;
        }

        let background = !self.background_ops.is_empty();
        let mut header = MessageHeader {
            n_fields,
            ..Default::default()
        };
        if background {
            header.info2 = info2::WRITE;
            header.n_ops = self.background_ops.len() as u16;
        } else {
            header.info1 = info1::READ;
            if self.bins.is_empty() {
                header.info1 |= info1::GET_ALL;
            }
            if !self.include_bin_data {
                header.info1 |= info1::NOBINDATA;
            }
            header.n_ops = self.bins.len() as u16;
        }

        let mut builder = MessageBuilder::new(header);
        builder.write_field_str(field_type::NAMESPACE, &self.namespace);
        if !self.set_name.is_empty() {
            builder.write_field_str(field_type::SET, &self.set_name);
        }
        builder.write_field_u64(field_type::TASK_ID, self.task_id);
        if let Some(filter) = &self.filter {
            builder.write_field(field_type::INDEX_RANGE, &filter.encode()?);
        }
        if self.records_per_second > 0 {
            builder.write_field(
                field_type::SCAN_RPS,
                &self.records_per_second.to_be_bytes(),
            );
        }
        if !self.socket_timeout.is_zero() {
            let millis: u32 = self
                .socket_timeout
                .as_millis()
                .try_into()
                .unwrap_or(u32::MAX);
            builder.write_field(field_type::SCAN_TIMEOUT, &millis.to_be_bytes());
        }
        if let Some(expr) = &self.filter_expression {
            builder.write_field(field_type::FILTER_EXPRESSION, expr);
        }
        if background {
            for op in &self.background_ops {
                builder.write_operation(&op.encode(self.send_bool_as)?)?;
            }
        } else {
            for bin in &self.bins {
                builder.write_operation(&Operation::get(bin.clone()).encode(self.send_bool_as)?)?;
            }
        }
        builder.finish()
    }
}

/// Streams every record of a namespace (optionally one set).
pub(crate) async fn scan(
    cluster: &Arc<Cluster>,
    policy: &ScanPolicy,
    namespace: &str,
    set_name: &str,
    bins: &[&str],
) -> Result<RecordStream> {
    let spec = StreamSpec {
        namespace: namespace.to_string(),
        set_name: set_name.to_string(),
        bins: bins.iter().map(|b| b.to_string()).collect(),
        filter: None,
        records_per_second: policy.records_per_second,
        include_bin_data: policy.include_bin_data,
        socket_timeout: policy.base.socket_timeout,
        filter_expression: policy
            .base
            .filter_expression
            .as_ref()
            .map(|e| e.as_bytes().to_vec()),
        task_id: rand::random(),
        background_ops: Vec::new(),
        send_bool_as: cluster.config().send_bool_as(),
    };
    stream_nodes(cluster, spec, policy.max_concurrent_nodes).await
}

/// Streams the records matching a secondary-index predicate.
pub(crate) async fn query(
    cluster: &Arc<Cluster>,
    policy: &QueryPolicy,
    namespace: &str,
    set_name: &str,
    filter: Option<IndexFilter>,
    bins: &[&str],
) -> Result<RecordStream> {
    let spec = StreamSpec {
        namespace: namespace.to_string(),
        set_name: set_name.to_string(),
        bins: bins.iter().map(|b| b.to_string()).collect(),
        filter,
        records_per_second: 0,
        include_bin_data: policy.include_bin_data,
        socket_timeout: policy.base.socket_timeout,
        filter_expression: policy
            .base
            .filter_expression
            .as_ref()
            .map(|e| e.as_bytes().to_vec()),
        task_id: rand::random(),
        background_ops: Vec::new(),
        send_bool_as: cluster.config().send_bool_as(),
    };
    stream_nodes(cluster, spec, policy.max_concurrent_nodes).await
}

/// Applies operations to every record matched by a scan, server side,
/// and returns a handle for polling completion.
pub(crate) async fn scan_background(
    cluster: &Arc<Cluster>,
    policy: &ScanPolicy,
    namespace: &str,
    set_name: &str,
    ops: Vec<Operation>,
) -> Result<Task> {
    if ops.is_empty() || ops.iter().any(|op| !op.is_write()) {
        return Err(AerokvError::Param(
            "background scans take at least one write operation".into(),
        ));
    }
    let spec = StreamSpec {
        namespace: namespace.to_string(),
        set_name: set_name.to_string(),
        bins: Vec::new(),
        filter: None,
        records_per_second: policy.records_per_second,
        include_bin_data: false,
        socket_timeout: policy.base.socket_timeout,
        filter_expression: policy
            .base
            .filter_expression
            .as_ref()
            .map(|e| e.as_bytes().to_vec()),
        task_id: rand::random(),
        background_ops: ops,
        send_bool_as: cluster.config().send_bool_as(),
    };
    let task_id = spec.task_id;
    let frame = spec.build_frame()?;

    // A background pass gets one ack frame per node, no record stream.
    let wait = (!policy.base.socket_timeout.is_zero()).then_some(policy.base.socket_timeout);
    for node in cluster.current_view().nodes().iter() {
        let mut conn = node.acquire(wait).await?;
        match conn.round_trip(frame.clone()).await {
            Ok(reply) => {
                if reply.msg_type != msg_type::MESSAGE {
                    node.forget(conn);
                    return Err(AerokvError::Protocol(format!(
                        "expected record message, got proto type {}",
                        reply.msg_type
                    )));
                }
                node.release(conn);
                let parsed = ParsedMessage::parse(&reply.payload)?;
                if parsed.header.result_code != 0 {
                    return Err(AerokvError::from_code(
                        parsed.header.result_code,
                        Some(node.name().to_string()),
                    ));
                }
            }
            Err(e) => {
                node.forget(conn);
                return Err(e);
            }
        }
    }
    Ok(Task::new(Arc::clone(cluster), TaskKind::Scan, task_id))
}

async fn stream_nodes(
    cluster: &Arc<Cluster>,
    spec: StreamSpec,
    max_concurrent: usize,
) -> Result<RecordStream> {
    let frame = spec.build_frame()?;
    let nodes: Vec<Arc<Node>> = cluster.current_view().nodes().to_vec();
    if nodes.is_empty() {
        return Err(AerokvError::Cluster("no nodes available".into()));
    }
    let task_id = spec.task_id;
    let wait = (!spec.socket_timeout.is_zero()).then_some(spec.socket_timeout);
    let (tx, rx) = mpsc::channel(STREAM_CAPACITY);

    let limit = if max_concurrent == 0 {
        nodes.len()
    } else {
        max_concurrent
    };
    tokio::spawn(async move {
        futures::stream::iter(nodes)
            .for_each_concurrent(limit, |node| {
                let tx = tx.clone();
                let frame = frame.clone();
                async move {
                    if let Err(e) = stream_node(&node, frame, wait, &tx).await {
                        debug!(node = %node, error = %e, "stream slice failed");
                        let _ = tx.send(Err(e)).await;
                    }
                }
            })
            .await;
    });
    Ok(RecordStream { rx, task_id })
}

/// Drives one node's slice: send the request, then forward records
/// until the final frame or until the consumer goes away.
async fn stream_node(
    node: &Arc<Node>,
    frame: ProtoFrame,
    wait: Option<Duration>,
    tx: &mpsc::Sender<Result<Record>>,
) -> Result<()> {
    let mut conn = node.acquire(wait).await?;
    if let Err(e) = conn.send(frame).await {
        node.forget(conn);
        return Err(e);
    }

    loop {
        let reply = match conn.receive().await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                node.forget(conn);
                return Err(AerokvError::Connection(format!(
                    "{} closed mid-stream",
                    node
                )));
            }
            Err(e) => {
                node.forget(conn);
                return Err(e);
            }
        };
        if reply.msg_type != msg_type::MESSAGE {
            node.forget(conn);
            return Err(AerokvError::Protocol(format!(
                "expected record message, got proto type {}",
                reply.msg_type
            )));
        }

        let mut rest: &[u8] = &reply.payload;
        while !rest.is_empty() {
            let parsed = match ParsedMessage::parse_next(&mut rest) {
                Ok(parsed) => parsed,
                Err(e) => {
                    node.forget(conn);
                    return Err(e);
                }
            };
            if parsed.header.info3 & info3::LAST != 0 {
                let code = parsed.header.result_code;
                if code != 0 {
                    node.forget(conn);
                    return Err(AerokvError::from_code(code, Some(node.name().to_string())));
                }
                node.release(conn);
                return Ok(());
            }
            if parsed.header.result_code != 0 {
                node.forget(conn);
                return Err(AerokvError::from_code(
                    parsed.header.result_code,
                    Some(node.name().to_string()),
                ));
            }
            let generation = parsed.header.generation;
            let expiration = parsed.header.expiration;
            let key = parsed.key();
            let record = Record::new(key, parsed.into_bins(), generation, expiration);
            if tx.send(Ok(record)).await.is_err() {
                // Consumer dropped the stream; abandon the socket.
                node.forget(conn);
                return Ok(());
            }
        }
    }
}

/// What kind of server job a [`Task`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A background scan.
    Scan,
    /// A background query.
    Query,
}

/// Completion state of a background job, aggregated over all nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// No node reports the job yet.
    Pending,
    /// At least one node is still working.
    InProgress,
    /// Every node has finished or forgotten the job.
    Completed,
}

/// A handle onto a server-side background job.
pub struct Task {
    cluster: Arc<Cluster>,
    kind: TaskKind,
    id: u64,
}

impl Task {
    fn new(cluster: Arc<Cluster>, kind: TaskKind, id: u64) -> Self {
        Self { cluster, kind, id }
    }

    /// The transaction id the job runs under.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Polls every node for the job's state.
    pub async fn status(&self) -> Result<TaskStatus> {
        let command = match self.kind {
            TaskKind::Scan => format!("scan-show:trid={}", self.id),
            TaskKind::Query => format!("query-show:trid={}", self.id),
        };
        let mut seen = false;
        let wait = self.cluster.config().network().connect_timeout();
        for node in self.cluster.current_view().nodes() {
            let mut conn = node.acquire(Some(wait)).await?;
            let response = match conn.info(&[command.as_str()]).await {
                Ok(response) => {
                    node.release(conn);
                    response
                }
                Err(e) => {
                    node.forget(conn);
                    return Err(e);
                }
            };
            let Some(value) = response.get(command.as_str()) else {
                continue;
            };
            if aerokv_core::info::is_error_value(value) {
                // The node no longer tracks the job: finished there.
                continue;
            }
            seen = true;
            let active = value
                .split(':')
                .filter_map(|kv| kv.split_once('='))
                .any(|(k, v)| k == "status" && v.starts_with("active"));
            if active {
                return Ok(TaskStatus::InProgress);
            }
        }
        Ok(if seen {
            TaskStatus::Completed
        } else {
            TaskStatus::Pending
        })
    }

    /// Polls until the job completes.
    pub async fn wait(&self, poll_interval: Duration) -> Result<()> {
        loop {
            match self.status().await? {
                TaskStatus::Completed => return Ok(()),
                TaskStatus::Pending | TaskStatus::InProgress => {
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}
