//! Batch commands: group keys by owning node, dispatch concurrently,
//! reassemble results in input order. Covers both reads and
//! per-record write operations.

use std::collections::HashMap;
use std::sync::Arc;

use aerokv_core::key::Key;
use aerokv_core::operations::{EncodedOp, Operation};
use aerokv_core::protocol::constants::{
    field_type, info1, info2, info3, msg_type, MAX_BIN_NAME_LEN,
};
use aerokv_core::protocol::message::{MessageBuilder, MessageHeader, ParsedMessage};
use aerokv_core::protocol::proto::ProtoFrame;
use aerokv_core::value::SendBoolAs;
use aerokv_core::{AerokvError, Record, Result};
use bytes::{BufMut, BytesMut};
use futures::future::join_all;
use tracing::debug;

use crate::cluster::{Cluster, Node};
use crate::policy::{BatchPolicy, Replica};

/// Which bins a batch read returns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Bins {
    /// Every bin.
    #[default]
    All,
    /// Metadata only, no bin data.
    Header,
    /// The named bins.
    Named(Vec<String>),
}

/// One record request inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRead {
    /// The record to read.
    pub key: Key,
    /// Bin selector.
    pub bins: Bins,
}

impl BatchRead {
    /// Reads every bin of the record.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            bins: Bins::All,
        }
    }

    /// Reads only the named bins.
    pub fn select(key: Key, bins: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            key,
            bins: Bins::Named(bins.into_iter().map(Into::into).collect()),
        }
    }

    /// Reads metadata only.
    pub fn header(key: Key) -> Self {
        Self {
            key,
            bins: Bins::Header,
        }
    }

    fn read_attr(&self) -> u8 {
        match &self.bins {
            Bins::All => info1::READ | info1::GET_ALL,
            Bins::Header => info1::READ | info1::GET_ALL | info1::NOBINDATA,
            Bins::Named(_) => info1::READ,
        }
    }
}

/// One record write inside a batch: the key and the operations applied
/// to it, in order. Reads among the operations return their results in
/// the record slot.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWrite {
    /// The record to write.
    pub key: Key,
    /// Operations applied in order.
    pub ops: Vec<Operation>,
}

impl BatchWrite {
    /// Applies `ops` to the record.
    pub fn new(key: Key, ops: Vec<Operation>) -> Self {
        Self { key, ops }
    }
}

/// The outcome of one batch slot: the record, or the per-record error.
/// A miss carries the not-found server error in its slot.
pub type BatchResult = Result<Record>;

/// A read or write sub-request; the dispatch and reassembly machinery
/// is shared between the two.
#[derive(Clone, Copy)]
enum BatchEntry<'a> {
    Read(&'a BatchRead),
    Write(&'a BatchWrite),
}

impl BatchEntry<'_> {
    fn key(&self) -> &Key {
        match self {
            BatchEntry::Read(read) => &read.key,
            BatchEntry::Write(write) => &write.key,
        }
    }
}

/// Reads a batch of records, returning one slot per input in the same
/// order. With `respond_all_keys`, a failing node poisons only its own
/// slots; otherwise the first node failure fails the whole call.
pub(crate) async fn batch_get(
    cluster: &Cluster,
    policy: &BatchPolicy,
    reads: &[BatchRead],
) -> Result<Vec<BatchResult>> {
    let entries: Vec<BatchEntry> = reads.iter().map(BatchEntry::Read).collect();
    run_batch(cluster, policy, &entries).await
}

/// Applies per-record operations to a batch of records, returning one
/// slot per input in the same order. Writes always route to the
/// partition master.
pub(crate) async fn batch_operate(
    cluster: &Cluster,
    policy: &BatchPolicy,
    writes: &[BatchWrite],
) -> Result<Vec<BatchResult>> {
    let entries: Vec<BatchEntry> = writes.iter().map(BatchEntry::Write).collect();
    run_batch(cluster, policy, &entries).await
}

async fn run_batch(
    cluster: &Cluster,
    policy: &BatchPolicy,
    entries: &[BatchEntry<'_>],
) -> Result<Vec<BatchResult>> {
    let send_bool_as = cluster.config().send_bool_as();
    let mut slots: Vec<Option<BatchResult>> = (0..entries.len()).map(|_| None).collect();

    // Group input indexes by owning node.
    let mut groups: HashMap<String, (Arc<Node>, Vec<usize>)> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let replica = match entry {
            BatchEntry::Read(_) => policy.base.replica,
            BatchEntry::Write(_) => Replica::Master,
        };
        let key = entry.key();
        let node = cluster.partitions().select(
            &key.namespace,
            usize::from(key.partition_id()),
            replica,
            0,
            cluster.config().rack_ids(),
        );
        match node {
            Some(node) => {
                groups
                    .entry(node.name().to_string())
                    .or_insert_with(|| (node, Vec::new()))
                    .1
                    .push(index);
            }
            None => {
                slots[index] = Some(Err(AerokvError::Cluster(
                    "no node owns the target partition".into(),
                )));
            }
        }
    }

    let dispatches = groups.into_values().map(|(node, indexes)| async move {
        let result = batch_on_node(policy, &node, entries, &indexes, send_bool_as).await;
        (node, indexes, result)
    });

    for (node, indexes, result) in join_all(dispatches).await {
        match result {
            Ok(node_slots) => {
                for (index, slot) in indexes.into_iter().zip(node_slots) {
                    slots[index] = Some(slot);
                }
            }
            Err(e) if policy.respond_all_keys => {
                debug!(node = %node, error = %e, "batch node failed");
                for index in indexes {
                    slots[index] = Some(Err(AerokvError::Cluster(format!(
                        "batch slice on {} failed: {}",
                        node, e
                    ))));
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(slots
        .into_iter()
        .map(|slot| slot.unwrap_or(Err(AerokvError::Cluster("slot never dispatched".into()))))
        .collect())
}

/// Runs one node's share of the batch and returns a result per index,
/// in the order of `indexes`.
async fn batch_on_node(
    policy: &BatchPolicy,
    node: &Arc<Node>,
    entries: &[BatchEntry<'_>],
    indexes: &[usize],
    send_bool_as: SendBoolAs,
) -> Result<Vec<BatchResult>> {
    let frame = build_batch_frame(policy, entries, indexes, send_bool_as)?;
    let mut by_index: HashMap<u32, BatchResult> = HashMap::new();

    let wait = (!policy.base.total_timeout.is_zero()).then_some(policy.base.total_timeout);
    let mut conn = node.acquire(wait).await?;
    if let Err(e) = conn.send(frame).await {
        node.forget(conn);
        return Err(e);
    }
    'frames: loop {
        let reply = match conn.receive().await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                node.forget(conn);
                return Err(AerokvError::Connection(format!(
                    "{} closed mid-batch",
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
                if parsed.header.result_code != 0 {
                    node.forget(conn);
                    return Err(AerokvError::from_code(
                        parsed.header.result_code,
                        Some(node.name().to_string()),
                    ));
                }
                node.release(conn);
                break 'frames;
            }
            let index = match parsed
                .field(field_type::BATCH_INDEX)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
            {
                Some(raw) => u32::from_be_bytes(raw),
                None => {
                    node.forget(conn);
                    return Err(AerokvError::Protocol(
                        "batch response message without an index field".into(),
                    ));
                }
            };
            let slot = match parsed.header.result_code {
                0 => {
                    let generation = parsed.header.generation;
                    let expiration = parsed.header.expiration;
                    let key = parsed.key();
                    Ok(Record::new(key, parsed.into_bins(), generation, expiration))
                }
                code => Err(AerokvError::from_code(code, Some(node.name().to_string()))),
            };
            by_index.insert(index, slot);
        }
    }

    Ok(indexes
        .iter()
        .map(|index| {
            by_index.remove(&(*index as u32)).unwrap_or(Err(
                AerokvError::Protocol("batch response missing a slot".into()),
            ))
        })
        .collect())
}

/// Builds the batch-index frame for one node's keys. The sub-request
/// table repeats `{index, digest}`; a read entry collapses onto the
/// previous one when namespace, set and bin list all match. Write
/// entries always spell out their operations.
fn build_batch_frame(
    policy: &BatchPolicy,
    entries: &[BatchEntry<'_>],
    indexes: &[usize],
    send_bool_as: SendBoolAs,
) -> Result<ProtoFrame> {
    let mut table = BytesMut::new();
    table.put_u32(indexes.len() as u32);
    // Allow the server to run sub-transactions inline.
    table.put_u8(1);

    let mut has_write = false;
    let mut previous: Option<&BatchRead> = None;
    for &index in indexes {
        let entry = &entries[index];
        let key = entry.key();
        table.put_u32(index as u32);
        table.put_slice(&key.digest);

        match entry {
            BatchEntry::Read(read) => {
                let repeat = previous.is_some_and(|prev| {
                    prev.key.namespace == read.key.namespace
                        && prev.key.set_name == read.key.set_name
                        && prev.bins == read.bins
                });
                if repeat {
                    table.put_u8(1);
                    continue;
                }
                table.put_u8(0);
                table.put_u8(read.read_attr());
                table.put_u8(0);

                let named = match &read.bins {
                    Bins::Named(bins) => bins.as_slice(),
                    _ => &[],
                };
                put_batch_fields(&mut table, key, named.len() as u16);
                for bin in named {
                    let op = Operation::get(bin.clone()).encode(send_bool_as)?;
                    put_batch_op(&mut table, &op)?;
                }
                previous = Some(read);
            }
            BatchEntry::Write(write) => {
                has_write = true;
                table.put_u8(0);
                table.put_u8(0);
                table.put_u8(info2::WRITE | info2::RESPOND_ALL_OPS);
                put_batch_fields(&mut table, key, write.ops.len() as u16);
                for op in &write.ops {
                    put_batch_op(&mut table, &op.encode(send_bool_as)?)?;
                }
                previous = None;
            }
        }
    }

    let n_fields = 1 + u16::from(policy.base.filter_expression.is_some());
    let mut header = MessageHeader {
        info1: info1::BATCH,
        transaction_ttl: policy
            .base
            .total_timeout
            .as_millis()
            .try_into()
            .unwrap_or(u32::MAX),
        n_fields,
        ..Default::default()
    };
    if has_write {
        header.info2 = info2::WRITE;
    } else {
        header.info1 |= info1::READ;
    }
    let mut builder = MessageBuilder::new(header);
    builder.write_field(field_type::BATCH_INDEX, &table);
    if let Some(expr) = &policy.base.filter_expression {
        builder.write_field(field_type::FILTER_EXPRESSION, expr.as_bytes());
    }
    builder.finish()
}

/// Field and op counts followed by the namespace and set fields of one
/// spelled-out table entry.
fn put_batch_fields(table: &mut BytesMut, key: &Key, n_ops: u16) {
    let n_fields: u16 = if key.set_name.is_empty() { 1 } else { 2 };
    table.put_u16(n_fields);
    table.put_u16(n_ops);
    put_batch_field(table, field_type::NAMESPACE, key.namespace.as_bytes());
    if !key.set_name.is_empty() {
        put_batch_field(table, field_type::SET, key.set_name.as_bytes());
    }
}

fn put_batch_field(table: &mut BytesMut, ftype: u8, data: &[u8]) {
    table.put_u32(data.len() as u32 + 1);
    table.put_u8(ftype);
    table.put_slice(data);
}

/// One op-table entry inside a batch sub-request, in the same wire
/// shape as a single-record op.
fn put_batch_op(table: &mut BytesMut, op: &EncodedOp) -> Result<()> {
    let name = op.bin.as_deref().unwrap_or("");
    if name.len() > MAX_BIN_NAME_LEN {
        return Err(AerokvError::Param(format!(
            "bin name {:?} exceeds {} bytes",
            name, MAX_BIN_NAME_LEN
        )));
    }
    table.put_u32((4 + name.len() + op.payload.len()) as u32);
    table.put_u8(op.op_code);
    table.put_u8(op.particle);
    table.put_u8(0);
    table.put_u8(name.len() as u8);
    table.put_slice(name.as_bytes());
    table.put_slice(&op.payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aerokv_core::value::Value;

    fn reads() -> Vec<BatchRead> {
        vec![
            BatchRead::new(Key::new("test", "demo", 1i64).unwrap()),
            BatchRead::new(Key::new("test", "demo", 2i64).unwrap()),
            BatchRead::select(Key::new("test", "other", 3i64).unwrap(), ["a"]),
        ]
    }

    fn read_frame(reads: &[BatchRead], indexes: &[usize]) -> ProtoFrame {
        let entries: Vec<BatchEntry> = reads.iter().map(BatchEntry::Read).collect();
        build_batch_frame(&BatchPolicy::default(), &entries, indexes, SendBoolAs::Bool).unwrap()
    }

    #[test]
    fn batch_frame_header_bits() {
        let frame = read_frame(&reads(), &[0, 1, 2]);
        let parsed = ParsedMessage::parse(&frame.payload).unwrap();
        assert_eq!(parsed.header.info1, info1::READ | info1::BATCH);
        assert_eq!(parsed.header.info2, 0);
        assert_eq!(parsed.header.n_fields, 1);
        assert!(parsed.field(field_type::BATCH_INDEX).is_some());
    }

    #[test]
    fn batch_table_collapses_repeats() {
        let reads = reads();
        let frame = read_frame(&reads, &[0, 1, 2]);
        let parsed = ParsedMessage::parse(&frame.payload).unwrap();
        let table = parsed.field(field_type::BATCH_INDEX).unwrap();

        assert_eq!(&table[0..4], &3u32.to_be_bytes());
        assert_eq!(table[4], 1);
        // First entry spells out namespace and set.
        assert_eq!(&table[5..9], &0u32.to_be_bytes());
        assert_eq!(table[29], 0);
        // Entry 0 occupies 49 bytes; entry 1 shares its shape and
        // collapses to index + digest + repeat flag.
        let entry1 = 5 + 49;
        assert_eq!(&table[entry1..entry1 + 4], &1u32.to_be_bytes());
        assert_eq!(table[entry1 + 24], 1);
        // Entry 2 reads a different set, so it spells everything out.
        let entry2 = entry1 + 25;
        assert_eq!(&table[entry2..entry2 + 4], &2u32.to_be_bytes());
        assert_eq!(table[entry2 + 24], 0);
    }

    #[test]
    fn batch_entry_repeat_flag_positions() {
        let reads = vec![
            BatchRead::new(Key::new("test", "demo", 1i64).unwrap()),
            BatchRead::new(Key::new("test", "demo", 2i64).unwrap()),
        ];
        let frame = read_frame(&reads, &[0, 1]);
        let parsed = ParsedMessage::parse(&frame.payload).unwrap();
        let table = parsed.field(field_type::BATCH_INDEX).unwrap();

        // count(4) + inline(1), then entry 0: index(4) digest(20) repeat(1)=0
        assert_eq!(table[4 + 1 + 4 + 20], 0);
        // entry 0 continues: attr1(1) attr2(1) n_fields(2) n_ops(2)
        // + ns field + set field
        let ns_field = 4 + 1 + "test".len();
        let set_field = 4 + 1 + "demo".len();
        let entry1 = 4 + 1 + 4 + 20 + 1 + 1 + 1 + 2 + 2 + ns_field + set_field;
        // entry 1: index(4) digest(20) repeat(1)=1
        assert_eq!(&table[entry1..entry1 + 4], &1u32.to_be_bytes());
        assert_eq!(table[entry1 + 24], 1);
        assert_eq!(table.len(), entry1 + 25);
    }

    #[test]
    fn batch_write_frame_is_write_shaped() {
        let writes = vec![
            BatchWrite::new(
                Key::new("test", "demo", 1i64).unwrap(),
                vec![Operation::put("a", Value::Int(1))],
            ),
            BatchWrite::new(
                Key::new("test", "demo", 2i64).unwrap(),
                vec![Operation::put("a", Value::Int(1))],
            ),
        ];
        let entries: Vec<BatchEntry> = writes.iter().map(BatchEntry::Write).collect();
        let frame =
            build_batch_frame(&BatchPolicy::default(), &entries, &[0, 1], SendBoolAs::Bool)
                .unwrap();
        let parsed = ParsedMessage::parse(&frame.payload).unwrap();
        assert_eq!(parsed.header.info1, info1::BATCH);
        assert_eq!(parsed.header.info2, info2::WRITE);

        let table = parsed.field(field_type::BATCH_INDEX).unwrap();
        // Entry 0: index(4) digest(20) repeat(1)=0 attr1(1)=0 then the
        // write bits in attr2.
        assert_eq!(table[4 + 1 + 4 + 20], 0);
        assert_eq!(table[4 + 1 + 4 + 20 + 1], 0);
        assert_eq!(
            table[4 + 1 + 4 + 20 + 2],
            info2::WRITE | info2::RESPOND_ALL_OPS
        );
        // Write entries never collapse: identical shapes still spell
        // out. Entry 0: 25 header bytes + 6 counts + ns(9) + set(9)
        // + op(4 + 4 + 1 + 8).
        let entry1 = 5 + 25 + 6 + 9 + 9 + 17;
        assert_eq!(&table[entry1..entry1 + 4], &1u32.to_be_bytes());
        assert_eq!(table[entry1 + 24], 0);
    }
}
