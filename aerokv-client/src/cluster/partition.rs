//! The partition map: which node owns each of the 4096 partitions of a
//! namespace, per replica.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use aerokv_core::{AerokvError, Result};

use crate::cluster::node::Node;
use crate::policy::Replica;

/// Partitions per namespace, fixed by the server.
pub const N_PARTITIONS: usize = 4096;

const BITMAP_LEN: usize = N_PARTITIONS / 8;

/// Replica columns for one namespace. Column 0 is the master column.
#[derive(Debug, Clone)]
struct NamespaceMap {
    /// Regime under which each partition slot was last written. A slot
    /// is only overwritten by an equal or newer regime.
    regimes: Vec<u32>,
    columns: Vec<Vec<Option<Arc<Node>>>>,
}

impl NamespaceMap {
    fn new(n_replicas: usize) -> Self {
        Self {
            regimes: vec![0; N_PARTITIONS],
            columns: vec![vec![None; N_PARTITIONS]; n_replicas],
        }
    }
}

/// The cluster-wide partition table. Lookups read an immutable `Arc`
/// snapshot; tend swaps in a rebuilt snapshot under a short write lock.
#[derive(Debug, Default)]
pub struct PartitionTable {
    snapshot: RwLock<Arc<HashMap<String, NamespaceMap>>>,
    round_robin: AtomicUsize,
}

impl PartitionTable {
    /// An empty table; lookups miss until the first `replicas` update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one node's `replicas` info value, of the form
    /// `ns:regime,n_replicas,b64,b64,...;ns2:...`. Each base64 chunk is
    /// a 512-byte bitmap, MSB first, marking the partitions this node
    /// serves in that replica column.
    pub fn update(&self, node: &Arc<Node>, replicas: &str) -> Result<()> {
        let mut map: HashMap<String, NamespaceMap> =
            (**self.snapshot.read().expect("partition lock poisoned")).clone();

        for entry in replicas.split(';').filter(|e| !e.is_empty()) {
            let (namespace, rest) = entry.split_once(':').ok_or_else(|| {
                AerokvError::Protocol(format!("malformed replicas entry '{}'", entry))
            })?;
            let mut parts = rest.split(',');
            let regime: u32 = parse_field(parts.next(), namespace, "regime")?;
            let n_replicas: usize = parse_field(parts.next(), namespace, "replica count")?;

            let ns_map = map
                .entry(namespace.to_string())
                .or_insert_with(|| NamespaceMap::new(n_replicas));
            if ns_map.columns.len() != n_replicas {
                // Replica count changed; rebuild the columns.
                *ns_map = NamespaceMap::new(n_replicas);
            }

            for column in 0..n_replicas {
                let chunk = parts.next().ok_or_else(|| {
                    AerokvError::Protocol(format!(
                        "replicas entry for '{}' missing bitmap {}",
                        namespace, column
                    ))
                })?;
                let bitmap = BASE64.decode(chunk).map_err(|e| {
                    AerokvError::Protocol(format!("bad replicas bitmap for '{}': {}", namespace, e))
                })?;
                if bitmap.len() != BITMAP_LEN {
                    return Err(AerokvError::Protocol(format!(
                        "replicas bitmap for '{}' is {} bytes, expected {}",
                        namespace,
                        bitmap.len(),
                        BITMAP_LEN
                    )));
                }
                for partition in 0..N_PARTITIONS {
                    if bitmap[partition >> 3] & (0x80 >> (partition & 7)) == 0 {
                        continue;
                    }
                    if regime < ns_map.regimes[partition] {
                        continue;
                    }
                    ns_map.regimes[partition] = regime;
                    ns_map.columns[column][partition] = Some(Arc::clone(node));
                }
            }
        }

        *self.snapshot.write().expect("partition lock poisoned") = Arc::new(map);
        Ok(())
    }

    /// Clears every slot owned by a node that left the cluster.
    pub fn forget(&self, node_name: &str) {
        let mut map: HashMap<String, NamespaceMap> =
            (**self.snapshot.read().expect("partition lock poisoned")).clone();
        for ns_map in map.values_mut() {
            for column in &mut ns_map.columns {
                for slot in column.iter_mut() {
                    if slot.as_ref().is_some_and(|n| n.name() == node_name) {
                        *slot = None;
                    }
                }
            }
        }
        *self.snapshot.write().expect("partition lock poisoned") = Arc::new(map);
    }

    /// Picks the node for a partition under the given replica policy.
    /// `sequence` is the retry attempt, used to advance through the
    /// replica columns.
    pub fn select(
        &self,
        namespace: &str,
        partition: usize,
        replica: Replica,
        sequence: usize,
        rack_ids: &[u32],
    ) -> Option<Arc<Node>> {
        let snapshot = Arc::clone(&self.snapshot.read().expect("partition lock poisoned"));
        let ns_map = snapshot.get(namespace)?;
        let n_cols = ns_map.columns.len();
        if n_cols == 0 {
            return None;
        }

        let start = match replica {
            Replica::Master => 0,
            Replica::Sequence => sequence,
            Replica::Any => self.round_robin.fetch_add(1, Ordering::Relaxed),
            Replica::Random => rand::random::<usize>(),
            Replica::PreferRack => {
                if let Some(node) = rack_preferred(ns_map, namespace, partition, sequence, rack_ids)
                {
                    return Some(node);
                }
                sequence
            }
        };

        if replica == Replica::Master {
            return ns_map.columns[0][partition].clone();
        }
        // Walk the columns so a missing slot falls through to the next
        // replica instead of failing the request.
        for offset in 0..n_cols {
            let column = (start + offset) % n_cols;
            if let Some(node) = &ns_map.columns[column][partition] {
                return Some(Arc::clone(node));
            }
        }
        None
    }

    /// Whether the table has any mapping for the namespace.
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.snapshot
            .read()
            .expect("partition lock poisoned")
            .contains_key(namespace)
    }
}

fn rack_preferred(
    ns_map: &NamespaceMap,
    namespace: &str,
    partition: usize,
    sequence: usize,
    rack_ids: &[u32],
) -> Option<Arc<Node>> {
    let n_cols = ns_map.columns.len();
    for offset in 0..n_cols {
        let column = (sequence + offset) % n_cols;
        if let Some(node) = &ns_map.columns[column][partition] {
            let in_rack = node
                .rack_id(namespace)
                .is_some_and(|rack| rack_ids.contains(&rack));
            if in_rack {
                return Some(Arc::clone(node));
            }
        }
    }
    None
}

fn parse_field<T: std::str::FromStr>(
    field: Option<&str>,
    namespace: &str,
    what: &str,
) -> Result<T> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| {
            AerokvError::Protocol(format!(
                "replicas entry for '{}' has invalid {}",
                namespace, what
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Host, NetworkConfig};

    fn node(name: &str) -> Arc<Node> {
        Arc::new(Node::new(
            name,
            Host::new("127.0.0.1", 3000),
            NetworkConfig::default(),
            None,
        ))
    }

    fn bitmap_with(partitions: &[usize]) -> String {
        let mut bytes = vec![0u8; BITMAP_LEN];
        for &p in partitions {
            bytes[p >> 3] |= 0x80 >> (p & 7);
        }
        BASE64.encode(bytes)
    }

    #[test]
    fn update_assigns_marked_partitions() {
        let table = PartitionTable::new();
        let a = node("A");
        let map = bitmap_with(&[0, 7, 4095]);
        table
            .update(&a, &format!("test:1,1,{};", map))
            .unwrap();

        for p in [0, 7, 4095] {
            let owner = table.select("test", p, Replica::Master, 0, &[]).unwrap();
            assert_eq!(owner.name(), "A");
        }
        assert!(table.select("test", 1, Replica::Master, 0, &[]).is_none());
        assert!(table.has_namespace("test"));
        assert!(!table.has_namespace("demo"));
    }

    #[test]
    fn stale_regime_does_not_overwrite() {
        let table = PartitionTable::new();
        let a = node("A");
        let b = node("B");
        let map = bitmap_with(&[9]);
        table.update(&a, &format!("test:5,1,{};", map)).unwrap();
        table.update(&b, &format!("test:4,1,{};", map)).unwrap();
        let owner = table.select("test", 9, Replica::Master, 0, &[]).unwrap();
        assert_eq!(owner.name(), "A");

        table.update(&b, &format!("test:6,1,{};", map)).unwrap();
        let owner = table.select("test", 9, Replica::Master, 0, &[]).unwrap();
        assert_eq!(owner.name(), "B");
    }

    #[test]
    fn sequence_advances_replica_columns() {
        let table = PartitionTable::new();
        let a = node("A");
        let b = node("B");
        let map = bitmap_with(&[3]);
        let empty = bitmap_with(&[]);
        table
            .update(&a, &format!("test:1,2,{},{};", map, empty))
            .unwrap();
        table
            .update(&b, &format!("test:1,2,{},{};", empty, map))
            .unwrap();

        let first = table.select("test", 3, Replica::Sequence, 0, &[]).unwrap();
        let second = table.select("test", 3, Replica::Sequence, 1, &[]).unwrap();
        assert_eq!(first.name(), "A");
        assert_eq!(second.name(), "B");
        // Wraps around past the last column.
        let third = table.select("test", 3, Replica::Sequence, 2, &[]).unwrap();
        assert_eq!(third.name(), "A");
    }

    #[test]
    fn prefer_rack_falls_back_to_sequence() {
        let table = PartitionTable::new();
        let a = node("A");
        let b = node("B");
        b.set_racks([("test".to_string(), 2u32)].into_iter().collect());
        let map = bitmap_with(&[11]);
        let empty = bitmap_with(&[]);
        table
            .update(&a, &format!("test:1,2,{},{};", map, empty))
            .unwrap();
        table
            .update(&b, &format!("test:1,2,{},{};", empty, map))
            .unwrap();

        // B is in rack 2, so it wins even though A is the master.
        let owner = table
            .select("test", 11, Replica::PreferRack, 0, &[2])
            .unwrap();
        assert_eq!(owner.name(), "B");

        // No rack match: behaves like Sequence.
        let owner = table
            .select("test", 11, Replica::PreferRack, 0, &[9])
            .unwrap();
        assert_eq!(owner.name(), "A");
    }

    #[test]
    fn forget_clears_slots_and_falls_through() {
        let table = PartitionTable::new();
        let a = node("A");
        let b = node("B");
        let map = bitmap_with(&[5]);
        table
            .update(&a, &format!("test:1,2,{},{};", map, bitmap_with(&[])))
            .unwrap();
        table
            .update(&b, &format!("test:1,2,{},{};", bitmap_with(&[]), map))
            .unwrap();

        table.forget("A");
        assert!(table.select("test", 5, Replica::Master, 0, &[]).is_none());
        // Sequence falls through to the surviving replica.
        let owner = table.select("test", 5, Replica::Sequence, 0, &[]).unwrap();
        assert_eq!(owner.name(), "B");
    }

    #[test]
    fn rejects_short_bitmap() {
        let table = PartitionTable::new();
        let a = node("A");
        let short = BASE64.encode([0u8; 16]);
        let err = table.update(&a, &format!("test:1,1,{};", short)).unwrap_err();
        assert!(matches!(err, AerokvError::Protocol(_)));
    }
}
