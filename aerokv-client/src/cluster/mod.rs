//! Cluster membership: seed discovery, the tend loop and the partition
//! router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use aerokv_core::{AerokvError, Result};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::admin;
use crate::config::{ClientConfig, Host};
use crate::net::Connection;

pub mod node;
pub mod partition;

pub use node::Node;
pub use partition::{PartitionTable, N_PARTITIONS};

/// Rounds a peer must appear in before it is admitted.
const FRIEND_OBSERVATIONS: u32 = 2;

/// An immutable membership snapshot. Commands hold one `Arc` for the
/// duration of a request; tend swaps in a new snapshot on change.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    nodes: Vec<Arc<Node>>,
}

impl ClusterView {
    /// Every known node.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Looks a node up by server-assigned id.
    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// True when no node is known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Receives membership and partition-map change notifications.
/// Callbacks run outside cluster locks.
pub trait ClusterObserver: Send + Sync {
    /// A node joined the cluster view.
    fn node_added(&self, _node: &Arc<Node>) {}
    /// A node was dropped from the cluster view.
    fn node_removed(&self, _node: &Arc<Node>) {}
    /// Partition ownership changed.
    fn partition_map_changed(&self) {}
}

/// One peer entry from the `peers-clear-std` / `peers-tls-std` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Peer {
    pub node_id: String,
    pub tls_name: Option<String>,
    pub hosts: Vec<Host>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PeerList {
    pub generation: i64,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Default)]
struct TendState {
    partition_generation: i64,
    peers_generation: i64,
}

#[derive(Debug)]
struct Candidate {
    peer: Peer,
    seen: u32,
}

enum Event {
    Added(Arc<Node>),
    Removed(Arc<Node>),
    PartitionsChanged,
}

/// The live cluster. Owns the node set, the partition table and the
/// background tend task.
pub struct Cluster {
    config: ClientConfig,
    view: RwLock<Arc<ClusterView>>,
    partitions: PartitionTable,
    tend_state: Mutex<HashMap<String, TendState>>,
    candidates: Mutex<HashMap<String, Candidate>>,
    observers: Mutex<Vec<Box<dyn ClusterObserver>>>,
    closed: AtomicBool,
    tend_task: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Seeds the cluster and starts the tend loop. Fails if no seed
    /// yields a reachable, name-matching node.
    pub async fn connect(config: ClientConfig) -> Result<Arc<Self>> {
        let cluster = Arc::new(Self {
            config,
            view: RwLock::new(Arc::new(ClusterView::default())),
            partitions: PartitionTable::new(),
            tend_state: Mutex::new(HashMap::new()),
            candidates: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            tend_task: Mutex::new(None),
        });

        let mut last_err = None;
        for seed in cluster.config.seeds() {
            match cluster.seed(seed).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(seed = %seed, error = %e, "seed failed");
                    last_err = Some(e);
                }
            }
        }
        if cluster.current_view().is_empty() {
            return Err(last_err.unwrap_or_else(|| {
                AerokvError::Cluster("no seed host could be contacted".into())
            }));
        }

        let weak = Arc::downgrade(&cluster);
        let interval = cluster.config.network().tend_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cluster) = weak.upgrade() else { break };
                if cluster.is_closed() {
                    break;
                }
                cluster.tend().await;
            }
        });
        *cluster.tend_task.lock().expect("tend task lock poisoned") = Some(task);
        Ok(cluster)
    }

    /// The current membership snapshot.
    pub fn current_view(&self) -> Arc<ClusterView> {
        Arc::clone(&self.view.read().expect("view lock poisoned"))
    }

    /// The partition router.
    pub fn partitions(&self) -> &PartitionTable {
        &self.partitions
    }

    /// The configuration this cluster was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// A uniformly random node, for cluster-wide info requests.
    pub fn random_node(&self) -> Result<Arc<Node>> {
        let view = self.current_view();
        if view.is_empty() {
            return Err(AerokvError::Cluster("no nodes available".into()));
        }
        let pick = rand::thread_rng().gen_range(0..view.nodes().len());
        Ok(Arc::clone(&view.nodes()[pick]))
    }

    /// Registers an observer for membership and map changes.
    pub fn add_observer(&self, observer: Box<dyn ClusterObserver>) {
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .push(observer);
    }

    /// True once [`Cluster::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the tend loop and drains every pool.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.tend_task.lock().expect("tend task lock poisoned").take() {
            task.abort();
        }
        for node in self.current_view().nodes() {
            node.drain();
        }
        info!("cluster closed");
    }

    fn peers_command(&self) -> &'static str {
        if self.config.network().tls().enabled() {
            "peers-tls-std"
        } else {
            "peers-clear-std"
        }
    }

    /// Contacts a seed, verifies it, and admits it plus the peers it
    /// reports. The first tend round takes ownership from there.
    async fn seed(&self, seed: &Host) -> Result<()> {
        let peers_cmd = self.peers_command();
        let (node, peers) = self.verify_host(seed, peers_cmd).await?;
        let mut events = vec![Event::Added(Arc::clone(&node))];
        self.admit(node);

        if let Some(peers) = peers {
            for peer in peers.peers {
                if self.current_view().node(&peer.node_id).is_some() {
                    continue;
                }
                match self.admit_peer(&peer, peers_cmd).await {
                    Ok(node) => {
                        events.push(Event::Added(node));
                    }
                    Err(e) => {
                        warn!(peer = %peer.node_id, error = %e, "peer unreachable during seeding")
                    }
                }
            }
        }

        self.refresh_partitions().await;
        events.push(Event::PartitionsChanged);
        self.dispatch(events);
        Ok(())
    }

    /// Opens a throwaway connection to a host, logs in when credentials
    /// are configured, and checks the reported cluster name. Returns
    /// the node handle (pool still empty) and its peer list.
    async fn verify_host(
        &self,
        host: &Host,
        peers_cmd: &str,
    ) -> Result<(Arc<Node>, Option<PeerList>)> {
        let mut conn = Connection::connect_for_login(host, self.config.network()).await?;
        if let Some(auth) = self.config.auth() {
            admin::login(&mut conn, auth).await?;
        }
        let response = conn
            .info(&["node", "features", "cluster-name", peers_cmd])
            .await?;
        conn.close();

        let name = response
            .get("node")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                AerokvError::Cluster(format!("{} did not report a node id", host))
            })?;
        if let Some(expected) = self.config.cluster_name() {
            match response.get("cluster-name").map(String::as_str) {
                Some(actual) if actual == expected => {}
                actual => {
                    return Err(AerokvError::Cluster(format!(
                        "{} belongs to cluster {:?}, expected '{}'",
                        host, actual, expected
                    )));
                }
            }
        }

        let peers = match response.get(peers_cmd) {
            Some(value) => Some(parse_peers(value)?),
            None => None,
        };
        let node = Arc::new(Node::new(
            name.clone(),
            host.clone(),
            self.config.network().clone(),
            self.config.auth().cloned(),
        ));
        debug!(node = %node, "verified host");
        Ok((node, peers))
    }

    async fn admit_peer(&self, peer: &Peer, peers_cmd: &str) -> Result<Arc<Node>> {
        let mut last_err = None;
        for host in &peer.hosts {
            let host = match &peer.tls_name {
                Some(tls_name) => host.clone().with_tls_name(tls_name.clone()),
                None => host.clone(),
            };
            match self.verify_host(&host, peers_cmd).await {
                Ok((node, _)) => {
                    if node.name() != peer.node_id {
                        last_err = Some(AerokvError::Cluster(format!(
                            "{} identifies as {}, peers list says {}",
                            host,
                            node.name(),
                            peer.node_id
                        )));
                        continue;
                    }
                    self.admit(Arc::clone(&node));
                    return Ok(node);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| AerokvError::Cluster(format!("peer {} has no hosts", peer.node_id))))
    }

    fn admit(&self, node: Arc<Node>) {
        let mut view = self.view.write().expect("view lock poisoned");
        let mut nodes = (**view).clone();
        nodes.nodes.retain(|n| n.name() != node.name());
        info!(node = %node, "node added");
        nodes.nodes.push(node);
        *view = Arc::new(nodes);
    }

    fn evict(&self, name: &str) -> Option<Arc<Node>> {
        let removed = {
            let mut view = self.view.write().expect("view lock poisoned");
            let mut nodes = (**view).clone();
            let removed = nodes.nodes.iter().position(|n| n.name() == name).map(|i| {
                nodes.nodes.remove(i)
            });
            *view = Arc::new(nodes);
            removed
        };
        if let Some(node) = &removed {
            self.tend_state
                .lock()
                .expect("tend state lock poisoned")
                .remove(name);
            self.partitions.forget(name);
            node.drain();
            warn!(node = %node, "node removed");
        }
        removed
    }

    /// One tend round: refresh every member, count peer observations,
    /// admit friends seen twice, drop members past the failure limit.
    pub async fn tend(&self) {
        let view = self.current_view();
        let peers_cmd = self.peers_command();
        let mut round_peers: HashMap<String, Peer> = HashMap::new();
        let mut events = Vec::new();
        let mut partitions_changed = false;

        for node in view.nodes() {
            match self.tend_node(node, peers_cmd).await {
                Ok(outcome) => {
                    node.reset_failures();
                    node.sweep_idle();
                    if node.session_needs_refresh() {
                        if let Err(e) = node.refresh_session().await {
                            warn!(node = %node, error = %e, "session refresh failed");
                        }
                    }
                    partitions_changed |= outcome.partitions_changed;
                    for peer in outcome.peers {
                        round_peers.insert(peer.node_id.clone(), peer);
                    }
                }
                Err(e) => {
                    let failures = node.record_failure();
                    debug!(node = %node, failures, error = %e, "tend round failed");
                    if failures >= node::MAX_TEND_FAILURES {
                        if let Some(removed) = self.evict(node.name()) {
                            events.push(Event::Removed(removed));
                        }
                    }
                }
            }
        }

        // Friend rule: a peer must be reported in consecutive rounds
        // before it is contacted.
        let ripe: Vec<Peer> = {
            let view = self.current_view();
            let mut candidates = self.candidates.lock().expect("candidate lock poisoned");
            candidates.retain(|id, _| round_peers.contains_key(id));
            let mut ripe = Vec::new();
            for (id, peer) in round_peers {
                if view.node(&id).is_some() {
                    continue;
                }
                let entry = candidates.entry(id).or_insert_with(|| Candidate {
                    peer: peer.clone(),
                    seen: 0,
                });
                entry.peer = peer;
                entry.seen += 1;
                if entry.seen >= FRIEND_OBSERVATIONS {
                    ripe.push(entry.peer.clone());
                }
            }
            candidates.retain(|_, c| c.seen < FRIEND_OBSERVATIONS);
            ripe
        };

        let mut admitted = false;
        for peer in ripe {
            match self.admit_peer(&peer, peers_cmd).await {
                Ok(node) => {
                    admitted = true;
                    events.push(Event::Added(node));
                }
                Err(e) => warn!(peer = %peer.node_id, error = %e, "peer admission failed"),
            }
        }

        // Per-node column updates already happened in tend_node; a full
        // refresh is only needed when membership grew.
        if admitted {
            self.refresh_partitions().await;
        }
        if partitions_changed || admitted {
            events.push(Event::PartitionsChanged);
        }
        self.dispatch(events);
    }

    async fn tend_node(&self, node: &Arc<Node>, peers_cmd: &str) -> Result<TendOutcome> {
        let wait = self.config.network().connect_timeout();
        let mut conn = node.acquire(Some(wait)).await?;
        let result = self.tend_node_on(&mut conn, node, peers_cmd).await;
        match result {
            Ok(outcome) => {
                node.release(conn);
                Ok(outcome)
            }
            Err(e) => {
                node.forget(conn);
                Err(e)
            }
        }
    }

    async fn tend_node_on(
        &self,
        conn: &mut Connection,
        node: &Arc<Node>,
        peers_cmd: &str,
    ) -> Result<TendOutcome> {
        let response = conn
            .info(&["node", "peers-generation", "partition-generation"])
            .await?;
        match response.get("node") {
            Some(name) if name == node.name() => {}
            other => {
                return Err(AerokvError::Cluster(format!(
                    "{} now identifies as {:?}",
                    node, other
                )));
            }
        }
        let peers_generation = parse_generation(&response, "peers-generation")?;
        let partition_generation = parse_generation(&response, "partition-generation")?;

        let (peers_stale, partitions_stale) = {
            let state = self.tend_state.lock().expect("tend state lock poisoned");
            let known = state.get(node.name());
            (
                known.map_or(true, |s| s.peers_generation != peers_generation),
                known.map_or(true, |s| s.partition_generation != partition_generation),
            )
        };

        let mut outcome = TendOutcome::default();
        if peers_stale {
            let response = conn.info(&[peers_cmd]).await?;
            if let Some(value) = response.get(peers_cmd) {
                outcome.peers = parse_peers(value)?.peers;
            }
        }
        if partitions_stale {
            let mut commands = vec!["replicas"];
            if !self.config.rack_ids().is_empty() {
                commands.push("racks:");
            }
            let response = conn.info(&commands).await?;
            if let Some(value) = response.get("replicas") {
                self.partitions.update(node, value)?;
                outcome.partitions_changed = true;
            }
            if let Some(value) = response.get("racks:") {
                node.set_racks(parse_racks(node.name(), value));
            }
        }

        let mut state = self.tend_state.lock().expect("tend state lock poisoned");
        let entry = state.entry(node.name().to_string()).or_default();
        entry.peers_generation = peers_generation;
        entry.partition_generation = partition_generation;
        Ok(outcome)
    }

    /// Rebuilds partition ownership from every current member. Used at
    /// seeding and after membership changes.
    async fn refresh_partitions(&self) {
        for node in self.current_view().nodes() {
            let result = async {
                let wait = self.config.network().connect_timeout();
                let mut conn = node.acquire(Some(wait)).await?;
                let response = conn.info(&["replicas"]).await;
                match response {
                    Ok(response) => {
                        node.release(conn);
                        if let Some(value) = response.get("replicas") {
                            self.partitions.update(node, value)?;
                        }
                        Ok(())
                    }
                    Err(e) => {
                        node.forget(conn);
                        Err(e)
                    }
                }
            }
            .await;
            if let Err(e) = result {
                debug!(node = %node, error = %e, "replica refresh failed");
            }
        }
    }

    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.lock().expect("observer lock poisoned");
        for event in &events {
            for observer in observers.iter() {
                match event {
                    Event::Added(node) => observer.node_added(node),
                    Event::Removed(node) => observer.node_removed(node),
                    Event::PartitionsChanged => observer.partition_map_changed(),
                }
            }
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.current_view().nodes().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Default)]
struct TendOutcome {
    peers: Vec<Peer>,
    partitions_changed: bool,
}

fn parse_generation(response: &HashMap<String, String>, key: &str) -> Result<i64> {
    response
        .get(key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| AerokvError::Protocol(format!("missing or invalid {} value", key)))
}

/// Parses `generation,default-port,[[node-id,tls-name,[host,...]],...]`.
/// Hosts without an explicit port get the advertised default port.
pub(crate) fn parse_peers(value: &str) -> Result<PeerList> {
    let malformed = || AerokvError::Protocol(format!("malformed peers value '{}'", value));

    let (generation, rest) = value.split_once(',').ok_or_else(malformed)?;
    let generation: i64 = generation.parse().map_err(|_| malformed())?;
    let (default_port, list) = rest.split_once(',').ok_or_else(malformed)?;
    let default_port: u16 = if default_port.is_empty() {
        crate::config::DEFAULT_PORT
    } else {
        default_port.parse().map_err(|_| malformed())?
    };

    let mut peers = Vec::new();
    let mut rest = list
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(malformed)?;
    while !rest.is_empty() {
        rest = rest.trim_start_matches(',');
        if rest.is_empty() {
            break;
        }
        let (entry, tail) = take_bracketed(rest).ok_or_else(malformed)?;
        rest = tail;

        let (node_id, entry_rest) = entry.split_once(',').ok_or_else(malformed)?;
        let (tls_name, hosts_list) = entry_rest.split_once(',').ok_or_else(malformed)?;
        let hosts_inner = hosts_list
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(malformed)?;

        let mut hosts = Vec::new();
        for raw in hosts_inner.split(',').filter(|h| !h.is_empty()) {
            hosts.push(parse_peer_host(raw, default_port).ok_or_else(malformed)?);
        }
        peers.push(Peer {
            node_id: node_id.to_string(),
            tls_name: (!tls_name.is_empty()).then(|| tls_name.to_string()),
            hosts,
        });
    }
    Ok(PeerList { generation, peers })
}

/// Splits off one `[...]` group, returning its contents and the tail
/// after the closing bracket.
fn take_bracketed(s: &str) -> Option<(&str, &str)> {
    if !s.starts_with('[') {
        return None;
    }
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&s[1..i], &s[i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_peer_host(raw: &str, default_port: u16) -> Option<Host> {
    // A trailing `:digits` is a port; anything else (bare IPv6) keeps
    // the default port.
    match raw.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) && !name.is_empty() => {
            Some(Host::new(name, port.parse().ok()?))
        }
        _ => Some(Host::new(raw, default_port)),
    }
}

/// Parses the `racks:` info value and returns the rack id per namespace
/// for the given node. The value looks like
/// `ns=test:rack_1=A1,A2,rack_2=B1;ns=bar:rack_1=B1`.
pub(crate) fn parse_racks(node_name: &str, value: &str) -> HashMap<String, u32> {
    let mut racks = HashMap::new();
    for entry in value.split(';').filter(|e| !e.is_empty()) {
        let Some((ns, rest)) = entry.split_once(':') else {
            continue;
        };
        let Some(namespace) = ns.strip_prefix("ns=") else {
            continue;
        };
        let mut current_rack: Option<u32> = None;
        for token in rest.split(',') {
            if let Some(spec) = token.strip_prefix("rack_") {
                match spec.split_once('=') {
                    Some((id, first_node)) => {
                        current_rack = id.parse().ok();
                        if let (Some(rack), true) = (current_rack, first_node == node_name) {
                            racks.insert(namespace.to_string(), rack);
                        }
                    }
                    None => current_rack = None,
                }
            } else if let (Some(rack), true) = (current_rack, token == node_name) {
                racks.insert(namespace.to_string(), rack);
            }
        }
    }
    racks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_parse_basic() {
        let parsed = parse_peers("12,3000,[[A1,,[172.17.0.2]],[B2,,[172.17.0.3:3100]]]").unwrap();
        assert_eq!(parsed.generation, 12);
        assert_eq!(parsed.peers.len(), 2);
        assert_eq!(parsed.peers[0].node_id, "A1");
        assert_eq!(parsed.peers[0].hosts, vec![Host::new("172.17.0.2", 3000)]);
        assert_eq!(parsed.peers[1].hosts, vec![Host::new("172.17.0.3", 3100)]);
    }

    #[test]
    fn peers_parse_tls_name_and_multiple_hosts() {
        let parsed =
            parse_peers("3,4333,[[C3,cert.example,[10.0.0.1,10.0.0.2:4444]]]").unwrap();
        let peer = &parsed.peers[0];
        assert_eq!(peer.tls_name.as_deref(), Some("cert.example"));
        assert_eq!(
            peer.hosts,
            vec![Host::new("10.0.0.1", 4333), Host::new("10.0.0.2", 4444)]
        );
    }

    #[test]
    fn peers_parse_empty_list() {
        let parsed = parse_peers("7,3000,[]").unwrap();
        assert_eq!(parsed.generation, 7);
        assert!(parsed.peers.is_empty());
    }

    #[test]
    fn peers_parse_rejects_garbage() {
        assert!(parse_peers("not-a-generation,3000,[]").is_err());
        assert!(parse_peers("1,3000,[[A1,,[h").is_err());
    }

    #[test]
    fn racks_parse_picks_own_rack() {
        let racks = parse_racks("A2", "ns=test:rack_1=A1,A2,rack_2=B1;ns=bar:rack_3=A2");
        assert_eq!(racks.get("test"), Some(&1));
        assert_eq!(racks.get("bar"), Some(&3));

        let racks = parse_racks("B1", "ns=test:rack_1=A1,A2,rack_2=B1");
        assert_eq!(racks.get("test"), Some(&2));
    }

    #[test]
    fn racks_parse_ignores_other_nodes() {
        let racks = parse_racks("Z9", "ns=test:rack_1=A1,A2");
        assert!(racks.is_empty());
    }
}
