//! Cluster membership and parallel query fan-out.
//!
//! The [`Cluster`] is the only owner of shared state: a registry of nodes
//! keyed by their canonical address. Discovery walks the peers graph
//! breadth-first from the seeds; fan-outs run one task per node and
//! aggregate results per node, never failing as a whole.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time;

use crate::config::Settings;
use crate::error::Error;
use crate::node::{Endpoint, Node, NodeKey};
use crate::task;

/// Aggregate of one fan-out: exactly one entry per queried node.
pub type NodeMap<T> = HashMap<NodeKey, Result<T, Error>>;

/// A cluster of nodes, discovered from seed addresses.
pub struct Cluster {
    settings: Settings,
    seeds: Vec<Endpoint>,
    nodes: Mutex<HashMap<NodeKey, Arc<Node>>>,
}

impl Cluster {
    pub fn new(seeds: Vec<Endpoint>, settings: Settings) -> Self {
        Self {
            settings,
            seeds,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Discover the cluster from the seed list, replacing any previous
    /// registry. Unreachable seeds are kept as placeholders so they can
    /// be reported rather than silently dropped.
    pub fn connect(&self) {
        let registry = self.discover();

        self.swap_registry(registry);
    }

    /// Re-discover membership if any live node reports a new peers
    /// generation. The registry is swapped atomically; nodes that fell
    /// out of the new generation are closed.
    pub fn refresh(&self) {
        let live = self.live_nodes();

        if live.is_empty() {
            // Nothing alive to ask: retry the seeds instead.
            if !self.seeds.is_empty() {
                self.connect();
            }
            return;
        }
        let changed = live
            .iter()
            .map(|node| {
                let node = node.clone();
                task::spawn(format!("refresh {node}"), move || node.has_peers_changed())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .any(|probe| probe.result().unwrap_or(true));

        if changed {
            log::debug!(target: "cluster", "Peers generation changed, re-discovering membership");
            self.connect();
        }
    }

    /// Walk the peers graph breadth-first from the seeds and build a new
    /// registry. Nodes are deduplicated by node id; the first address
    /// that successfully connects wins.
    fn discover(&self) -> HashMap<NodeKey, Arc<Node>> {
        let mut registry: HashMap<NodeKey, Arc<Node>> = HashMap::new();
        let mut ids: HashMap<String, NodeKey> = HashMap::new();
        let mut visited: HashSet<NodeKey> = HashSet::new();
        let mut tls_names: HashMap<NodeKey, Option<String>> = HashMap::new();
        let mut frontier: VecDeque<(Endpoint, bool)> = self
            .seeds
            .iter()
            .map(|endpoint| (endpoint.clone(), true))
            .collect();

        while let Some((mut endpoint, is_seed)) = frontier.pop_front() {
            let key = endpoint.key();

            // Peers records can disagree on a node's TLS name; the record
            // seen first wins.
            match tls_names.entry(key.clone()) {
                Entry::Occupied(entry) => {
                    if *entry.get() != endpoint.tls_name {
                        log::warn!(
                            target: "cluster",
                            "Conflicting TLS names for {key}: keeping {:?}, ignoring {:?}",
                            entry.get(),
                            endpoint.tls_name
                        );
                        endpoint.tls_name = entry.get().clone();
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(endpoint.tls_name.clone());
                }
            }
            if !visited.insert(key) {
                continue;
            }
            let node = Node::connect(&endpoint, &self.settings);

            if !node.is_alive() {
                if is_seed {
                    registry.entry(node.key()).or_insert(node);
                }
                continue;
            }
            match ids.entry(node.node_id()) {
                Entry::Occupied(_) => {
                    // Another address already reached this node.
                    node.close();
                    continue;
                }
                Entry::Vacant(entry) => {
                    entry.insert(node.key());
                }
            }
            registry.insert(node.key(), node.clone());

            if self.settings.only_connect_seed {
                continue;
            }
            match node.discovery_peers() {
                Ok(peers) => {
                    for endpoints in peers {
                        for endpoint in endpoints {
                            frontier.push_back((endpoint, false));
                        }
                    }
                }
                Err(e) => {
                    log::warn!(target: "cluster", "Failed to list peers of {node}: {e}");
                }
            }
        }
        registry
    }

    fn swap_registry(&self, new: HashMap<NodeKey, Arc<Node>>) {
        let old = {
            let mut nodes = self.nodes.lock().expect("cluster registry lock");

            std::mem::replace(&mut *nodes, new)
        };
        // Closing happens outside the lock; in-flight callers holding the
        // old nodes see their pools drained, nothing else.
        for node in old.into_values() {
            node.close();
        }
    }

    /// Snapshot of the registry, ordered by node key.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<_> = self
            .nodes
            .lock()
            .expect("cluster registry lock")
            .values()
            .cloned()
            .collect();

        nodes.sort_by_key(|node| node.key());
        nodes
    }

    pub fn live_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes().into_iter().filter(|n| n.is_alive()).collect()
    }

    pub fn get(&self, key: &NodeKey) -> Option<Arc<Node>> {
        self.nodes
            .lock()
            .expect("cluster registry lock")
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().expect("cluster registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map of node key to discovered node id.
    pub fn node_ids(&self) -> HashMap<NodeKey, String> {
        self.nodes()
            .iter()
            .map(|node| (node.key(), node.node_id()))
            .collect()
    }

    /// Reverse lookup: node id to node key.
    pub fn keys_by_id(&self) -> HashMap<String, NodeKey> {
        self.nodes()
            .iter()
            .map(|node| (node.node_id(), node.key()))
            .collect()
    }

    /// Invoke `op` on every node in parallel, including placeholders, and
    /// aggregate per node. One node failing never hides the others.
    pub fn info_all<T, F>(&self, label: &str, op: F) -> NodeMap<T>
    where
        F: Fn(&Node) -> Result<T, Error> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.info_all_on(label, &self.nodes(), op)
    }

    /// Like [`Cluster::info_all`], on an explicit selection of nodes.
    pub fn info_all_on<T, F>(&self, label: &str, nodes: &[Arc<Node>], op: F) -> NodeMap<T>
    where
        F: Fn(&Node) -> Result<T, Error> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        let tasks: Vec<(NodeKey, task::Task<Result<T, Error>>)> = nodes
            .iter()
            .map(|node| {
                let key = node.key();
                let node = node.clone();
                let op = op.clone();
                let task = task::spawn(format!("{label} {key}"), move || op(&node));

                (key, task)
            })
            .collect();

        tasks
            .into_iter()
            .map(|(key, task)| (key, task.result().and_then(|result| result)))
            .collect()
    }

    /// Like [`Cluster::info_all`], bounded by an overall deadline. Nodes
    /// that miss it are recorded as `Cancelled` and their pools closed so
    /// the straggling socket is not reused.
    pub fn info_all_within<T, F>(&self, label: &str, timeout: time::Duration, op: F) -> NodeMap<T>
    where
        F: Fn(&Node) -> Result<T, Error> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let nodes = self.nodes();
        let op = Arc::new(op);
        let started = time::Instant::now();
        let tasks: Vec<(Arc<Node>, task::Task<Result<T, Error>>)> = nodes
            .iter()
            .map(|node| {
                let task = {
                    let node = node.clone();
                    let op = op.clone();

                    task::spawn(format!("{label} {node}"), move || op(&node))
                };
                (node.clone(), task)
            })
            .collect();

        tasks
            .into_iter()
            .map(|(node, task)| {
                let remaining = timeout.saturating_sub(started.elapsed());

                match task.result_timeout(remaining).and_then(|result| result) {
                    Ok(value) => (node.key(), Ok(value)),
                    Err(Error::Cancelled) => {
                        node.close();
                        (node.key(), Err(Error::Cancelled))
                    }
                    Err(e) => (node.key(), Err(e)),
                }
            })
            .collect()
    }

    /// Run one raw info command everywhere.
    pub fn info_command_all(&self, command: &str) -> NodeMap<String> {
        let command = command.to_owned();

        self.info_all(&format!("asinfo {command}"), move |node| {
            node.info(&command)
        })
    }

    /// Union of the namespaces reported by any node.
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.info_all("namespaces", |node| node.namespaces())
            .into_values()
            .flatten()
            .flatten()
            .collect()
    }

    /// The node expected to act as principal: the maximum
    /// `paxos_principal` reported by any alive node, falling back to the
    /// maximum zero-padded node id when the statistic is absent.
    pub fn expected_principal(&self) -> Option<String> {
        let live = self.live_nodes();

        if live.is_empty() {
            return None;
        }
        let stats = self.info_all_on("principal", &live, |node| node.statistics());
        let ids = self.node_ids();
        let reported = stats
            .iter()
            .filter_map(|(key, result)| {
                let principal = result.as_ref().ok()?.get("paxos_principal")?;
                let id = ids.get(key)?;

                Some((zfill16(principal), zfill16(id), principal.clone()))
            })
            .max();

        if let Some((_, _, principal)) = reported {
            return Some(principal);
        }
        live.iter().map(|node| node.node_id()).max_by_key(|id| zfill16(id))
    }
}

/// Pad a node id to 16 characters for lexicographic comparison, the way
/// the consensus protocol compares them.
fn zfill16(id: &str) -> String {
    format!("{id:0>16}")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Timeouts;
    use crate::test::MockServer;

    fn settings() -> Settings {
        Settings {
            timeouts: Timeouts {
                connect: time::Duration::from_millis(500),
                read: time::Duration::from_millis(2000),
            },
            ..Settings::default()
        }
    }

    #[test]
    fn test_single_healthy_seed() {
        let server = MockServer::healthy("BB9000000000001");
        server.set("peers-generation", "7");
        server.set(
            "peers-clear-std",
            format!("7,3000,[{}]", server.peers_record("BB9000000000001")),
        );

        let cluster = Cluster::new(vec![server.endpoint()], settings());
        cluster.connect();

        assert_eq!(cluster.len(), 1);
        let node = cluster.get(&server.key()).unwrap();
        assert_eq!(node.node_id(), "BB9000000000001");
        assert!(node.is_alive());
        assert_eq!(
            cluster.expected_principal().as_deref(),
            Some("BB9000000000001")
        );
    }

    #[test]
    fn test_two_node_discovery() {
        let a = MockServer::healthy("A00000000000001");
        let b = MockServer::healthy("B00000000000001");

        a.set("peers-generation", "7");
        b.set("peers-generation", "7");
        a.set("peers-clear-std", format!("7,3000,[{}]", b.peers_record("B")));
        b.set("peers-clear-std", format!("7,3000,[{}]", a.peers_record("A")));

        let cluster = Cluster::new(vec![a.endpoint()], settings());
        cluster.connect();

        assert_eq!(cluster.len(), 2);
        assert!(cluster.get(&a.key()).is_some());
        assert!(cluster.get(&b.key()).is_some());

        // Discovery reached each node's peers list exactly once.
        assert_eq!(a.hits("peers-clear-std"), 1);
        assert_eq!(b.hits("peers-clear-std"), 1);
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let a = MockServer::healthy("A00000000000001");
        let b = MockServer::healthy("B00000000000001");

        a.set("peers-clear-std", format!("1,3000,[{}]", b.peers_record("B")));
        b.set("peers-clear-std", format!("1,3000,[{}]", a.peers_record("A")));

        let cluster = Cluster::new(vec![a.endpoint()], settings());
        cluster.connect();

        let first_keys: BTreeSet<_> = cluster.node_ids().into_iter().collect();

        cluster.connect();
        let second_keys: BTreeSet<_> = cluster.node_ids().into_iter().collect();

        assert_eq!(first_keys, second_keys);
    }

    #[test]
    fn test_faked_unreachable_seed() {
        // Port 9 is the discard port; nothing listens there in tests.
        let cluster = Cluster::new(vec![Endpoint::new("127.0.0.1", 9)], settings());
        cluster.connect();

        assert_eq!(cluster.len(), 1);
        let key = NodeKey::new("127.0.0.1", 9);
        let node = cluster.get(&key).unwrap();

        assert!(!node.is_alive());
        assert_eq!(node.node_id(), crate::node::FAKE_NODE_ID);

        // Fan-outs include the placeholder and report it unreachable.
        let results = cluster.info_all("statistics", |node| node.statistics());
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[&key],
            Err(Error::Unreachable(_)) | Err(Error::Timeout)
        ));

        // Principal computation ignores placeholders.
        assert_eq!(cluster.expected_principal(), None);
    }

    #[test]
    fn test_fan_out_isolation() {
        let a = MockServer::healthy("A00000000000001");
        a.set("statistics", "cluster_size=1;paxos_principal=A00000000000001");

        let cluster = Cluster::new(
            vec![a.endpoint(), Endpoint::new("127.0.0.1", 9)],
            settings(),
        );
        cluster.connect();
        assert_eq!(cluster.len(), 2);

        let results = cluster.info_all("statistics", |node| node.statistics());

        // One entry per node: the live one succeeded, the placeholder
        // failed, nothing missing, nothing duplicated.
        assert_eq!(results.len(), 2);
        assert!(results[&a.key()].is_ok());
        assert!(results[&NodeKey::new("127.0.0.1", 9)].is_err());
    }

    #[test]
    fn test_refresh_picks_up_new_member() {
        let a = MockServer::healthy("A00000000000001");
        let b = MockServer::healthy("B00000000000001");

        a.set("peers-generation", "1");
        let cluster = Cluster::new(vec![a.endpoint()], settings());
        cluster.connect();
        assert_eq!(cluster.len(), 1);

        // Unchanged generation: refresh is a no-op.
        cluster.refresh();
        assert_eq!(cluster.len(), 1);

        // Membership changes: the generation moves and the peers list
        // gains a record.
        a.set("peers-generation", "2");
        a.set("peers-clear-std", format!("2,3000,[{}]", b.peers_record("B")));

        cluster.refresh();
        assert_eq!(cluster.len(), 2);
        assert!(cluster.get(&b.key()).is_some());
    }

    #[test]
    fn test_duplicate_node_id_keeps_first() {
        let a = MockServer::healthy("A00000000000001");
        let b = MockServer::healthy("A00000000000001"); // same id, second address

        a.set("peers-clear-std", format!("1,3000,[{}]", b.peers_record("A")));

        let cluster = Cluster::new(vec![a.endpoint()], settings());
        cluster.connect();

        assert_eq!(cluster.len(), 1);
        assert!(cluster.get(&a.key()).is_some());
    }

    #[test]
    fn test_principal_prefers_reported_statistic() {
        let a = MockServer::healthy("A00000000000001");
        let b = MockServer::healthy("B00000000000001");

        a.set("peers-clear-std", format!("1,3000,[{}]", b.peers_record("B")));
        // Both agree the principal is B, even though A sorts lower.
        a.set("statistics", "paxos_principal=B00000000000001");
        b.set("statistics", "paxos_principal=B00000000000001");

        let cluster = Cluster::new(vec![a.endpoint()], settings());
        cluster.connect();

        assert_eq!(
            cluster.expected_principal().as_deref(),
            Some("B00000000000001")
        );
    }

    #[test]
    fn test_info_command_all() {
        let a = MockServer::healthy("A00000000000001");

        let cluster = Cluster::new(vec![a.endpoint()], settings());
        cluster.connect();

        let results = cluster.info_command_all("build");
        assert_eq!(results.len(), 1);
        assert_eq!(results[&a.key()].as_deref().unwrap(), "3.16.0.6");
    }
}
