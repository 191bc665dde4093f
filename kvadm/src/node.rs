//! Client for a single cluster node.
//!
//! A [`Node`] owns the socket pool for one server and exposes the typed
//! info operations on it. Operations return errors as values; fan-outs
//! store them per-node instead of failing the aggregate.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::{Settings, DEFAULT_PORT};
use crate::error::Error;
use crate::info;
use crate::pool::Pool;

/// Node id reported by a placeholder for an unreachable seed.
pub const FAKE_NODE_ID: &str = "000000000000000";

/// Canonical `host:port` identity of a node, with IPv6 hosts in brackets.
/// Stable across socket rotation; every aggregate map is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(host: &str, port: u16) -> Self {
        if host.contains(':') {
            Self(format!("[{host}]:{port}"))
        } else {
            Self(format!("{host}:{port}"))
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A service endpoint: where a node can be reached, and under which name
/// its certificate validates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls_name: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls_name: None,
        }
    }

    pub fn key(&self) -> NodeKey {
        NodeKey::new(&self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key().fmt(f)
    }
}

/// Which peers list to ask a node for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeersView {
    /// Currently connected peers.
    Standard,
    /// Peers through their alternate (public) addresses.
    Alternate,
    /// Every peer the node has ever known.
    Alumni,
}

/// Result of a generation-gated peers query. Each peer is a list of
/// candidate endpoints for the same server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeersList {
    pub peers: Vec<Vec<Endpoint>>,
    pub changed: bool,
}

/// Scope of a latency table: one namespace, or the weighted total.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LatencyScope {
    Namespace(String),
    Total,
}

/// One page of a latency histogram.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyTable {
    pub columns: Vec<String>,
    pub rows: Vec<LatencyRow>,
}

/// One latency row: `values[0]` is ops/sec, the rest are the percentage
/// columns.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyRow {
    pub span: String,
    pub values: Vec<f64>,
}

/// Parsed latency report: histogram name, then scope.
pub type Latency = BTreeMap<String, BTreeMap<LatencyScope, LatencyTable>>;

/// One `hist-dump` reply for a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Histogram {
    pub histogram: String,
    pub width: u64,
    pub data: Vec<u64>,
}

#[derive(Debug, Default)]
struct State {
    node_id: String,
    alive: bool,
    features: Vec<String>,
    use_peers_list: bool,
    peers_generation: Option<u64>,
    peers: Vec<Vec<Endpoint>>,
    service_addresses: Vec<Endpoint>,
}

/// A handle on one cluster node.
pub struct Node {
    host: String,
    ip: String,
    fqdn: String,
    port: u16,
    xdr_port: u16,
    tls_name: Option<String>,
    settings: Settings,
    pool: Pool,
    state: Mutex<State>,
    memo: Mutex<BTreeMap<(String, u16), String>>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Node {}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.key().fmt(f)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key())
            .field("id", &self.node_id())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Node {
    /// Connect to a node and settle its canonical service address. Never
    /// fails: an unreachable node comes back as a placeholder with
    /// `alive = false` and [`FAKE_NODE_ID`], so unreachable seeds can be
    /// reported instead of aborting.
    pub fn connect(endpoint: &Endpoint, settings: &Settings) -> Arc<Node> {
        let tls_name = endpoint
            .tls_name
            .clone()
            .or_else(|| settings.tls.as_ref().and_then(|t| t.default_name.clone()));

        match Self::try_connect(endpoint, tls_name.clone(), settings) {
            Ok(node) => Arc::new(node),
            Err(e) => {
                log::debug!(target: "node", "Failed to connect to {endpoint}: {e}");
                Arc::new(Self::fake(endpoint, tls_name, settings))
            }
        }
    }

    fn try_connect(
        endpoint: &Endpoint,
        tls_name: Option<String>,
        settings: &Settings,
    ) -> Result<Node, Error> {
        let ip = resolve(&endpoint.host, endpoint.port)?;
        let mut node = Node::unconnected(&endpoint.host, ip, endpoint.port, tls_name, settings)?;
        let mut node_id = node.info_required("node")?;

        // The seed address may not be the canonical service address: ask
        // the node for its own, and re-key ourselves to the first one that
        // answers.
        let mut service_addresses = node.service().unwrap_or_default();
        let own = Endpoint {
            host: node.ip.clone(),
            port: node.port,
            tls_name: node.tls_name.clone(),
        };
        if !service_addresses.contains(&own) {
            service_addresses.push(own);
        }

        let mut settled = None;
        for address in &service_addresses {
            let Ok(ip) = resolve(&address.host, address.port) else {
                continue;
            };
            let probe = Node::unconnected(
                &address.host,
                ip,
                address.port,
                node.tls_name.clone(),
                settings,
            )?;
            match probe.info_required("node") {
                Ok(id) => {
                    settled = Some((probe, id));
                    break;
                }
                // Service lists can carry stale addresses, e.g. a downed
                // interface. Keep probing the rest.
                Err(_) => continue,
            }
        }
        if let Some((probe, id)) = settled {
            node = probe;
            node_id = id;
        }

        let features = info::to_list(&node.info("features").unwrap_or_default(), ';');
        let use_peers_list = features.iter().any(|f| f == "peers");

        {
            let mut state = node.state.lock().expect("node state lock is never poisoned");
            state.node_id = node_id;
            state.alive = true;
            state.features = features;
            state.use_peers_list = use_peers_list;
            state.service_addresses = service_addresses;
        }
        node.discovery_peers()?;

        Ok(node)
    }

    fn unconnected(
        host: &str,
        ip: IpAddr,
        port: u16,
        tls_name: Option<String>,
        settings: &Settings,
    ) -> Result<Node, Error> {
        let tls = match (&settings.tls, &tls_name) {
            (Some(tls), name) => Some((tls.client_config(), tls.server_name(name.as_deref())?)),
            (None, _) => None,
        };
        let ip = ip.to_string();
        let fqdn = if host.parse::<IpAddr>().is_ok() {
            ip.clone()
        } else {
            host.to_owned()
        };

        Ok(Node {
            host: host.to_owned(),
            pool: Pool::new(ip.clone(), tls, settings.timeouts),
            ip,
            fqdn,
            port,
            xdr_port: settings.xdr_port(),
            tls_name,
            settings: settings.clone(),
            state: Mutex::new(State::default()),
            memo: Mutex::new(BTreeMap::new()),
        })
    }

    /// Build a placeholder for an unreachable seed.
    fn fake(endpoint: &Endpoint, tls_name: Option<String>, settings: &Settings) -> Node {
        Node {
            host: endpoint.host.clone(),
            ip: endpoint.host.clone(),
            fqdn: endpoint.host.clone(),
            port: endpoint.port,
            xdr_port: settings.xdr_port(),
            tls_name: tls_name.clone(),
            settings: settings.clone(),
            pool: Pool::new(endpoint.host.clone(), None, settings.timeouts),
            state: Mutex::new(State {
                node_id: FAKE_NODE_ID.to_owned(),
                alive: false,
                service_addresses: vec![Endpoint {
                    host: endpoint.host.clone(),
                    port: endpoint.port,
                    tls_name,
                }],
                ..State::default()
            }),
            memo: Mutex::new(BTreeMap::new()),
        }
    }

    /// Canonical identity of this node in aggregate maps.
    pub fn key(&self) -> NodeKey {
        NodeKey::new(&self.ip, self.port)
    }

    /// The address this node was constructed with, before resolution.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().expect("node state lock is never poisoned").alive
    }

    /// The node id discovered at connect time.
    pub fn node_id(&self) -> String {
        self.state
            .lock()
            .expect("node state lock is never poisoned")
            .node_id
            .clone()
    }

    pub fn service_addresses(&self) -> Vec<Endpoint> {
        self.state
            .lock()
            .expect("node state lock is never poisoned")
            .service_addresses
            .clone()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.state
            .lock()
            .expect("node state lock is never poisoned")
            .features
            .iter()
            .any(|f| f == feature)
    }

    /// Close every pooled socket for this node.
    pub fn close(&self) {
        self.pool.close_all();
    }

    ////////////////////////////////////////////////////////////////////////
    // Raw info plumbing.

    /// Execute one info command on the service port.
    pub fn info(&self, command: &str) -> Result<String, Error> {
        self.info_on_port(command, self.port)
    }

    /// Execute one info command on the XDR port of an old server.
    pub fn xdr_info(&self, command: &str) -> Result<String, Error> {
        self.info_on_port(command, self.xdr_port)
    }

    fn info_on_port(&self, command: &str, port: u16) -> Result<String, Error> {
        let mut socket = match self.pool.acquire(port) {
            Ok(socket) => socket,
            Err(e) => {
                self.fault();
                return Err(e);
            }
        };
        let result = socket.execute(command);
        self.pool.release(socket);

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.fault();
                Err(e)
            }
        }
    }

    /// Like [`Node::info`], but an empty or `error` reply is a
    /// [`Error::CommandUnsupported`].
    fn info_required(&self, command: &str) -> Result<String, Error> {
        let value = self.info(command)?;

        required(command, value)
    }

    /// Memoized info for idempotent commands (`node`, `build`,
    /// `features`). The memo is dropped on any transport failure.
    fn info_cached(&self, command: &str) -> Result<String, Error> {
        let key = (command.to_owned(), self.port);

        if let Some(value) = self
            .memo
            .lock()
            .expect("node memo lock is never poisoned")
            .get(&key)
        {
            return Ok(value.clone());
        }
        let value = self.info_required(command)?;

        self.memo
            .lock()
            .expect("node memo lock is never poisoned")
            .insert(key, value.clone());
        Ok(value)
    }

    /// Transport-level failure: this node's memoized replies are stale and
    /// it can no longer be assumed alive.
    fn fault(&self) {
        self.memo
            .lock()
            .expect("node memo lock is never poisoned")
            .clear();
        self.state
            .lock()
            .expect("node state lock is never poisoned")
            .alive = false;
    }

    ////////////////////////////////////////////////////////////////////////
    // Typed operations.

    /// Re-read the node id off the wire.
    pub fn fetch_node_id(&self) -> Result<String, Error> {
        self.info_cached("node")
    }

    /// Server build version.
    pub fn build(&self) -> Result<String, Error> {
        self.info_cached("build")
    }

    /// XDR build version: on the service port when XDR runs in the server,
    /// on the XDR port otherwise.
    pub fn xdr_build(&self) -> Result<String, Error> {
        if self.has_feature("xdr") {
            return self.build();
        }
        required("build", self.xdr_info("build")?)
    }

    /// The configured cluster name, or the literal `null`.
    pub fn cluster_name(&self) -> Result<String, Error> {
        self.info("cluster-name")
    }

    /// Capability tokens advertised by the server.
    pub fn features(&self) -> Result<Vec<String>, Error> {
        Ok(info::to_list(&self.info_cached("features")?, ';'))
    }

    pub fn statistics(&self) -> Result<BTreeMap<String, String>, Error> {
        Ok(info::to_dict(&self.info_required("statistics")?))
    }

    pub fn namespaces(&self) -> Result<Vec<String>, Error> {
        Ok(info::to_list(&self.info_required("namespaces")?, ';'))
    }

    pub fn namespace_statistics(&self, ns: &str) -> Result<BTreeMap<String, String>, Error> {
        Ok(info::to_dict(&self.info_required(&format!("namespace/{ns}"))?))
    }

    pub fn all_namespace_statistics(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
        let mut stats = BTreeMap::new();

        for ns in self.namespaces()? {
            let ns_stats = self.namespace_statistics(&ns)?;
            stats.insert(ns, ns_stats);
        }
        Ok(stats)
    }

    /// Per-set statistics, keyed by `(namespace, set)`. The reply names
    /// its fields inconsistently across server generations, so both the
    /// old and new spellings are accepted.
    pub fn set_statistics(
        &self,
    ) -> Result<BTreeMap<(String, String), BTreeMap<String, String>>, Error> {
        let reply = self.info("sets")?;
        let mut sets = BTreeMap::new();

        for record in info::to_list(&reply, ';') {
            let fields = info::colon_to_dict(&record);
            let Some(ns) = value_of(&fields, &["ns_name", "namespace", "ns"]) else {
                continue;
            };
            let Some(set) = value_of(&fields, &["set_name", "set"]) else {
                continue;
            };
            let entry: &mut BTreeMap<String, String> =
                sets.entry((ns.to_owned(), set.to_owned())).or_default();

            entry.extend(fields);
        }
        Ok(sets)
    }

    /// Per-namespace bin statistics. The reply is one record per
    /// namespace: `ns:k=v,k=v,bin1,bin2,…` with bare bin names
    /// interleaved, which are dropped.
    pub fn bin_statistics(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
        let reply = self.info("bins")?;
        let mut bins = BTreeMap::new();

        for record in info::to_list(&reply, ';') {
            let Some((ns, rest)) = record.split_once(':') else {
                continue;
            };
            let pairs = info::to_list(rest, ',')
                .into_iter()
                .filter(|v| v.contains('='))
                .collect::<Vec<_>>()
                .join(";");

            bins.insert(ns.to_owned(), info::to_dict(&pairs));
        }
        Ok(bins)
    }

    /// Secondary index definitions, one record per index.
    pub fn sindex(&self) -> Result<Vec<BTreeMap<String, String>>, Error> {
        let reply = self.info("sindex")?;

        Ok(info::to_list(&reply, ';')
            .iter()
            .map(|record| info::colon_to_dict(record))
            .filter(|fields| !fields.is_empty())
            .collect())
    }

    pub fn sindex_statistics(
        &self,
        ns: &str,
        index: &str,
    ) -> Result<BTreeMap<String, String>, Error> {
        Ok(info::to_dict(
            &self.info_required(&format!("sindex/{ns}/{index}"))?,
        ))
    }

    pub fn xdr_statistics(&self) -> Result<BTreeMap<String, String>, Error> {
        if self.has_feature("xdr") {
            return Ok(info::to_dict(&self.info_required("statistics/xdr")?));
        }
        Ok(info::to_dict(&required(
            "statistics",
            self.xdr_info("statistics")?,
        )?))
    }

    /// Datacenters configured for XDR.
    pub fn dcs(&self) -> Result<Vec<String>, Error> {
        let reply = if self.has_feature("xdr") {
            self.info("dcs")?
        } else {
            self.xdr_info("dcs")?
        };
        Ok(info::to_list(&reply, ';'))
    }

    pub fn dc_statistics(&self, dc: &str) -> Result<BTreeMap<String, String>, Error> {
        let command = format!("dc/{dc}");
        let reply = if self.has_feature("xdr") {
            self.info_required(&command)?
        } else {
            required(&command, self.xdr_info(&command)?)?
        };
        Ok(info::to_dict(&reply))
    }

    pub fn all_dc_statistics(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
        let mut stats = BTreeMap::new();

        for dc in self.dcs().unwrap_or_default() {
            let stat = self.dc_statistics(&dc).unwrap_or_default();
            stats.insert(dc, stat);
        }
        Ok(stats)
    }

    /// Per-datacenter configuration, keyed by DC name.
    pub fn dc_config(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
        let reply = if self.has_feature("xdr") {
            // The bare spelling predates the `:` form; try both.
            self.info_required("get-dc-config")
                .or_else(|_| self.info_required("get-dc-config:"))
        } else {
            required("get-dc-config", self.xdr_info("get-dc-config")?)
        };
        let Ok(reply) = reply else {
            return Ok(BTreeMap::new());
        };
        Ok(info::to_dict_multi_level(
            &reply,
            &["dc-name", "DC_Name"],
            ':',
        ))
    }

    /// Registered UDF modules, keyed by filename.
    pub fn udf_list(&self) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
        let reply = self.info("udf-list")?;

        Ok(info::to_dict_multi_level(&reply, &["filename"], ','))
    }

    /// Service-level configuration (`get-config:` lumps service and
    /// network together).
    pub fn service_config(&self) -> Result<BTreeMap<String, String>, Error> {
        Ok(info::to_dict(&self.info_required("get-config:")?))
    }

    /// Configuration for one stanza (`network`, `xdr`, `security`, …).
    pub fn stanza_config(&self, stanza: &str) -> Result<BTreeMap<String, String>, Error> {
        Ok(info::to_dict(
            &self.info_required(&format!("get-config:context={stanza}"))?,
        ))
    }

    pub fn xdr_config(&self) -> Result<BTreeMap<String, String>, Error> {
        self.stanza_config("xdr")
    }

    pub fn network_config(&self) -> Result<BTreeMap<String, String>, Error> {
        self.stanza_config("network")
    }

    /// Whether XDR shipping is enabled at all.
    pub fn is_xdr_enabled(&self) -> bool {
        self.xdr_config()
            .map(|config| config.get("enable-xdr").map(String::as_str) == Some("true"))
            .unwrap_or(false)
    }

    /// Configuration for one namespace. `nsid` is the namespace's index
    /// in the server's `namespaces` reply.
    pub fn namespace_config(
        &self,
        ns: &str,
        nsid: Option<usize>,
    ) -> Result<BTreeMap<String, String>, Error> {
        let mut config = info::to_dict(
            &self.info_required(&format!("get-config:context=namespace;id={ns}"))?,
        );
        let nsid = match nsid {
            Some(id) => Some(id),
            None => self
                .namespaces()?
                .iter()
                .position(|candidate| candidate == ns),
        };
        if let Some(nsid) = nsid {
            config.insert("nsid".to_owned(), nsid.to_string());
        }
        Ok(config)
    }

    pub fn all_namespace_config(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, Error> {
        let mut configs = BTreeMap::new();

        for (nsid, ns) in self.namespaces()?.into_iter().enumerate() {
            let config = self.namespace_config(&ns, Some(nsid))?;
            configs.insert(ns, config);
        }
        Ok(configs)
    }

    /// Raw partition table, parsed by the partition-map analyzer.
    pub fn partition_info(&self) -> Result<String, Error> {
        self.info_required("partition-info")
    }

    ////////////////////////////////////////////////////////////////////////
    // Peers and services.

    /// Current peers generation as reported by the server.
    pub fn peers_generation(&self) -> Result<u64, Error> {
        let reply = self.info_required("peers-generation")?;

        reply
            .trim()
            .parse()
            .map_err(|_| Error::InvalidResponse(format!("bad peers generation `{reply}`")))
    }

    /// Check whether membership changed since the last peers query,
    /// advancing the recorded generation. Servers without the peers
    /// feature can't tell, so they always report a change.
    pub fn has_peers_changed(&self) -> bool {
        if !self
            .state
            .lock()
            .expect("node state lock is never poisoned")
            .use_peers_list
        {
            return true;
        }
        let Ok(generation) = self.peers_generation() else {
            return true;
        };
        let mut state = self.state.lock().expect("node state lock is never poisoned");

        if state.peers_generation != Some(generation) {
            state.peers_generation = Some(generation);
            true
        } else {
            false
        }
    }

    /// Generation-gated peers query: an unchanged generation serves the
    /// cached list and flags `changed = false`.
    pub fn peers(&self, view: PeersView) -> Result<PeersList, Error> {
        if !self.has_peers_changed() {
            let peers = self
                .state
                .lock()
                .expect("node state lock is never poisoned")
                .peers
                .clone();

            return Ok(PeersList {
                peers,
                changed: false,
            });
        }
        let peers = self.fetch_peers(view)?;

        self.state
            .lock()
            .expect("node state lock is never poisoned")
            .peers = peers.clone();
        Ok(PeersList {
            peers,
            changed: true,
        })
    }

    fn fetch_peers(&self, view: PeersView) -> Result<Vec<Vec<Endpoint>>, Error> {
        let secure = self.settings.tls.is_some();
        let command = match (view, secure) {
            (PeersView::Standard, false) => "peers-clear-std",
            (PeersView::Standard, true) => "peers-tls-std",
            (PeersView::Alternate, false) => "peers-clear-alt",
            (PeersView::Alternate, true) => "peers-tls-alt",
            (PeersView::Alumni, false) => "alumni-clear-std",
            (PeersView::Alumni, true) => "alumni-tls-std",
        };
        let reply = self.info_required(command)?;

        Ok(parse_peers_list(&reply))
    }

    /// The node's own canonical service addresses.
    pub fn service(&self) -> Result<Vec<Endpoint>, Error> {
        let reply = self.info_required("service")?;

        Ok(self.parse_services(&reply))
    }

    /// Legacy service discovery for servers without the peers feature.
    pub fn services_legacy(&self, view: PeersView) -> Result<Vec<Vec<Endpoint>>, Error> {
        let reply = match view {
            PeersView::Standard => self.info_required("services")?,
            PeersView::Alternate => self.info_required("services-alternate")?,
            PeersView::Alumni => {
                // Old servers don't know the alumni list at all; the only
                // signal is the command failing.
                match self.info_required("services-alumni") {
                    Ok(reply) => reply,
                    Err(Error::CommandUnsupported(_)) | Err(Error::InvalidResponse(_)) => {
                        log::debug!(target: "node", "{self}: no alumni support, falling back to `services`");
                        self.info_required("services")?
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        Ok(self
            .parse_services(&reply)
            .into_iter()
            .map(|endpoint| vec![endpoint])
            .collect())
    }

    /// The peers to walk during discovery, honoring the cluster's policy
    /// flags and falling back to legacy services on old servers. The
    /// result is gated on the peers generation: while it stands still,
    /// the cached list is served without touching the wire.
    pub fn discovery_peers(&self) -> Result<Vec<Vec<Endpoint>>, Error> {
        let use_peers_list = self
            .state
            .lock()
            .expect("node state lock is never poisoned")
            .use_peers_list;
        let settings = &self.settings;

        if use_peers_list && !self.has_peers_changed() {
            return Ok(self
                .state
                .lock()
                .expect("node state lock is never poisoned")
                .peers
                .clone());
        }
        let peers = if use_peers_list {
            let mut peers = if settings.use_services_alumni {
                let mut all = self.fetch_peers(PeersView::Standard)?;
                all.extend(self.fetch_peers(PeersView::Alumni)?);
                all
            } else if settings.use_services_alt {
                self.fetch_peers(PeersView::Alternate)?
            } else {
                self.fetch_peers(PeersView::Standard)?
            };
            peers.retain(|endpoints| !endpoints.is_empty());
            peers
        } else if settings.use_services_alumni {
            self.services_legacy(PeersView::Alumni)?
        } else if settings.use_services_alt {
            self.services_legacy(PeersView::Alternate)?
        } else {
            self.services_legacy(PeersView::Standard)?
        };

        self.state
            .lock()
            .expect("node state lock is never poisoned")
            .peers = peers.clone();
        Ok(peers)
    }

    /// Parse a `host:port;…` services reply. Every endpoint inherits this
    /// node's TLS name.
    fn parse_services(&self, reply: &str) -> Vec<Endpoint> {
        info::to_list(reply, ';')
            .iter()
            .filter_map(|service| {
                let fields = info::split_nested(service, ':');
                let host = fields.first()?.clone();
                let port = match fields.get(1) {
                    Some(port) => port.parse().ok()?,
                    None => self.port,
                };
                Some(Endpoint {
                    host,
                    port,
                    tls_name: self.tls_name.clone(),
                })
            })
            .collect()
    }

    ////////////////////////////////////////////////////////////////////////
    // Latency and histograms.

    /// Fetch and parse the paged latency report. The total table of each
    /// histogram is the ops/sec-weighted average of its namespace rows.
    pub fn latency(
        &self,
        back: Option<u64>,
        duration: Option<u64>,
        slice: Option<u64>,
    ) -> Result<Latency, Error> {
        let mut command = String::from("latency:");

        if let Some(back) = back {
            command.push_str(&format!("back={back};"));
        }
        if let Some(duration) = duration {
            command.push_str(&format!("duration={duration};"));
        }
        if let Some(slice) = slice {
            command.push_str(&format!("slice={slice};"));
        }
        let reply = self.info(&command)?;

        Ok(parse_latency(&reply))
    }

    /// Dump one histogram for every namespace. Namespaces that fail to
    /// answer are skipped.
    pub fn histogram(&self, name: &str) -> Result<BTreeMap<String, Histogram>, Error> {
        let mut data = BTreeMap::new();

        for ns in self.namespaces()? {
            let Ok(reply) = self.info_required(&format!("hist-dump:ns={ns};hist={name}")) else {
                continue;
            };
            if let Some((width, buckets)) = parse_hist_dump(&reply) {
                data.insert(
                    ns,
                    Histogram {
                        histogram: name.to_owned(),
                        width,
                        data: buckets,
                    },
                );
            }
        }
        Ok(data)
    }
}

/// Map an empty or `error` reply to [`Error::CommandUnsupported`].
fn required(command: &str, value: String) -> Result<String, Error> {
    let trimmed = value.trim();

    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("error")
        || trimmed.to_ascii_lowercase().starts_with("error:")
    {
        return Err(Error::CommandUnsupported(command.to_owned()));
    }
    Ok(value)
}

fn value_of<'a>(fields: &'a BTreeMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| fields.get(*key))
        .map(String::as_str)
}

fn resolve(host: &str, port: u16) -> Result<IpAddr, Error> {
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Unreachable(format!("{host}: {e}")))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| Error::Unreachable(format!("{host}: no address resolved")))
}

/// Parse a `peers-*` reply:
/// `<gen>,<default-port>,[(<name>,<tls>,[<endpoints>]),…]`.
pub fn parse_peers_list(reply: &str) -> Vec<Vec<Endpoint>> {
    let parts = info::split_nested(reply, ',');

    if parts.len() < 3 {
        return Vec::new();
    }
    let default_port: u16 = parts[1].parse().unwrap_or(DEFAULT_PORT);
    let mut peers = Vec::new();

    for record in info::split_nested(&parts[2], ',') {
        let fields = info::split_nested(&record, ',');

        if fields.len() < 3 {
            continue;
        }
        let mut tls_name = (!fields[1].is_empty()).then(|| fields[1].clone());
        let raw_endpoints = info::split_nested(&fields[2], ',');

        if raw_endpoints.is_empty() {
            continue;
        }
        // A record without an explicit TLS name validates against the
        // first DNS name among its endpoints.
        if tls_name.is_none() {
            tls_name = raw_endpoints
                .iter()
                .map(|e| endpoint_host(e))
                .find(|host| host.parse::<IpAddr>().is_err());
        }
        let endpoints: Vec<Endpoint> = raw_endpoints
            .iter()
            .filter_map(|raw| parse_endpoint(raw, default_port, tls_name.clone()))
            .collect();

        if !endpoints.is_empty() {
            peers.push(endpoints);
        }
    }
    peers
}

fn endpoint_host(raw: &str) -> String {
    let fields = info::split_nested(raw, ':');

    fields.first().cloned().unwrap_or_default()
}

fn parse_endpoint(raw: &str, default_port: u16, tls_name: Option<String>) -> Option<Endpoint> {
    let fields = info::split_nested(raw, ':');
    let host = fields.first()?.trim();

    if host.is_empty() {
        return None;
    }
    let port = fields
        .get(1)
        .and_then(|port| port.parse().ok())
        .unwrap_or(default_port);

    Some(Endpoint {
        host: host.to_owned(),
        port,
        tls_name,
    })
}

/// Parse one `hist-dump` reply: `ns:hist,width,b0,b1,…;`.
fn parse_hist_dump(reply: &str) -> Option<(u64, Vec<u64>)> {
    let reply = reply.trim_end_matches(';');
    let mut fields = reply.split(',');

    fields.next()?; // ns, histogram name and bucket count
    let width = fields.next()?.trim().parse().ok()?;
    let buckets = fields
        .map(|b| b.trim().parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    Some((width, buckets))
}

/// Parse the latency report. Records alternate between column headers
/// (`{ns}-read:<start>,ops/sec,>1ms,…` or `read:<start>,…`) and data rows
/// (`<end>,<ops>,<p1>,…`); each data row closes the span opened by the
/// previous one.
fn parse_latency(reply: &str) -> Latency {
    let mut data = Latency::new();
    let mut hist: Option<String> = None;
    let mut ns: Option<String> = None;
    let mut start: Option<String> = None;
    let mut columns: Vec<String> = Vec::new();

    for record in reply.split(';') {
        if record.is_empty() {
            continue;
        }
        let row: Vec<&str> = record.split(',').collect();

        if row.len() < 2 {
            continue;
        }
        let Some((s1, s2)) = row[0].split_once(':') else {
            continue;
        };

        if !s1.chars().all(|c| c.is_ascii_digit()) {
            // Header row.
            match s1.strip_prefix('{').and_then(|s| s.split_once("}-")) {
                Some((namespace, name)) => {
                    ns = Some(namespace.to_owned());
                    hist = Some(name.to_owned());
                }
                None => {
                    ns = None;
                    hist = Some(s1.to_owned());
                }
            }
            columns = std::iter::once("Time Span".to_owned())
                .chain(row[1..].iter().map(|c| (*c).to_owned()))
                .collect();
            start = Some(strip_gmt(s2).to_owned());
            continue;
        }
        let (Some(hist_name), Some(start_time)) = (&hist, &start) else {
            continue;
        };
        let end = strip_gmt(row[0]);
        let Ok(values) = row[1..]
            .iter()
            .map(|v| v.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
        else {
            continue;
        };
        let latency_row = LatencyRow {
            span: format!("{start_time}->{end}"),
            values,
        };
        let tables = data.entry(hist_name.clone()).or_default();

        if let Some(ns) = &ns {
            let table = tables
                .entry(LatencyScope::Namespace(ns.clone()))
                .or_insert_with(|| LatencyTable {
                    columns: columns.clone(),
                    rows: Vec::new(),
                });
            table.rows.push(latency_row.clone());
        }
        let total = tables
            .entry(LatencyScope::Total)
            .or_insert_with(|| LatencyTable {
                columns: columns.clone(),
                rows: Vec::new(),
            });
        merge_total_row(&mut total.rows, &latency_row);
        start = Some(end.to_owned());
    }
    data
}

/// Fold a namespace row into the running total for its time span:
/// percentages are re-weighted by ops/sec and rounded to 2 decimals.
/// Zero-ops rows contribute nothing, so merge order across namespaces
/// doesn't change the result.
pub fn merge_total_row(rows: &mut Vec<LatencyRow>, row: &LatencyRow) {
    let Some(total) = rows.iter_mut().find(|total| total.span == row.span) else {
        rows.push(row.clone());
        return;
    };
    let new_sum = row.values[0];

    if new_sum <= 0.0 {
        return;
    }
    let old_sum = total.values[0];

    for i in 1..total.values.len().min(row.values.len()) {
        let old_weight = old_sum * total.values[i] / 100.0;
        let new_weight = new_sum * row.values[i] / 100.0;

        total.values[i] = round2((old_weight + new_weight) * 100.0 / (old_sum + new_sum));
    }
    total.values[0] = round2(old_sum + new_sum);
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn strip_gmt(timestamp: &str) -> &str {
    timestamp.strip_suffix("-GMT").unwrap_or(timestamp)
}
