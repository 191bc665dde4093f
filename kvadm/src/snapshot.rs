//! Cluster snapshot assembly.
//!
//! Collects statistics, configuration and metadata across the cluster and
//! restructures them into the canonical offline layout: node-outward maps,
//! per-namespace nesting, errors flattened to empty objects, everything
//! wrapped under the cluster name. The output is created, serialized and
//! discarded; it is never mutated after assembly.

use std::collections::BTreeMap;
use std::io;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::cluster::{Cluster, NodeMap};
use crate::error::Error;
use crate::node::NodeKey;

/// Cluster name used when no node reports one.
pub const UNKNOWN_CLUSTER: &str = "null";

/// An assembled snapshot: `cluster_name → node_key → {as_stat, sys_stat}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    root: Value,
}

impl Snapshot {
    /// Collect a snapshot across the cluster.
    pub fn collect(cluster: &Cluster) -> Self {
        Self::collect_with(cluster, &BTreeMap::new())
    }

    /// Collect a snapshot, attaching externally gathered system stats
    /// per node where present.
    pub fn collect_with(cluster: &Cluster, sys_stats: &BTreeMap<NodeKey, Value>) -> Self {
        let sections = Sections::gather(cluster);
        let mut nodes = Map::new();

        for node in cluster.nodes() {
            let key = node.key();
            let mut entry = Map::new();

            entry.insert("as_stat".to_owned(), sections.as_stat(&key));
            if let Some(sys) = sys_stats.get(&key) {
                entry.insert("sys_stat".to_owned(), sys.clone());
            }
            nodes.insert(key.to_string(), Value::Object(entry));
        }
        let mut root = Map::new();
        root.insert(cluster_name(cluster), Value::Object(nodes));

        Self {
            root: Value::Object(root),
        }
    }

    pub fn value(&self) -> &Value {
        &self.root
    }

    /// Serialize as 4-space-indented JSON with lexicographic keys.
    pub fn to_json(&self) -> String {
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut buf = Vec::new();
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);

        self.root
            .serialize(&mut serializer)
            .expect("in-memory serialization doesn't fail");
        String::from_utf8(buf).expect("serialized JSON is UTF-8")
    }

    /// Write the snapshot to a stream, with a trailing newline.
    pub fn write_to(&self, mut writer: impl io::Write) -> io::Result<()> {
        writer.write_all(self.to_json().as_bytes())?;
        writer.write_all(b"\n")
    }
}

/// The discovered cluster name: the first node (in key order) reporting
/// something other than an error or the `null` sentinel.
fn cluster_name(cluster: &Cluster) -> String {
    let names: BTreeMap<_, _> = cluster
        .info_command_all("cluster-name")
        .into_iter()
        .collect();

    names
        .into_values()
        .flatten()
        .find(|name| !name.is_empty() && name != UNKNOWN_CLUSTER)
        .unwrap_or_else(|| UNKNOWN_CLUSTER.to_owned())
}

type FlatMap = BTreeMap<String, String>;
type TwoLevel = BTreeMap<String, FlatMap>;

/// Everything the snapshot needs, gathered per node up front so assembly
/// observes one membership snapshot.
struct Sections {
    statistics: NodeMap<FlatMap>,
    namespace_stats: NodeMap<TwoLevel>,
    set_stats: NodeMap<BTreeMap<(String, String), FlatMap>>,
    bin_stats: NodeMap<TwoLevel>,
    sindex_stats: NodeMap<BTreeMap<(String, String), FlatMap>>,
    dc_stats: NodeMap<TwoLevel>,
    service_config: NodeMap<FlatMap>,
    namespace_config: NodeMap<TwoLevel>,
    xdr_config: NodeMap<FlatMap>,
    network_config: NodeMap<FlatMap>,
    dc_config: NodeMap<TwoLevel>,
    builds: NodeMap<String>,
    xdr_builds: NodeMap<String>,
    udf: NodeMap<TwoLevel>,
}

impl Sections {
    fn gather(cluster: &Cluster) -> Self {
        Self {
            statistics: cluster.info_all("statistics", |n| n.statistics()),
            namespace_stats: cluster
                .info_all("namespace statistics", |n| n.all_namespace_statistics()),
            set_stats: cluster.info_all("set statistics", |n| n.set_statistics()),
            bin_stats: cluster.info_all("bin statistics", |n| n.bin_statistics()),
            sindex_stats: cluster.info_all("sindex statistics", sindex_statistics),
            dc_stats: cluster.info_all("dc statistics", |n| n.all_dc_statistics()),
            service_config: cluster.info_all("service config", |n| n.service_config()),
            namespace_config: cluster.info_all("namespace config", |n| n.all_namespace_config()),
            xdr_config: cluster.info_all("xdr config", |n| n.xdr_config()),
            network_config: cluster.info_all("network config", |n| n.network_config()),
            dc_config: cluster.info_all("dc config", |n| n.dc_config()),
            builds: cluster.info_all("build", |n| n.build()),
            xdr_builds: cluster.info_all("xdr build", |n| n.xdr_build()),
            udf: cluster.info_all("udf list", |n| n.udf_list()),
        }
    }

    /// Assemble the `as_stat` object for one node.
    fn as_stat(&self, key: &NodeKey) -> Value {
        let mut statistics = Map::new();
        statistics.insert("service".to_owned(), flat_value(&self.statistics, key));
        statistics.insert("namespace".to_owned(), self.namespaces_stat(key));
        statistics.insert("dc".to_owned(), two_level_value(&self.dc_stats, key));

        let mut config = Map::new();
        config.insert("service".to_owned(), flat_value(&self.service_config, key));
        config.insert("namespace".to_owned(), self.namespaces_config(key));
        config.insert("xdr".to_owned(), flat_value(&self.xdr_config, key));
        config.insert("network".to_owned(), flat_value(&self.network_config, key));
        config.insert("dc".to_owned(), two_level_value(&self.dc_config, key));

        let mut meta = Map::new();
        meta.insert("asd_build".to_owned(), string_or_empty(&self.builds, key));
        meta.insert("xdr_build".to_owned(), string_or_empty(&self.xdr_builds, key));
        meta.insert(
            "udf".to_owned(),
            match self.udf.get(key) {
                Some(Ok(udf)) => two_level(udf),
                _ => Value::String(String::new()),
            },
        );

        let mut as_stat = Map::new();
        as_stat.insert("statistics".to_owned(), Value::Object(statistics));
        as_stat.insert("config".to_owned(), Value::Object(config));
        as_stat.insert("meta_data".to_owned(), Value::Object(meta));
        Value::Object(as_stat)
    }

    /// Per-namespace statistics for one node: the namespace's own stats
    /// under `service`, with its sets, bins and secondary indexes nested
    /// inside.
    fn namespaces_stat(&self, key: &NodeKey) -> Value {
        let Some(Ok(namespaces)) = self.namespace_stats.get(key) else {
            return Value::Object(Map::new());
        };
        let mut out = Map::new();

        for (ns, stats) in namespaces {
            let mut entry = Map::new();
            entry.insert("service".to_owned(), flat(stats));

            let mut sets = Map::new();
            if let Some(Ok(all_sets)) = self.set_stats.get(key) {
                for ((set_ns, set), values) in all_sets {
                    if set_ns == ns {
                        sets.insert(set.clone(), flat(values));
                    }
                }
            }
            entry.insert("set".to_owned(), Value::Object(sets));

            let bin = match self.bin_stats.get(key) {
                Some(Ok(bins)) => bins.get(ns).map(flat).unwrap_or_else(empty),
                _ => empty(),
            };
            entry.insert("bin".to_owned(), bin);

            let mut sindex = Map::new();
            if let Some(Ok(indexes)) = self.sindex_stats.get(key) {
                for ((index_ns, index), values) in indexes {
                    if index_ns == ns {
                        sindex.insert(index.clone(), flat(values));
                    }
                }
            }
            entry.insert("sindex".to_owned(), Value::Object(sindex));

            out.insert(ns.clone(), Value::Object(entry));
        }
        Value::Object(out)
    }

    /// Per-namespace configuration for one node, promoted under a
    /// `service` bucket like the statistics.
    fn namespaces_config(&self, key: &NodeKey) -> Value {
        let Some(Ok(namespaces)) = self.namespace_config.get(key) else {
            return Value::Object(Map::new());
        };
        let mut out = Map::new();

        for (ns, config) in namespaces {
            let mut entry = Map::new();
            entry.insert("service".to_owned(), flat(config));
            out.insert(ns.clone(), Value::Object(entry));
        }
        Value::Object(out)
    }
}

/// Per-index statistics for one node, keyed by `(namespace, index)`.
fn sindex_statistics(
    node: &crate::node::Node,
) -> Result<BTreeMap<(String, String), FlatMap>, Error> {
    let mut out = BTreeMap::new();

    for definition in node.sindex()? {
        let ns = field(&definition, &["ns", "namespace", "ns_name"]);
        let index = field(&definition, &["indexname", "index_name"]);
        let (Some(ns), Some(index)) = (ns, index) else {
            continue;
        };
        let stats = node.sindex_statistics(&ns, &index).unwrap_or_default();

        out.insert((ns, index), stats);
    }
    Ok(out)
}

fn field(map: &FlatMap, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| map.get(*key)).cloned()
}

fn empty() -> Value {
    Value::Object(Map::new())
}

fn flat(map: &FlatMap) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn two_level(map: &TwoLevel) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), flat(v))).collect())
}

/// A per-node section value: errors become empty objects so the final
/// JSON is uniformly shaped.
fn flat_value(section: &NodeMap<FlatMap>, key: &NodeKey) -> Value {
    match section.get(key) {
        Some(Ok(map)) => flat(map),
        _ => empty(),
    }
}

fn two_level_value(section: &NodeMap<TwoLevel>, key: &NodeKey) -> Value {
    match section.get(key) {
        Some(Ok(map)) => two_level(map),
        _ => empty(),
    }
}

fn string_or_empty(section: &NodeMap<String>, key: &NodeKey) -> Value {
    match section.get(key) {
        Some(Ok(value)) => Value::String(value.clone()),
        _ => Value::String(String::new()),
    }
}

#[cfg(test)]
mod test {
    use std::time;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cluster::Cluster;
    use crate::config::{Settings, Timeouts};
    use crate::test::MockServer;

    fn snapshot_fixture() -> (MockServer, Cluster) {
        let server = MockServer::healthy("BB9000000000001");

        server.set("statistics", "cluster_size=1;uptime=100");
        server.set("namespaces", "test");
        server.set("namespace/test", "objects=10;repl-factor=1");
        server.set("sets", "ns=test:set=demo:objects=5;");
        server.set("bins", "test:bin_names=2,bin_names_quota=32768,name,age;");
        server.set("sindex", "ns=test:set=demo:indexname=idx1:type=numeric;");
        server.set("sindex/test/idx1", "keys=5;entries=5");
        server.set("get-config:", "proto-fd-max=15000");
        server.set("get-config:context=namespace;id=test", "repl-factor=1");
        server.set("get-config:context=xdr", "enable-xdr=false");
        server.set("get-config:context=network", "fabric-port=3001");
        server.set("udf-list", "filename=a.lua,hash=abc,type=LUA;");
        server.set("cluster-name", "prod");

        let settings = Settings {
            timeouts: Timeouts {
                connect: time::Duration::from_millis(500),
                read: time::Duration::from_millis(2000),
            },
            ..Settings::default()
        };
        let cluster = Cluster::new(vec![server.endpoint()], settings);
        cluster.connect();

        (server, cluster)
    }

    #[test]
    fn test_snapshot_shape() {
        let (server, cluster) = snapshot_fixture();
        let snapshot = Snapshot::collect(&cluster);
        let root = snapshot.value();

        let node = &root["prod"][server.key().as_str()];
        let stats = &node["as_stat"]["statistics"];

        assert_eq!(stats["service"]["cluster_size"], "1");
        assert_eq!(stats["namespace"]["test"]["service"]["objects"], "10");
        assert_eq!(stats["namespace"]["test"]["set"]["demo"]["objects"], "5");
        assert_eq!(stats["namespace"]["test"]["bin"]["bin_names"], "2");
        assert_eq!(stats["namespace"]["test"]["sindex"]["idx1"]["keys"], "5");

        let config = &node["as_stat"]["config"];
        assert_eq!(config["service"]["proto-fd-max"], "15000");
        assert_eq!(config["namespace"]["test"]["service"]["repl-factor"], "1");
        assert_eq!(config["xdr"]["enable-xdr"], "false");

        // This deployment has no XDR port listening: the DC sections
        // flatten to empty objects instead of errors.
        assert_eq!(stats["dc"], empty());
        assert_eq!(config["dc"], empty());

        let meta = &node["as_stat"]["meta_data"];
        assert_eq!(meta["asd_build"], "3.16.0.6");
        assert_eq!(meta["xdr_build"], "");
        assert_eq!(meta["udf"]["a.lua"]["hash"], "abc");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (_server, cluster) = snapshot_fixture();
        let snapshot = Snapshot::collect(&cluster);

        let text = snapshot.to_json();
        let reparsed: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(&reparsed, snapshot.value());
        assert!(text.contains("    \"prod\""));
    }

    #[test]
    fn test_snapshot_to_file() {
        let (_server, cluster) = snapshot_fixture();
        let snapshot = Snapshot::collect(&cluster);

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("snapshot.json");
        let file = std::fs::File::create(&path).unwrap();
        snapshot.write_to(file).unwrap();

        let reparsed: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(&reparsed, snapshot.value());
    }

    #[test]
    fn test_unreachable_node_is_empty_not_error() {
        let settings = Settings {
            timeouts: Timeouts {
                connect: time::Duration::from_millis(200),
                read: time::Duration::from_millis(500),
            },
            ..Settings::default()
        };
        let cluster = Cluster::new(
            vec![crate::node::Endpoint::new("127.0.0.1", 9)],
            settings,
        );
        cluster.connect();

        let snapshot = Snapshot::collect(&cluster);
        let root = snapshot.value();
        let node = &root[UNKNOWN_CLUSTER]["127.0.0.1:9"];

        assert_eq!(node["as_stat"]["statistics"]["service"], empty());
        assert_eq!(node["as_stat"]["config"]["service"], empty());
        assert_eq!(node["as_stat"]["meta_data"]["asd_build"], "");
    }

    #[test]
    fn test_system_stats_sidecar() {
        let (server, cluster) = snapshot_fixture();
        let mut sys = BTreeMap::new();
        sys.insert(
            server.key(),
            serde_json::json!({"uname": {"kernel": "5.10"}}),
        );

        let snapshot = Snapshot::collect_with(&cluster, &sys);
        let node = &snapshot.value()["prod"][server.key().as_str()];

        assert_eq!(node["sys_stat"]["uname"]["kernel"], "5.10");
    }
}
