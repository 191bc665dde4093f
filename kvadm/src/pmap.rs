//! Partition-map analysis.
//!
//! Reconstructs per-namespace replication correctness from raw
//! `partition-info` replies: which partitions are missing replicas, and
//! which carry an object count far enough from the cluster average to be
//! suspect.

use std::collections::{BTreeMap, BTreeSet};

use crate::cluster::{Cluster, NodeMap};
use crate::node::NodeKey;

/// Number of partitions per namespace.
pub const PARTITIONS: usize = 4096;

/// Allowed deviation from the average object count, in percent.
const DISCREPANCY_PCT: i64 = 1;
/// Floor on the allowed deviation, so small namespaces don't flag noise.
const DISCREPANCY_FLOOR: i64 = 1024;

/// Per `(node, namespace)` analysis result.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PartitionReport {
    /// Partitions this node holds in sync as master.
    pub pri_index: u64,
    /// Partitions this node holds in sync as a secondary replica.
    pub sec_index: u64,
    /// Master partitions whose object count deviates from the average.
    pub master_disc_part: Vec<usize>,
    /// Replica partitions whose object count deviates from the average.
    pub replica_disc_part: Vec<usize>,
    /// Cluster-wide `pid:S:ridx` list of replicas no node holds in sync.
    pub missing_part: String,
}

/// Analysis results keyed by node, then namespace.
pub type PmapData = BTreeMap<NodeKey, BTreeMap<String, PartitionReport>>;

#[derive(Debug, Default, Clone, Copy)]
struct NamespaceInfo {
    avg_master: i64,
    avg_replica: i64,
    repl_factor: usize,
    diff_master: i64,
    diff_replica: i64,
}

/// Column indices into a `partition-info` record.
#[derive(Debug, Clone, Copy)]
struct Columns {
    ns: usize,
    pid: usize,
    state: usize,
    replica: usize,
    records: usize,
}

impl Columns {
    /// Fixed layout of servers that don't send a header record. The
    /// records column moved from index 9 to 8 in 3.6.1.
    fn positional(build: Option<&str>) -> Self {
        let records = if build.is_some_and(|b| version_at_least(b, &[3, 6, 1])) {
            8
        } else {
            9
        };
        Self {
            ns: 0,
            pid: 1,
            state: 2,
            replica: 3,
            records,
        }
    }

    /// Take the layout from a header record, if it is one.
    fn from_header(fields: &[&str]) -> Option<Self> {
        let index = |name: &str| fields.iter().position(|f| *f == name);

        Some(Self {
            ns: index("namespace")?,
            pid: index("partition")?,
            state: index("state")?,
            replica: index("replica")?,
            records: index("records")?,
        })
    }
}

/// Gather the inputs for [`analyze`] from a cluster and run it.
pub fn report(cluster: &Cluster) -> PmapData {
    let pmap_info = cluster.info_all("partition-info", |node| node.partition_info());
    let builds = cluster.info_all("build", |node| node.build());
    let mut namespace_stats = BTreeMap::new();

    for ns in cluster.namespaces() {
        let stats = {
            let ns = ns.clone();

            cluster.info_all(&format!("namespace {ns}"), move |node| {
                node.namespace_statistics(&ns)
            })
        };
        namespace_stats.insert(ns, stats);
    }
    analyze(&pmap_info, &namespace_stats, &builds)
}

/// Analyze raw `partition-info` replies against per-namespace aggregate
/// statistics and per-node build versions.
pub fn analyze(
    pmap_info: &NodeMap<String>,
    namespace_stats: &BTreeMap<String, NodeMap<BTreeMap<String, String>>>,
    builds: &NodeMap<String>,
) -> PmapData {
    let ns_info = namespace_info(namespace_stats);
    let mut missing: BTreeMap<String, Vec<BTreeSet<usize>>> = BTreeMap::new();
    let mut data = PmapData::new();

    for (node, partitions) in pmap_info {
        let Ok(partitions) = partitions else {
            continue;
        };
        let build = builds
            .get(node)
            .and_then(|result| result.as_deref().ok());
        let mut columns = Columns::positional(build);
        let mut node_pmap: BTreeMap<String, PartitionReport> = BTreeMap::new();
        let mut first = true;

        for record in partitions.split(';') {
            if record.is_empty() {
                continue;
            }
            let fields: Vec<&str> = record.split(':').collect();

            if first {
                first = false;

                // Newer servers lead with a header naming the columns.
                if let Some(from_header) = Columns::from_header(&fields) {
                    columns = from_header;
                    continue;
                }
            }
            let Some(row) = parse_row(&fields, &columns) else {
                continue;
            };
            let info = ns_info.get(row.ns).copied().unwrap_or_default();

            if row.pid >= PARTITIONS {
                log::warn!(
                    target: "pmap",
                    "For {} found partition id {} beyond the legal range 0..{PARTITIONS}",
                    row.ns,
                    row.pid
                );
                continue;
            }
            let report = node_pmap.entry(row.ns.to_owned()).or_default();
            let coverage = missing
                .entry(row.ns.to_owned())
                .or_insert_with(|| vec![(0..info.repl_factor).collect(); PARTITIONS]);

            if row.state != "S" {
                continue;
            }
            if row.replica == 0 {
                report.pri_index += 1;

                if (info.avg_master != 0 || row.objects != 0)
                    && (info.avg_master - row.objects).abs() > info.diff_master
                {
                    report.master_disc_part.push(row.pid);
                }
            } else if row.replica < info.repl_factor {
                report.sec_index += 1;

                if (info.avg_replica != 0 || row.objects != 0)
                    && (info.avg_replica - row.objects).abs() > info.diff_replica
                {
                    report.replica_disc_part.push(row.pid);
                }
            }
            coverage[row.pid].remove(&row.replica);
        }
        data.insert(node.clone(), node_pmap);
    }
    let formatted: BTreeMap<String, String> = missing
        .iter()
        .map(|(ns, coverage)| (ns.clone(), format_missing(coverage)))
        .collect();

    for node_pmap in data.values_mut() {
        for (ns, report) in node_pmap.iter_mut() {
            report.master_disc_part.sort_unstable();
            report.replica_disc_part.sort_unstable();
            report.missing_part = formatted.get(ns).cloned().unwrap_or_default();
        }
    }
    data
}

struct Row<'a> {
    ns: &'a str,
    pid: usize,
    state: &'a str,
    replica: usize,
    objects: i64,
}

fn parse_row<'a>(fields: &[&'a str], columns: &Columns) -> Option<Row<'a>> {
    Some(Row {
        ns: fields.get(columns.ns)?,
        pid: fields.get(columns.pid)?.parse().ok()?,
        state: fields.get(columns.state)?,
        replica: fields.get(columns.replica)?.parse().ok()?,
        objects: fields.get(columns.records)?.parse().ok()?,
    })
}

/// Derive per-namespace averages and tolerances from aggregate stats.
/// Stat names changed spelling across server generations; both are read.
fn namespace_info(
    namespace_stats: &BTreeMap<String, NodeMap<BTreeMap<String, String>>>,
) -> BTreeMap<String, NamespaceInfo> {
    let mut info = BTreeMap::new();

    for (ns, nodes) in namespace_stats {
        let mut master_total: i64 = 0;
        let mut replica_total: i64 = 0;
        let mut repl_factor: usize = 0;

        for params in nodes.values().filter_map(|r| r.as_ref().ok()) {
            master_total += int_of(params, &["master-objects", "master_objects"]);
            replica_total += int_of(params, &["prole-objects", "prole_objects"]);
            repl_factor = repl_factor.max(
                int_of(params, &["repl-factor", "replication-factor"]) as usize,
            );
        }
        let avg_master = master_total / PARTITIONS as i64;
        let avg_replica = replica_total / PARTITIONS as i64;

        info.insert(
            ns.clone(),
            NamespaceInfo {
                avg_master,
                avg_replica,
                repl_factor,
                diff_master: (avg_master * DISCREPANCY_PCT / 100).max(DISCREPANCY_FLOOR),
                diff_replica: (avg_replica * DISCREPANCY_PCT / 100).max(DISCREPANCY_FLOOR),
            },
        );
    }
    info
}

fn int_of(params: &BTreeMap<String, String>, keys: &[&str]) -> i64 {
    keys.iter()
        .find_map(|key| params.get(*key))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Flatten the coverage structure into the `pid:S:ridx,…` report string,
/// ascending by `(pid, ridx)`.
fn format_missing(coverage: &[BTreeSet<usize>]) -> String {
    let mut parts = Vec::new();

    for (pid, replicas) in coverage.iter().enumerate() {
        for ridx in replicas {
            parts.push(format!("{pid}:S:{ridx}"));
        }
    }
    parts.join(",")
}

/// Compare a dotted build version against a target, component-wise.
/// Trailing junk after the numeric components is ignored.
fn version_at_least(build: &str, target: &[u64]) -> bool {
    let mut version = Vec::new();

    for component in build.split('.') {
        let digits: String = component.chars().take_while(char::is_ascii_digit).collect();

        match digits.parse::<u64>() {
            Ok(n) => version.push(n),
            Err(_) => break,
        }
    }
    for i in 0..target.len() {
        let have = version.get(i).copied().unwrap_or(0);

        match have.cmp(&target[i]) {
            std::cmp::Ordering::Greater => return true,
            std::cmp::Ordering::Less => return false,
            std::cmp::Ordering::Equal => continue,
        }
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    fn node_key(n: u8) -> NodeKey {
        NodeKey::new(&format!("10.0.0.{n}"), 3000)
    }

    fn ns_stats(
        ns: &str,
        per_node: &[(NodeKey, i64, i64, usize)],
    ) -> BTreeMap<String, NodeMap<BTreeMap<String, String>>> {
        let mut nodes = NodeMap::new();

        for (key, master, replica, repl) in per_node {
            let mut params = BTreeMap::new();
            params.insert("master-objects".to_owned(), master.to_string());
            params.insert("prole-objects".to_owned(), replica.to_string());
            params.insert("repl-factor".to_owned(), repl.to_string());
            nodes.insert(key.clone(), Ok(params));
        }
        let mut stats = BTreeMap::new();
        stats.insert(ns.to_owned(), nodes);
        stats
    }

    /// Headered `partition-info` rows for a range of partitions, all in
    /// sync, all with the same object count.
    fn headered_rows(ns: &str, replica: usize, pids: std::ops::Range<usize>, objects: i64) -> String {
        pids.map(|pid| format!("{ns}:{pid}:S:{replica}:{objects}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    const HEADER: &str = "namespace:partition:state:replica:records";

    fn builds_for(keys: &[NodeKey], build: &str) -> NodeMap<String> {
        keys.iter()
            .map(|key| (key.clone(), Ok(build.to_owned())))
            .collect()
    }

    #[test]
    fn test_version_at_least() {
        assert!(version_at_least("3.6.1", &[3, 6, 1]));
        assert!(version_at_least("3.16.0.6", &[3, 6, 1]));
        assert!(version_at_least("4.0", &[3, 6, 1]));
        assert!(!version_at_least("3.5.14", &[3, 6, 1]));
        assert!(!version_at_least("3.6.0", &[3, 6, 1]));
        assert!(version_at_least("3.6.1-rc1", &[3, 6, 1]));
        assert!(!version_at_least("junk", &[3, 6, 1]));
    }

    #[test]
    fn test_healthy_two_node_coverage() {
        let (a, b) = (node_key(1), node_key(2));

        // A masters everything and holds the first half as replica 1;
        // B holds the second half as replica 1.
        let a_rows = format!(
            "{HEADER};{};{}",
            headered_rows("test", 0, 0..PARTITIONS, 0),
            headered_rows("test", 1, 0..PARTITIONS / 2, 0)
        );
        let b_rows = format!(
            "{HEADER};{}",
            headered_rows("test", 1, PARTITIONS / 2..PARTITIONS, 0)
        );
        let mut pmap_info = NodeMap::new();
        pmap_info.insert(a.clone(), Ok(a_rows));
        pmap_info.insert(b.clone(), Ok(b_rows));

        let stats = ns_stats("test", &[(a.clone(), 0, 0, 2), (b.clone(), 0, 0, 2)]);
        let builds = builds_for(&[a.clone(), b.clone()], "3.16.0.6");
        let data = analyze(&pmap_info, &stats, &builds);

        let a_report = &data[&a]["test"];
        let b_report = &data[&b]["test"];

        assert_eq!(a_report.pri_index + b_report.pri_index, 4096);
        assert_eq!(a_report.sec_index + b_report.sec_index, 4096);
        assert_eq!(a_report.missing_part, "");
        assert_eq!(b_report.missing_part, "");
        assert!(a_report.master_disc_part.is_empty());
        assert!(b_report.replica_disc_part.is_empty());
    }

    #[test]
    fn test_master_discrepancy() {
        let x = node_key(1);

        // Cluster average is one million objects per master partition;
        // partition 42 carries 1.2 million.
        let mut rows = vec![HEADER.to_owned()];
        for pid in 0..PARTITIONS {
            let objects = if pid == 42 { 1_200_000 } else { 1_000_000 };
            rows.push(format!("test:{pid}:S:0:{objects}"));
        }
        let mut pmap_info = NodeMap::new();
        pmap_info.insert(x.clone(), Ok(rows.join(";")));

        let stats = ns_stats("test", &[(x.clone(), 1_000_000 * PARTITIONS as i64, 0, 1)]);
        let builds = builds_for(&[x.clone()], "3.16.0.6");
        let data = analyze(&pmap_info, &stats, &builds);
        let report = &data[&x]["test"];

        assert_eq!(report.master_disc_part, vec![42]);
        assert_eq!(report.pri_index, 4096);
        assert_eq!(report.missing_part, "");
    }

    #[test]
    fn test_missing_replicas_reported() {
        let a = node_key(1);

        // Replication factor 2, but nothing covers replica 1 of the
        // first two partitions, and partition 1 has no master either.
        let rows = format!(
            "{HEADER};{};{}",
            headered_rows("test", 0, 0..1, 0),
            headered_rows("test", 0, 2..PARTITIONS, 0)
        );
        let mut pmap_info = NodeMap::new();
        pmap_info.insert(a.clone(), Ok(rows));

        let stats = ns_stats("test", &[(a.clone(), 0, 0, 2)]);
        let builds = builds_for(&[a.clone()], "3.16.0.6");
        let data = analyze(&pmap_info, &stats, &builds);
        let report = &data[&a]["test"];

        let mut expected = vec!["0:S:1".to_owned(), "1:S:0".to_owned(), "1:S:1".to_owned()];
        expected.extend((2..PARTITIONS).map(|pid| format!("{pid}:S:1")));
        assert_eq!(report.missing_part, expected.join(","));
    }

    #[test]
    fn test_positional_layouts() {
        let old = node_key(1);
        let new = node_key(2);

        // Old servers put the records count at index 9, 3.6.1 moved it
        // to index 8. Same partition, same count, different layout.
        let old_row = "test:7:S:0:x:x:x:x:x:2000000";
        let new_row = "test:7:S:0:x:x:x:x:2000000";

        let mut pmap_info = NodeMap::new();
        pmap_info.insert(old.clone(), Ok(old_row.to_owned()));
        pmap_info.insert(new.clone(), Ok(new_row.to_owned()));

        let stats = ns_stats(
            "test",
            &[(old.clone(), 0, 0, 1), (new.clone(), 0, 0, 1)],
        );
        let mut builds = NodeMap::new();
        builds.insert(old.clone(), Ok("3.5.14".to_owned()));
        builds.insert(new.clone(), Ok("3.7.5".to_owned()));

        let data = analyze(&pmap_info, &stats, &builds);

        // Both rows parsed: averages are zero, so the big object counts
        // flag partition 7 on both nodes.
        assert_eq!(data[&old]["test"].master_disc_part, vec![7]);
        assert_eq!(data[&new]["test"].master_disc_part, vec![7]);
    }

    #[test]
    fn test_out_of_range_pid_ignored() {
        let a = node_key(1);
        let rows = format!("{HEADER};test:4096:S:0:0;test:0:S:0:0");

        let mut pmap_info = NodeMap::new();
        pmap_info.insert(a.clone(), Ok(rows));

        let stats = ns_stats("test", &[(a.clone(), 0, 0, 1)]);
        let builds = builds_for(&[a.clone()], "3.16.0.6");
        let data = analyze(&pmap_info, &stats, &builds);

        assert_eq!(data[&a]["test"].pri_index, 1);
    }

    #[test]
    fn test_node_error_skipped() {
        let a = node_key(1);
        let b = node_key(2);

        let mut pmap_info = NodeMap::new();
        pmap_info.insert(a.clone(), Ok(format!("{HEADER};test:0:S:0:0")));
        pmap_info.insert(b.clone(), Err(crate::error::Error::Timeout));

        let stats = ns_stats("test", &[(a.clone(), 0, 0, 1)]);
        let builds = builds_for(&[a.clone(), b.clone()], "3.16.0.6");
        let data = analyze(&pmap_info, &stats, &builds);

        assert!(data.contains_key(&a));
        assert!(!data.contains_key(&b));
    }

    #[test]
    fn test_discrepancy_symmetry() {
        let (a, b) = (node_key(1), node_key(2));
        let rows = |_: &NodeKey| {
            format!(
                "{HEADER};{}",
                headered_rows("test", 0, 0..PARTITIONS, 500_000)
            )
        };
        let swap = |data: PmapData| {
            let mut reports: Vec<_> = data.into_values().collect();
            reports.sort_by_key(|r| r["test"].pri_index);
            reports
        };

        let mut forward = NodeMap::new();
        forward.insert(a.clone(), Ok(rows(&a)));
        forward.insert(b.clone(), Ok(rows(&b)));

        let mut backward = NodeMap::new();
        backward.insert(b.clone(), Ok(rows(&b)));
        backward.insert(a.clone(), Ok(rows(&a)));

        let stats = ns_stats(
            "test",
            &[(a.clone(), 500_000 * 4096, 0, 1), (b.clone(), 500_000 * 4096, 0, 1)],
        );
        let builds = builds_for(&[a, b], "3.16.0.6");

        assert_eq!(
            swap(analyze(&forward, &stats, &builds)),
            swap(analyze(&backward, &stats, &builds))
        );
    }
}
