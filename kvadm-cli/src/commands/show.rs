use std::ffi::OsString;

use kvadm::node::{Latency, LatencyScope};
use kvadm::{Cluster, NodeMap};
use serde_json::{json, Value};

use super::{aggregate_json, Help};

pub const HELP: Help = Help {
    name: "show",
    description: "Display statistics, configuration or latency across the cluster",
    usage: r#"
Usage

    kvadm [<option>...] show (statistics | config | latency)

    Fans the relevant info commands out to every node and prints the
    aggregated sections as JSON, keyed by section and node.

Options

    --help    Print help
"#,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Statistics,
    Config,
    Latency,
}

#[derive(Debug)]
pub struct Options {
    pub section: Section,
}

impl Options {
    pub fn from_args(args: Vec<OsString>) -> anyhow::Result<Self> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_args(args);
        let mut section = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Long("help") => {
                    println!("{}", HELP.usage);
                    std::process::exit(0);
                }
                Value(value) if section.is_none() => {
                    section = match value.to_string_lossy().as_ref() {
                        "statistics" => Some(Section::Statistics),
                        "config" => Some(Section::Config),
                        "latency" => Some(Section::Latency),
                        other => anyhow::bail!("unknown section `{other}`"),
                    };
                }
                _ => anyhow::bail!("{}", arg.unexpected()),
            }
        }
        let section = section
            .ok_or_else(|| anyhow::anyhow!("a section is required: statistics | config | latency"))?;

        Ok(Options { section })
    }
}

pub fn run(options: Options, cluster: &Cluster) -> anyhow::Result<()> {
    cluster.refresh();

    let output = match options.section {
        Section::Statistics => {
            let service = cluster.info_all("statistics", |n| n.statistics());
            let namespace =
                cluster.info_all("namespace statistics", |n| n.all_namespace_statistics());
            let bins = cluster.info_all("bin statistics", |n| n.bin_statistics());
            let xdr = cluster.info_all("xdr statistics", |n| n.xdr_statistics());

            json!({
                "service": aggregate_json(&service),
                "namespace": aggregate_json(&namespace),
                "bin": aggregate_json(&bins),
                "xdr": aggregate_json(&xdr),
            })
        }
        Section::Config => {
            let service = cluster.info_all("service config", |n| n.service_config());
            let namespace = cluster.info_all("namespace config", |n| n.all_namespace_config());
            let network = cluster.info_all("network config", |n| n.network_config());
            let xdr = cluster.info_all("xdr config", |n| n.xdr_config());
            let dc = cluster.info_all("dc config", |n| n.dc_config());

            json!({
                "service": aggregate_json(&service),
                "namespace": aggregate_json(&namespace),
                "network": aggregate_json(&network),
                "xdr": aggregate_json(&xdr),
                "dc": aggregate_json(&dc),
            })
        }
        Section::Latency => {
            let latency = cluster.info_all("latency", |n| n.latency(None, None, None));

            json!({ "latency": latency_aggregate_json(&latency) })
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

/// Latency tables carry typed scopes, so they are rendered by hand:
/// `{node: {histogram: {scope: {columns, rows}}}}`.
fn latency_aggregate_json(aggregate: &NodeMap<Latency>) -> Value {
    let entries = aggregate
        .iter()
        .map(|(key, result)| {
            let value = match result {
                Ok(latency) => latency_json(latency),
                Err(e) => json!({ "error": e.to_string() }),
            };
            (key.to_string(), value)
        })
        .collect();

    Value::Object(entries)
}

fn latency_json(latency: &Latency) -> Value {
    let histograms = latency
        .iter()
        .map(|(histogram, scopes)| {
            let tables: serde_json::Map<String, Value> = scopes
                .iter()
                .map(|(scope, table)| {
                    let name = match scope {
                        LatencyScope::Namespace(ns) => ns.clone(),
                        LatencyScope::Total => "total".to_owned(),
                    };
                    let rows: Vec<Value> = table
                        .rows
                        .iter()
                        .map(|row| json!({ "span": row.span, "values": row.values }))
                        .collect();

                    (name, json!({ "columns": table.columns, "rows": rows }))
                })
                .collect();

            (histogram.clone(), Value::Object(tables))
        })
        .collect();

    Value::Object(histograms)
}
