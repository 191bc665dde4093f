use std::ffi::OsString;

use kvadm::Cluster;

use super::Help;

pub const HELP: Help = Help {
    name: "pmap",
    description: "Analyze the partition map across the cluster",
    usage: r#"
Usage

    kvadm [<option>...] pmap

    Reconstructs per-namespace replication state from every node's
    partition table: sync master and replica counts, partitions whose
    object counts stray from the cluster average, and replicas no node
    holds at all.

Options

    --help    Print help
"#,
};

#[derive(Debug, Default)]
pub struct Options {}

impl Options {
    pub fn from_args(args: Vec<OsString>) -> anyhow::Result<Self> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_args(args);

        while let Some(arg) = parser.next()? {
            match arg {
                Long("help") => {
                    println!("{}", HELP.usage);
                    std::process::exit(0);
                }
                _ => anyhow::bail!("{}", arg.unexpected()),
            }
        }
        Ok(Options {})
    }
}

pub fn run(_options: Options, cluster: &Cluster) -> anyhow::Result<()> {
    cluster.refresh();

    let report = kvadm::pmap::report(cluster);
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
