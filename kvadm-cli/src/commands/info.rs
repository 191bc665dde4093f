use std::ffi::OsString;

use kvadm::Cluster;

use super::Help;

pub const HELP: Help = Help {
    name: "info",
    description: "Summarize cluster membership and health",
    usage: r#"
Usage

    kvadm [<option>...] info

    Prints one line per known node: address, node id, build and
    liveness. The expected principal is marked with `*`.

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

    let builds = cluster.info_all("build", |n| n.build());
    let names = cluster.info_command_all("cluster-name");
    let principal = cluster.expected_principal();

    println!(
        "{:<28} {:<18} {:<12} {:<16} {}",
        "NODE", "NODE-ID", "BUILD", "CLUSTER", "ALIVE"
    );
    for node in cluster.nodes() {
        let key = node.key();
        let id = node.node_id();
        let marker = if Some(&id) == principal.as_ref() { "*" } else { "" };
        let build = builds
            .get(&key)
            .and_then(|r| r.as_deref().ok())
            .unwrap_or("-");
        let name = names
            .get(&key)
            .and_then(|r| r.as_deref().ok())
            .unwrap_or("-");

        println!(
            "{:<28} {:<18} {:<12} {:<16} {}",
            key.to_string(),
            format!("{marker}{id}"),
            build,
            name,
            node.is_alive()
        );
    }
    Ok(())
}
