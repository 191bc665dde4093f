use std::ffi::OsString;
use std::fs::File;
use std::path::PathBuf;

use anyhow::Context as _;
use kvadm::snapshot::Snapshot;
use kvadm::Cluster;

use super::Help;

pub const HELP: Help = Help {
    name: "collectinfo",
    description: "Collect a cluster-wide JSON snapshot for offline analysis",
    usage: r#"
Usage

    kvadm [<option>...] collectinfo [-o <file>]

    Collects statistics, configuration and metadata from every node and
    writes one canonical JSON snapshot.

Options

    -o, --output <file>    Where to write the snapshot
                           (default: collect_info_<timestamp>.json)
    --help                 Print help
"#,
};

#[derive(Debug, Default)]
pub struct Options {
    pub output: Option<PathBuf>,
}

impl Options {
    pub fn from_args(args: Vec<OsString>) -> anyhow::Result<Self> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_args(args);
        let mut output = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Short('o') | Long("output") => {
                    output = Some(PathBuf::from(parser.value()?));
                }
                Long("help") => {
                    println!("{}", HELP.usage);
                    std::process::exit(0);
                }
                _ => anyhow::bail!("{}", arg.unexpected()),
            }
        }
        Ok(Options { output })
    }
}

pub fn run(options: Options, cluster: &Cluster) -> anyhow::Result<()> {
    cluster.refresh();

    let path = options.output.unwrap_or_else(|| {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");

        PathBuf::from(format!("collect_info_{timestamp}.json"))
    });
    let snapshot = Snapshot::collect(cluster);
    let file =
        File::create(&path).with_context(|| format!("can't create {}", path.display()))?;

    snapshot.write_to(file)?;
    log::info!(target: "cli", "Snapshot written to {}", path.display());
    println!("{}", path.display());

    Ok(())
}
