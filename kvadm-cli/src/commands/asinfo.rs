use std::ffi::OsString;

use kvadm::Cluster;

use super::Help;

pub const HELP: Help = Help {
    name: "asinfo",
    description: "Run a raw info command on every node",
    usage: r#"
Usage

    kvadm [<option>...] asinfo -v <command>

    Sends the command verbatim to every node's info port and prints the
    raw replies, one block per node.

Options

    -v, --value <command>    The info command to send
    --help                   Print help
"#,
};

#[derive(Debug)]
pub struct Options {
    pub command: String,
}

impl Options {
    pub fn from_args(args: Vec<OsString>) -> anyhow::Result<Self> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_args(args);
        let mut command = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Short('v') | Long("value") => {
                    command = Some(parser.value()?.to_string_lossy().into_owned());
                }
                Long("help") => {
                    println!("{}", HELP.usage);
                    std::process::exit(0);
                }
                _ => anyhow::bail!("{}", arg.unexpected()),
            }
        }
        let command = command.ok_or_else(|| anyhow::anyhow!("an info command is required (-v)"))?;

        Ok(Options { command })
    }
}

pub fn run(options: Options, cluster: &Cluster) -> anyhow::Result<()> {
    cluster.refresh();

    let results: std::collections::BTreeMap<_, _> = cluster
        .info_command_all(&options.command)
        .into_iter()
        .collect();

    for (key, result) in results {
        println!("{key} returned:");
        match result {
            Ok(value) if value.is_empty() => println!("(empty)"),
            Ok(value) => println!("{value}"),
            Err(e) => println!("error: {e}"),
        }
        println!();
    }
    Ok(())
}
