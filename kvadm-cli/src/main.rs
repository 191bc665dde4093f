//! Thin shell over the cluster client: argument parsing, logger setup
//! and command dispatch. All real work happens in the `kvadm` crate.

mod commands;
mod logger;

use std::ffi::OsString;
use std::path::PathBuf;
use std::process;
use std::time;

use anyhow::{anyhow, bail, Context as _};

use kvadm::config::{CredentialFile, Credentials, Settings, Timeouts, Tls, DEFAULT_PORT};
use kvadm::{Cluster, Endpoint};

use commands::Help;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const COMMANDS: &[&Help] = &[
    &commands::asinfo::HELP,
    &commands::collectinfo::HELP,
    &commands::info::HELP,
    &commands::pmap::HELP,
    &commands::show::HELP,
];

const USAGE: &str = r#"
Usage

    kvadm [<option>...] <command> [<arg>...]

    Administrative client for a key-value store cluster. Connects to the
    given seed nodes, discovers the rest of the cluster and runs the
    command against every member.

Options

    -s, --seed <host[:port]>     Seed node to discover the cluster from
                                 (repeatable; default port 3000)
    --timeout <secs>             Read timeout per reply (default 5)
    --connect-timeout <secs>     Connect timeout per socket (default 3)
    --alumni                     Walk peers a node has ever known
    --alt                        Walk peers through alternate addresses
    --only-seeds                 Don't expand membership beyond the seeds
    --user <user>                User forwarded to the wire protocol
    --password <password>        Password forwarded to the wire protocol
    --credentials <file>         Credentials file, `<ip[:port]> <user> <pwd>`
    --tls-name <name>            Server name for TLS validation
    --tls-ca <file>              PEM bundle of trusted roots; enables TLS
    --verbose                    Log at debug level
    --version                    Print version
    --help                       Print help
"#;

struct Options {
    seeds: Vec<Endpoint>,
    settings: Settings,
    verbose: bool,
    command: String,
    args: Vec<OsString>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("kvadm: {err:#}");
        process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let options = Options::from_env()?;
    let level = logger::env_level().unwrap_or(if options.verbose {
        log::Level::Debug
    } else {
        log::Level::Warn
    });
    logger::init(level).ok();

    if options.seeds.is_empty() {
        bail!("at least one seed is required (-s <host[:port]>)");
    }
    let cluster = Cluster::new(options.seeds, options.settings);
    cluster.connect();

    match options.command.as_str() {
        "asinfo" => {
            let opts = commands::asinfo::Options::from_args(options.args)?;
            commands::asinfo::run(opts, &cluster)
        }
        "collectinfo" => {
            let opts = commands::collectinfo::Options::from_args(options.args)?;
            commands::collectinfo::run(opts, &cluster)
        }
        "info" => {
            let opts = commands::info::Options::from_args(options.args)?;
            commands::info::run(opts, &cluster)
        }
        "pmap" => {
            let opts = commands::pmap::Options::from_args(options.args)?;
            commands::pmap::run(opts, &cluster)
        }
        "show" => {
            let opts = commands::show::Options::from_args(options.args)?;
            commands::show::run(opts, &cluster)
        }
        other => Err(anyhow!("unknown command `{other}`\n{USAGE}")),
    }
}

impl Options {
    fn from_env() -> anyhow::Result<Self> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut seeds = Vec::new();
        let mut timeouts = Timeouts::default();
        let mut use_services_alumni = false;
        let mut use_services_alt = false;
        let mut only_connect_seed = false;
        let mut user = None;
        let mut password = None;
        let mut credential_file: Option<PathBuf> = None;
        let mut tls_name: Option<String> = None;
        let mut tls_ca: Option<PathBuf> = None;
        let mut verbose = false;
        let mut command = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Short('s') | Long("seed") => {
                    seeds.push(parse_seed(&parser.value()?.to_string_lossy())?);
                }
                Long("timeout") => {
                    timeouts.read = time::Duration::from_secs(parse_secs(&parser.value()?)?);
                }
                Long("connect-timeout") => {
                    timeouts.connect = time::Duration::from_secs(parse_secs(&parser.value()?)?);
                }
                Long("alumni") => use_services_alumni = true,
                Long("alt") => use_services_alt = true,
                Long("only-seeds") => only_connect_seed = true,
                Long("user") => user = Some(parser.value()?.to_string_lossy().into_owned()),
                Long("password") => {
                    password = Some(parser.value()?.to_string_lossy().into_owned());
                }
                Long("credentials") => credential_file = Some(PathBuf::from(parser.value()?)),
                Long("tls-name") => {
                    tls_name = Some(parser.value()?.to_string_lossy().into_owned());
                }
                Long("tls-ca") => tls_ca = Some(PathBuf::from(parser.value()?)),
                Long("verbose") => verbose = true,
                Long("version") => {
                    println!("kvadm {VERSION}");
                    process::exit(0);
                }
                Long("help") => {
                    print_usage();
                    process::exit(0);
                }
                Value(name) => {
                    command = Some(name.to_string_lossy().into_owned());
                    break;
                }
                _ => bail!("{}", arg.unexpected()),
            }
        }
        let Some(command) = command else {
            print_usage();
            process::exit(0);
        };
        let args: Vec<OsString> = parser.raw_args()?.collect();

        let tls = match tls_ca {
            Some(ca) => Some(Tls::with_ca_file(&ca, tls_name)?),
            None if tls_name.is_some() => {
                bail!("--tls-name requires --tls-ca");
            }
            None => None,
        };
        let auth = match (user, password) {
            (Some(user), Some(password)) => Some(Credentials { user, password }),
            (Some(_), None) | (None, Some(_)) => {
                bail!("--user and --password must be given together");
            }
            (None, None) => credentials_for_seeds(credential_file.as_deref(), &seeds)?,
        };

        Ok(Options {
            seeds,
            settings: Settings {
                use_services_alumni,
                use_services_alt,
                only_connect_seed,
                timeouts,
                auth,
                tls,
                xdr_port: None,
            },
            verbose,
            command,
            args,
        })
    }
}

/// Look up wire credentials for the seeds in a credentials file, when
/// none were given on the command line. The first seed with an entry
/// wins.
fn credentials_for_seeds(
    path: Option<&std::path::Path>,
    seeds: &[Endpoint],
) -> anyhow::Result<Option<Credentials>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let file = CredentialFile::load(path).context("can't read credentials file")?;

    Ok(seeds
        .iter()
        .find_map(|seed| file.lookup(&seed.host))
        .map(|entry| Credentials {
            user: entry.user.clone(),
            password: entry.password.clone(),
        }))
}

/// Parse a seed address: `host`, `host:port` or `[v6]:port`.
fn parse_seed(s: &str) -> anyhow::Result<Endpoint> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid seed `{s}`: unterminated bracket"))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse().context("invalid seed port")?,
            None => DEFAULT_PORT,
        };
        (host, port)
    } else {
        match s.rsplit_once(':') {
            // A second colon means a bare IPv6 address.
            Some((host, port)) if !host.contains(':') => {
                (host, port.parse().context("invalid seed port")?)
            }
            _ => (s, DEFAULT_PORT),
        }
    };
    if host.is_empty() {
        bail!("invalid seed `{s}`: empty host");
    }
    Ok(Endpoint::new(host, port))
}

fn parse_secs(value: &OsString) -> anyhow::Result<u64> {
    value
        .to_string_lossy()
        .parse()
        .map_err(|_| anyhow!("invalid number of seconds `{}`", value.to_string_lossy()))
}

fn print_usage() {
    println!("{USAGE}");
    println!("Commands\n");
    for help in COMMANDS {
        println!("    {:<14} {}", help.name, help.description);
    }
    println!();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_seed() {
        let seed = parse_seed("10.0.0.1:3100").unwrap();
        assert_eq!((seed.host.as_str(), seed.port), ("10.0.0.1", 3100));

        let seed = parse_seed("db.example.com").unwrap();
        assert_eq!((seed.host.as_str(), seed.port), ("db.example.com", 3000));

        let seed = parse_seed("[2001:db8::1]:3100").unwrap();
        assert_eq!((seed.host.as_str(), seed.port), ("2001:db8::1", 3100));

        let seed = parse_seed("[2001:db8::1]").unwrap();
        assert_eq!((seed.host.as_str(), seed.port), ("2001:db8::1", 3000));

        // A bare IPv6 address has more than one colon and no brackets.
        let seed = parse_seed("2001:db8::1").unwrap();
        assert_eq!((seed.host.as_str(), seed.port), ("2001:db8::1", 3000));

        assert!(parse_seed("[2001:db8::1").is_err());
        assert!(parse_seed("host:notaport").is_err());
    }
}
