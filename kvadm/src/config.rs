//! Client configuration: policy flags, timeouts, credentials and TLS.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, ServerName};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default info protocol port.
pub const DEFAULT_PORT: u16 = 3000;
/// Default info port of the cross-datacenter replication subsystem.
pub const DEFAULT_XDR_PORT: u16 = 3004;
/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Default timeout for reading one reply.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Cluster-wide client settings. Shared read-only by every node.
#[derive(Clone, Default)]
pub struct Settings {
    /// Discover peers a node has *ever* known, not just active ones.
    pub use_services_alumni: bool,
    /// Discover peers through their alternate addresses.
    pub use_services_alt: bool,
    /// Do not expand membership beyond the seed list.
    pub only_connect_seed: bool,
    /// Timeouts for connect and read, respectively.
    pub timeouts: Timeouts,
    /// Credentials forwarded to the wire protocol.
    pub auth: Option<Credentials>,
    /// TLS context, when the deployment runs encrypted info ports.
    pub tls: Option<Tls>,
    /// Info port of the XDR subsystem on old servers.
    pub xdr_port: Option<u16>,
}

impl Settings {
    /// The XDR info port to fall back to.
    pub fn xdr_port(&self) -> u16 {
        self.xdr_port.unwrap_or(DEFAULT_XDR_PORT)
    }
}

/// Connect and read deadlines, carried separately.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Credentials forwarded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// TLS context shared by all node pools. Individual nodes carry their own
/// server name, discovered through the peers protocol.
#[derive(Clone)]
pub struct Tls {
    /// Server name to validate against when a node doesn't advertise one.
    pub default_name: Option<String>,
    config: Arc<rustls::ClientConfig>,
}

impl Tls {
    /// Build a TLS context from a PEM bundle of trusted roots.
    pub fn with_ca_file(path: &Path, default_name: Option<String>) -> Result<Self, Error> {
        let mut roots = rustls::RootCertStore::empty();

        for cert in CertificateDer::pem_file_iter(path)
            .map_err(|e| Error::Config(format!("can't read CA bundle {}: {e}", path.display())))?
        {
            let cert = cert
                .map_err(|e| Error::Config(format!("bad certificate in {}: {e}", path.display())))?;
            roots
                .add(cert)
                .map_err(|e| Error::Config(format!("rejected certificate: {e}")))?;
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            default_name,
            config: Arc::new(config),
        })
    }

    pub fn client_config(&self) -> Arc<rustls::ClientConfig> {
        self.config.clone()
    }

    /// Resolve the name to validate a node's certificate against.
    pub fn server_name(&self, tls_name: Option<&str>) -> Result<ServerName<'static>, Error> {
        let name = tls_name
            .or(self.default_name.as_deref())
            .ok_or_else(|| Error::Config("no TLS name configured for node".to_owned()))?;

        ServerName::try_from(name.to_owned())
            .map_err(|e| Error::Config(format!("invalid TLS name `{name}`: {e}")))
    }
}

/// One entry of a credentials file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCredential {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
}

/// A parsed credentials file: line-oriented `<ip[:port]> <user> <pwd>`,
/// with IPv6 hosts in brackets. Parsing is defensive: lines that don't
/// conform are skipped, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialFile {
    entries: Vec<HostCredential>,
}

impl CredentialFile {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("can't open {}: {e}", path.display())))?;
        let mut entries = Vec::new();

        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };

            if let Some(entry) = Self::parse_line(&line) {
                entries.push(entry);
            }
        }
        Ok(Self { entries })
    }

    /// Find credentials for a node by IP.
    pub fn lookup(&self, host: &str) -> Option<&HostCredential> {
        self.entries.iter().find(|c| c.host == host)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn parse_line(line: &str) -> Option<HostCredential> {
        let mut fields = line.split_whitespace();
        let addr = fields.next()?;
        let user = fields.next()?;
        let password = fields.next()?;

        let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
            // IPv6: `[host]` or `[host]:port`.
            let (host, rest) = rest.split_once(']')?;
            let port = rest.strip_prefix(':').and_then(|p| p.parse().ok());

            (host, port)
        } else {
            match addr.split_once(':') {
                Some((host, port)) => (host, port.parse().ok()),
                None => (addr, None),
            }
        };

        if host.is_empty() {
            return None;
        }
        Some(HostCredential {
            host: host.to_owned(),
            port,
            user: user.to_owned(),
            password: password.to_owned(),
        })
    }
}
