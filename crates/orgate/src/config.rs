//! Configuration for the orgate daemon.
//!
//! Configuration comes from a TOML file merged over a set of embedded
//! defaults.  The raw file is deserialized with serde and then
//! validated into a [`Config`], whose addresses are parsed once at
//! startup so that nothing else in the daemon ever has to worry about
//! malformed address strings.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Default options to use for our configuration.
const ORGATE_DEFAULTS: &str = include_str!("./orgate_defaults.toml");

/// The address of a control-port style endpoint: either a TCP address
/// or a Unix domain socket path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CtlAddr {
    /// A TCP socket address.
    Tcp(SocketAddr),
    /// A Unix domain socket path.
    Unix(PathBuf),
}

impl fmt::Display for CtlAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtlAddr::Tcp(a) => write!(f, "tcp://{}", a),
            CtlAddr::Unix(p) => write!(f, "unix://{}", p.display()),
        }
    }
}

/// Structure of the configuration file, before validation.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    /// Address of the filtered control listener.
    filtered_address: String,
    /// Address of the SOCKS listener.
    socks_address: String,
    /// Whether unmatched targets may go out directly.
    unsafe_allow_direct: bool,
    /// Logging options.
    logging: LoggingFile,
    /// Tor upstream options.
    tor: TorFile,
    /// I2P upstream options.
    i2p: I2pFile,
}

/// The `[logging]` section of the configuration file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct LoggingFile {
    /// Log at all.
    enable: bool,
    /// Log per-line protocol chatter.
    debug: bool,
}

/// The `[tor]` section of the configuration file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct TorFile {
    /// Use Tor as an upstream.
    enable: bool,
    /// Address of the real control port.
    control_address: String,
    /// Address of the real SOCKS port.
    socks_address: String,
    /// Fake-acknowledge NEWNYM instead of forwarding it.
    suppress_newnym: bool,
}

/// The `[i2p]` section of the configuration file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct I2pFile {
    /// Use I2P as an upstream.
    enable: bool,
    /// Allow access to the router console.
    enable_management: bool,
    /// Allow access to the router's local server.
    enable_local: bool,
    /// Address of the router console.
    management_address: String,
    /// Address of the router's local server.
    local_address: String,
    /// Address of the router's HTTP proxy.
    http_address: String,
    /// Address of the router's HTTPS CONNECT proxy.
    https_address: String,
}

/// A validated orgate configuration.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    /// Address of the filtered control listener.
    pub(crate) filtered_addr: SocketAddr,
    /// Address of the SOCKS listener.
    pub(crate) socks_addr: SocketAddr,
    /// Whether unmatched targets may go out directly.
    pub(crate) unsafe_allow_direct: bool,
    /// Logging options.
    pub(crate) logging: Logging,
    /// Tor upstream options.
    pub(crate) tor: TorConfig,
    /// I2P upstream options.
    pub(crate) i2p: I2pConfig,
}

/// Validated logging options.
#[derive(Clone, Debug)]
pub(crate) struct Logging {
    /// Log at all.
    pub(crate) enable: bool,
    /// Log per-line protocol chatter.
    pub(crate) debug: bool,
}

/// Validated Tor upstream options.
#[derive(Clone, Debug)]
pub(crate) struct TorConfig {
    /// Use Tor as an upstream.
    pub(crate) enable: bool,
    /// Fake-acknowledge NEWNYM instead of forwarding it.
    pub(crate) suppress_newnym: bool,
    /// Address of the real control port; present iff enabled.
    pub(crate) control_addr: Option<CtlAddr>,
    /// Address of the real SOCKS port; present iff enabled.
    pub(crate) socks_addr: Option<SocketAddr>,
}

impl TorConfig {
    /// Return the address of the real Tor control port.
    ///
    /// # Panics
    ///
    /// Panics if Tor is disabled; validation guarantees the address is
    /// present otherwise.
    pub(crate) fn control_addr(&self) -> &CtlAddr {
        match &self.control_addr {
            Some(a) => a,
            None => panic!("BUG: tor.control_addr() called when Tor is disabled"),
        }
    }

    /// Return the address of the real Tor SOCKS port.
    ///
    /// # Panics
    ///
    /// Panics if Tor is disabled.
    pub(crate) fn socks_addr(&self) -> SocketAddr {
        match self.socks_addr {
            Some(a) => a,
            None => panic!("BUG: tor.socks_addr() called when Tor is disabled"),
        }
    }
}

/// Validated I2P upstream options.
#[derive(Clone, Debug)]
pub(crate) struct I2pConfig {
    /// Use I2P as an upstream.
    pub(crate) enable: bool,
    /// Allow access to the router console.
    pub(crate) enable_management: bool,
    /// Allow access to the router's local server.
    pub(crate) enable_local: bool,
    /// Address of the router console; present iff enabled.
    pub(crate) management_addr: Option<SocketAddr>,
    /// Address of the router's local server; present iff enabled.
    pub(crate) local_addr: Option<SocketAddr>,
    /// Address of the router's HTTP proxy; present iff enabled.
    pub(crate) http_addr: Option<SocketAddr>,
    /// Address of the router's HTTPS CONNECT proxy; present iff enabled.
    pub(crate) https_addr: Option<SocketAddr>,
}

impl I2pConfig {
    /// Return true iff `target` (canonical `host:port`) is the router
    /// console's address.
    pub(crate) fn is_management_addr(&self, target: &str) -> bool {
        match (self.enable, &self.management_addr) {
            (true, Some(a)) => a.to_string() == target,
            _ => false,
        }
    }

    /// Return true iff `target` (canonical `host:port`) is the local
    /// server's address.
    pub(crate) fn is_local_addr(&self, target: &str) -> bool {
        match (self.enable, &self.local_addr) {
            (true, Some(a)) => a.to_string() == target,
            _ => false,
        }
    }

    /// Return true iff `host` is the host component of the router
    /// console's address.
    pub(crate) fn is_management_host(&self, host: &str) -> bool {
        match (self.enable, &self.management_addr) {
            (true, Some(a)) => a.ip().to_string() == host,
            _ => false,
        }
    }

    /// Return true iff `host` is the host component of the local
    /// server's address.
    pub(crate) fn is_local_host(&self, host: &str) -> bool {
        match (self.enable, &self.local_addr) {
            (true, Some(a)) => a.ip().to_string() == host,
            _ => false,
        }
    }

    /// Return the router console address.
    ///
    /// # Panics
    ///
    /// Panics if I2P is disabled.
    pub(crate) fn management_addr(&self) -> SocketAddr {
        match self.management_addr {
            Some(a) => a,
            None => panic!("BUG: i2p.management_addr() called when I2P is disabled"),
        }
    }

    /// Return the local server address.
    ///
    /// # Panics
    ///
    /// Panics if I2P is disabled.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        match self.local_addr {
            Some(a) => a,
            None => panic!("BUG: i2p.local_addr() called when I2P is disabled"),
        }
    }

    /// Return the HTTP proxy address.
    ///
    /// # Panics
    ///
    /// Panics if I2P is disabled.
    pub(crate) fn http_addr(&self) -> SocketAddr {
        match self.http_addr {
            Some(a) => a,
            None => panic!("BUG: i2p.http_addr() called when I2P is disabled"),
        }
    }

    /// Return the HTTPS CONNECT proxy address.
    ///
    /// # Panics
    ///
    /// Panics if I2P is disabled.
    pub(crate) fn https_addr(&self) -> SocketAddr {
        match self.https_addr {
            Some(a) => a,
            None => panic!("BUG: i2p.https_addr() called when I2P is disabled"),
        }
    }
}

/// Load and validate a configuration from the file at `path`, merged
/// over the embedded defaults.
pub(crate) fn load(path: &str) -> Result<Config> {
    let mut loader = defaults_loader()?;
    loader
        .merge(::config::File::from(Path::new(path)).format(::config::FileFormat::Toml))
        .with_context(|| format!("Failed to read config file '{}'", path))?;
    let file: ConfigFile = loader
        .try_into()
        .context("Failed to parse config file")?;
    file.validate()
}

/// Return a loader preloaded with the embedded defaults.
fn defaults_loader() -> Result<::config::Config> {
    let mut loader = ::config::Config::new();
    loader
        .merge(::config::File::from_str(
            ORGATE_DEFAULTS,
            ::config::FileFormat::Toml,
        ))
        .context("Failed to load built-in defaults")?;
    Ok(loader)
}

/// Parse a `tcp://host:port` or bare `host:port` string.
fn parse_tcp_addr(s: &str) -> Result<SocketAddr> {
    let s = s.strip_prefix("tcp://").unwrap_or(s);
    s.parse()
        .with_context(|| format!("'{}' is not a host:port address", s))
}

/// Parse a control-port style address: `tcp://host:port`,
/// `unix:///path`, or bare `host:port`.
fn parse_ctl_addr(s: &str) -> Result<CtlAddr> {
    if let Some(path) = s.strip_prefix("unix://") {
        if path.is_empty() {
            bail!("Empty unix socket path");
        }
        return Ok(CtlAddr::Unix(path.into()));
    }
    parse_tcp_addr(s).map(CtlAddr::Tcp)
}

impl ConfigFile {
    /// Validate the file contents into a [`Config`].
    fn validate(self) -> Result<Config> {
        let filtered_addr = match parse_ctl_addr(&self.filtered_address)
            .context("Failed to parse filtered control port address")?
        {
            CtlAddr::Tcp(a) => a,
            CtlAddr::Unix(_) => bail!("Filtered control port address must be a TCP address"),
        };
        let socks_addr =
            parse_tcp_addr(&self.socks_address).context("Failed to parse SOCKS address")?;

        if !self.unsafe_allow_direct && !self.tor.enable && !self.i2p.enable {
            bail!("No upstream connection methods configured");
        }

        let tor = if self.tor.enable {
            TorConfig {
                enable: true,
                suppress_newnym: self.tor.suppress_newnym,
                control_addr: Some(
                    parse_ctl_addr(&self.tor.control_address)
                        .context("Failed to parse Tor control port address")?,
                ),
                socks_addr: Some(
                    parse_tcp_addr(&self.tor.socks_address)
                        .context("Failed to parse Tor SOCKS address")?,
                ),
            }
        } else {
            TorConfig {
                enable: false,
                suppress_newnym: self.tor.suppress_newnym,
                control_addr: None,
                socks_addr: None,
            }
        };

        let i2p = if self.i2p.enable {
            // The management and local addresses stay mandatory even
            // when access to them is disabled, so that requests for
            // them can be recognized and refused.
            I2pConfig {
                enable: true,
                enable_management: self.i2p.enable_management,
                enable_local: self.i2p.enable_local,
                management_addr: Some(
                    parse_tcp_addr(&self.i2p.management_address)
                        .context("Failed to parse I2P management address")?,
                ),
                local_addr: Some(
                    parse_tcp_addr(&self.i2p.local_address)
                        .context("Failed to parse I2P local server address")?,
                ),
                http_addr: Some(
                    parse_tcp_addr(&self.i2p.http_address)
                        .context("Failed to parse I2P HTTP proxy address")?,
                ),
                https_addr: Some(
                    parse_tcp_addr(&self.i2p.https_address)
                        .context("Failed to parse I2P HTTPS proxy address")?,
                ),
            }
        } else {
            I2pConfig {
                enable: false,
                enable_management: false,
                enable_local: false,
                management_addr: None,
                local_addr: None,
                http_addr: None,
                https_addr: None,
            }
        };

        Ok(Config {
            filtered_addr,
            socks_addr,
            unsafe_allow_direct: self.unsafe_allow_direct,
            logging: Logging {
                enable: self.logging.enable,
                debug: self.logging.debug,
            },
            tor,
            i2p,
        })
    }
}
