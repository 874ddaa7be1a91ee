//! Message types for the SOCKS5 subset we relay.

use crate::{Error, Result};

use caret::caret_int;
use std::fmt;
use std::net::IpAddr;

/// A completed SOCKS5 request, as negotiated on a SOCKS connection.
///
/// Once this request is done, we know where to connect (or what name to
/// look up), and which isolation credentials the client supplied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocksRequest {
    /// The command that the client wants to perform.
    cmd: SocksCmd,
    /// The target address.
    addr: SocksAddr,
    /// The target port.
    port: u16,
    /// The isolation credentials, if any, from the sub-negotiation.
    auth: SocksAuth,
}

/// An address sent or received as part of a SOCKS handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SocksAddr {
    /// A hostname, to be resolved by the upstream proxy.
    Hostname(String),
    /// An IP address literal.
    Ip(IpAddr),
}

/// The authentication information from a SOCKS handshake.
///
/// These credentials are never verified: they exist so that clients can
/// mark streams that must not share an upstream identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SocksAuth {
    /// No authentication was performed.
    NoAuth,
    /// Username/password authentication, per RFC 1929.  Either field
    /// may be an empty byte string.
    Username(Vec<u8>, Vec<u8>),
}

caret_int! {
    /// A SOCKS5 command, as stated in a [`SocksRequest`].
    pub struct SocksCmd(u8) {
        /// Connect to a remote TCP address:port.
        CONNECT = 1,
        /// A Tor extension: resolve the given hostname.
        RESOLVE = 0xF0,
        /// A Tor extension: reverse-resolve the given IP address.
        RESOLVE_PTR = 0xF1,
    }
}

caret_int! {
    /// Possible reply status values from a SOCKS5 handshake.
    pub struct SocksStatus(u8) {
        /// RFC 1928: "succeeded"
        SUCCEEDED = 0x00,
        /// RFC 1928: "general SOCKS server failure"
        GENERAL_FAILURE = 0x01,
        /// RFC 1928: "connection not allowable by ruleset"
        ///
        /// We use this for destinations that the configuration refuses
        /// to dispatch anywhere.
        NOT_ALLOWED = 0x02,
        /// RFC 1928: "Network unreachable"
        NETWORK_UNREACHABLE = 0x03,
        /// RFC 1928: "Host unreachable"
        HOST_UNREACHABLE = 0x04,
        /// RFC 1928: "Connection refused"
        CONNECTION_REFUSED = 0x05,
        /// RFC 1928: "TTL expired"
        TTL_EXPIRED = 0x06,
        /// RFC 1928: "Command not supported"
        COMMAND_NOT_SUPPORTED = 0x07,
        /// RFC 1928: "Address type not supported"
        ADDRTYPE_NOT_SUPPORTED = 0x08,
    }
}

impl SocksCmd {
    /// Return true if this is a command we relay.
    fn recognized(self) -> bool {
        matches!(self, SocksCmd::CONNECT | SocksCmd::RESOLVE | SocksCmd::RESOLVE_PTR)
    }
}

impl SocksStatus {
    /// Map an I/O error from an upstream dial attempt onto the reply
    /// status that best describes it to the client.
    pub fn from_io_error(e: &std::io::Error) -> Self {
        use std::io::ErrorKind as EK;
        match e.kind() {
            EK::ConnectionRefused => SocksStatus::CONNECTION_REFUSED,
            EK::HostUnreachable => SocksStatus::HOST_UNREACHABLE,
            EK::NetworkUnreachable => SocksStatus::NETWORK_UNREACHABLE,
            _ => SocksStatus::GENERAL_FAILURE,
        }
    }
}

impl SocksRequest {
    /// Construct a SocksRequest from its parts.
    ///
    /// Rejects commands other than CONNECT/RESOLVE/RESOLVE_PTR, and
    /// requests for port 0.
    pub(crate) fn new(cmd: SocksCmd, addr: SocksAddr, port: u16, auth: SocksAuth) -> Result<Self> {
        if !cmd.recognized() {
            return Err(Error::BadCommand(cmd.get()));
        }
        if port == 0 {
            return Err(Error::Syntax);
        }
        Ok(SocksRequest {
            cmd,
            addr,
            port,
            auth,
        })
    }

    /// Return the command that the client requested.
    pub fn command(&self) -> SocksCmd {
        self.cmd
    }
    /// Return the target address of this request.
    pub fn addr(&self) -> &SocksAddr {
        &self.addr
    }
    /// Return the target port of this request.
    pub fn port(&self) -> u16 {
        self.port
    }
    /// Return the authentication (isolation) credentials of this request.
    pub fn auth(&self) -> &SocksAuth {
        &self.auth
    }
    /// Return the canonical `host:port` form of this request's target,
    /// with IPv6 literals in square brackets.
    pub fn target(&self) -> String {
        self.addr.canonical(self.port)
    }
}

impl SocksAddr {
    /// Format this address together with a port, in the canonical
    /// `host:port` form used for address comparisons.
    pub fn canonical(&self, port: u16) -> String {
        match self {
            SocksAddr::Ip(IpAddr::V6(ip)) => format!("[{}]:{}", ip, port),
            other => format!("{}:{}", other, port),
        }
    }
}

impl fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksAddr::Ip(a) => write!(f, "{}", a),
            SocksAddr::Hostname(h) => write!(f, "{}", h),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn bad_requests() {
        let e = SocksRequest::new(
            SocksCmd::from(2), // BIND
            SocksAddr::Hostname("www.example.com".to_string()),
            443,
            SocksAuth::NoAuth,
        );
        assert_eq!(e, Err(Error::BadCommand(2)));

        let e = SocksRequest::new(
            SocksCmd::CONNECT,
            SocksAddr::Hostname("www.example.com".to_string()),
            0,
            SocksAuth::NoAuth,
        );
        assert_eq!(e, Err(Error::Syntax));
    }

    #[test]
    fn canonical_form() {
        let addr = SocksAddr::Hostname("eep.i2p".to_string());
        assert_eq!(addr.canonical(80), "eep.i2p:80");

        let addr = SocksAddr::Ip(Ipv4Addr::new(127, 0, 0, 1).into());
        assert_eq!(addr.canonical(7657), "127.0.0.1:7657");

        let addr = SocksAddr::Ip(Ipv6Addr::LOCALHOST.into());
        assert_eq!(addr.canonical(7657), "[::1]:7657");
    }

    #[test]
    fn errors_to_status() {
        use std::io::{Error as IoError, ErrorKind as EK};
        let map = |k: EK| SocksStatus::from_io_error(&IoError::from(k));
        assert_eq!(map(EK::ConnectionRefused), SocksStatus::CONNECTION_REFUSED);
        assert_eq!(map(EK::HostUnreachable), SocksStatus::HOST_UNREACHABLE);
        assert_eq!(map(EK::NetworkUnreachable), SocksStatus::NETWORK_UNREACHABLE);
        assert_eq!(map(EK::TimedOut), SocksStatus::GENERAL_FAILURE);
        assert_eq!(map(EK::PermissionDenied), SocksStatus::GENERAL_FAILURE);
    }
}
