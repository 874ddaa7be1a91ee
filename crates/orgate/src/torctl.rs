//! A minimal Tor control-port client.
//!
//! The filtered control port needs a real, authenticated upstream
//! connection before it lets a client anywhere near the pre-auth
//! dialogue, but it only ever drives three things itself: the
//! PROTOCOLINFO round trip (to learn the Tor version it will echo),
//! authentication with an empty password, and the verbatim relay of
//! `SIGNAL NEWNYM` lines.  Everything else on the wire is the client's
//! business.  So this is a deliberately tiny client, not a general
//! controller library.

use std::io;
use std::path::PathBuf;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::debug;

use crate::config::CtlAddr;
use crate::upstream::{dial_control, BoxedStream};

/// HMAC-SHA256, as SAFECOOKIE uses it.
type HmacSha256 = Hmac<Sha256>;

/// Key for the hash the server must present during SAFECOOKIE.
const SAFECOOKIE_SERVER_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";
/// Key for the hash we present during SAFECOOKIE.
const SAFECOOKIE_CLIENT_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";
/// Length of a control-port authentication cookie.
const COOKIE_LEN: usize = 32;

/// An error from the upstream control-port handshake.
#[derive(Error, Debug)]
pub(crate) enum TorCtlError {
    /// The control connection failed underneath us.
    #[error("control connection I/O error: {0}")]
    Io(#[from] io::Error),

    /// The server sent a line this client couldn't make sense of.
    #[error("malformed control reply line: {0:?}")]
    Malformed(String),

    /// The server answered a command with a non-250 status.
    #[error("control command failed: {0} {1}")]
    Failed(u16, String),

    /// The server offered no authentication method we can perform
    /// with an empty password.
    #[error("no usable authentication method (upstream offers {0:?})")]
    NoAuthMethod(Vec<String>),

    /// The advertised cookie file was missing, unreadable, or not a
    /// cookie.
    #[error("authentication cookie unusable: {0}")]
    BadCookie(String),

    /// The server flunked its half of SAFECOOKIE; somebody is lying
    /// to us.
    #[error("server hash mismatch during SAFECOOKIE authentication")]
    ServerHashMismatch,
}

/// The parts of a PROTOCOLINFO response this proxy cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ProtocolInfo {
    /// The upstream's version string, to be echoed in spoofed replies.
    pub(crate) tor_version: String,
    /// The authentication methods the upstream offers.
    pub(crate) auth_methods: Vec<String>,
    /// The advertised cookie file, if any.
    pub(crate) cookie_file: Option<PathBuf>,
}

/// One line of a control-port reply.
#[derive(Clone, Debug)]
struct ReplyLine {
    /// The three-digit status code.
    status: u16,
    /// Whether this was the final (space-separated) line.
    last: bool,
    /// The text after the separator, CRLF stripped.
    text: String,
}

/// An upstream control-port connection.
pub(crate) struct TorControl {
    /// Buffered read half.
    rd: BufReader<ReadHalf<BoxedStream>>,
    /// Write half.
    wr: WriteHalf<BoxedStream>,
}

impl TorControl {
    /// Connect to the control port at `addr`.
    pub(crate) async fn connect(addr: &CtlAddr) -> Result<Self, TorCtlError> {
        let stream = dial_control(addr).await?;
        let (rd, wr) = tokio::io::split(stream);
        Ok(TorControl {
            rd: BufReader::new(rd),
            wr,
        })
    }

    /// Issue PROTOCOLINFO and parse the response.
    pub(crate) async fn protocolinfo(&mut self) -> Result<ProtocolInfo, TorCtlError> {
        let lines = self.command("PROTOCOLINFO 1").await?;
        parse_protocolinfo(&lines)
    }

    /// Authenticate with an empty password, using the cheapest method
    /// the server offers: NULL outright, SAFECOOKIE if we must, and a
    /// literal empty password as a last resort.
    pub(crate) async fn authenticate(&mut self, pi: &ProtocolInfo) -> Result<(), TorCtlError> {
        let offers = |m: &str| pi.auth_methods.iter().any(|x| x == m);

        if offers("NULL") {
            self.command("AUTHENTICATE").await?;
            return Ok(());
        }
        if offers("SAFECOOKIE") {
            if let Some(path) = &pi.cookie_file {
                return self.auth_safecookie(path.clone()).await;
            }
        }
        if offers("HASHEDPASSWORD") {
            self.command("AUTHENTICATE \"\"").await?;
            return Ok(());
        }
        Err(TorCtlError::NoAuthMethod(pi.auth_methods.clone()))
    }

    /// Perform SAFECOOKIE challenge-response authentication using the
    /// cookie at `path`.
    async fn auth_safecookie(&mut self, path: PathBuf) -> Result<(), TorCtlError> {
        let cookie = tokio::fs::read(&path)
            .await
            .map_err(|e| TorCtlError::BadCookie(format!("{}: {}", path.display(), e)))?;
        if cookie.len() != COOKIE_LEN {
            return Err(TorCtlError::BadCookie(format!(
                "{}: wrong length {}",
                path.display(),
                cookie.len()
            )));
        }

        let mut client_nonce = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut client_nonce);

        let lines = self
            .command(&format!(
                "AUTHCHALLENGE SAFECOOKIE {}",
                hex::encode(client_nonce)
            ))
            .await?;
        let (server_hash, server_nonce) = parse_authchallenge(&lines)?;

        // The server proves it knows the cookie before we hand it
        // anything derived from ours.
        let mut mac = HmacSha256::new_from_slice(SAFECOOKIE_SERVER_KEY)
            .expect("HMAC can take a key of any size");
        mac.update(&cookie);
        mac.update(&client_nonce);
        mac.update(&server_nonce);
        mac.verify_slice(&server_hash)
            .map_err(|_| TorCtlError::ServerHashMismatch)?;

        let mut mac = HmacSha256::new_from_slice(SAFECOOKIE_CLIENT_KEY)
            .expect("HMAC can take a key of any size");
        mac.update(&cookie);
        mac.update(&client_nonce);
        mac.update(&server_nonce);
        let client_hash = mac.finalize().into_bytes();

        self.command(&format!("AUTHENTICATE {}", hex::encode(client_hash)))
            .await?;
        Ok(())
    }

    /// Send one command line and collect its reply, requiring a 250
    /// final status.
    async fn command(&mut self, line: &str) -> Result<Vec<ReplyLine>, TorCtlError> {
        debug!("P->S: {}", line);
        self.wr.write_all(line.as_bytes()).await?;
        self.wr.write_all(b"\r\n").await?;
        self.wr.flush().await?;

        let lines = self.read_reply().await?;
        // read_reply guarantees at least one line.
        let last = &lines[lines.len() - 1];
        if last.status != 250 {
            return Err(TorCtlError::Failed(last.status, last.text.clone()));
        }
        Ok(lines)
    }

    /// Read reply lines until the final (space-separated) one.
    async fn read_reply(&mut self) -> Result<Vec<ReplyLine>, TorCtlError> {
        let mut lines = Vec::new();
        loop {
            let mut raw = Vec::new();
            let n = self.rd.read_until(b'\n', &mut raw).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
            let line = parse_reply_line(&raw)?;
            debug!("S->P: {} {}", line.status, line.text);
            let done = line.last;
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    /// Split this connection into its buffered read half and write
    /// half, for the relay phase.
    pub(crate) fn into_split(self) -> (BufReader<ReadHalf<BoxedStream>>, WriteHalf<BoxedStream>) {
        (self.rd, self.wr)
    }
}

/// Parse one raw reply line.
fn parse_reply_line(raw: &[u8]) -> Result<ReplyLine, TorCtlError> {
    let s = String::from_utf8_lossy(raw);
    let s = s.trim_end_matches(|c| c == '\r' || c == '\n');
    if s.len() < 4 {
        return Err(TorCtlError::Malformed(s.to_string()));
    }
    let (code, rest) = s.split_at(3);
    let status: u16 = code
        .parse()
        .map_err(|_| TorCtlError::Malformed(s.to_string()))?;
    let sep = rest.as_bytes()[0];
    let last = match sep {
        b' ' => true,
        b'-' | b'+' => false,
        _ => return Err(TorCtlError::Malformed(s.to_string())),
    };
    Ok(ReplyLine {
        status,
        last,
        text: rest[1..].to_string(),
    })
}

/// Extract the interesting fields from a PROTOCOLINFO reply.
fn parse_protocolinfo(lines: &[ReplyLine]) -> Result<ProtocolInfo, TorCtlError> {
    let mut pi = ProtocolInfo::default();
    for line in lines {
        if let Some(auth) = line.text.strip_prefix("AUTH METHODS=") {
            let (methods, rest) = match auth.split_once(' ') {
                Some((m, r)) => (m, r),
                None => (auth, ""),
            };
            pi.auth_methods = methods.split(',').map(str::to_string).collect();
            if let Some(qstart) = rest.strip_prefix("COOKIEFILE=") {
                pi.cookie_file = Some(unquote(qstart)?.into());
            }
        } else if let Some(ver) = line.text.strip_prefix("VERSION Tor=") {
            pi.tor_version = unquote(ver)?;
        }
    }
    if pi.tor_version.is_empty() {
        return Err(TorCtlError::Malformed(
            "PROTOCOLINFO reply carried no version".to_string(),
        ));
    }
    Ok(pi)
}

/// Extract SERVERHASH and SERVERNONCE from an AUTHCHALLENGE reply.
fn parse_authchallenge(lines: &[ReplyLine]) -> Result<(Vec<u8>, Vec<u8>), TorCtlError> {
    let text = &lines[lines.len() - 1].text;
    let mut server_hash = None;
    let mut server_nonce = None;
    for tok in text.split(' ') {
        if let Some(h) = tok.strip_prefix("SERVERHASH=") {
            server_hash = hex::decode(h).ok();
        } else if let Some(n) = tok.strip_prefix("SERVERNONCE=") {
            server_nonce = hex::decode(n).ok();
        }
    }
    match (server_hash, server_nonce) {
        (Some(h), Some(n)) if h.len() == 32 => Ok((h, n)),
        _ => Err(TorCtlError::Malformed(text.clone())),
    }
}

/// Parse a QuotedString as the control protocol defines it, taking
/// only the `\\` and `\"` escapes into account.
fn unquote(s: &str) -> Result<String, TorCtlError> {
    let inner = s
        .strip_prefix('"')
        .ok_or_else(|| TorCtlError::Malformed(s.to_string()))?;
    let mut out = String::new();
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Ok(out);
        } else {
            out.push(c);
        }
    }
    Err(TorCtlError::Malformed(s.to_string()))
}
