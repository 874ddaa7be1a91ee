//! Session backends for the filtered control port.
//!
//! A control session either fronts a real, authenticated Tor control
//! connection, or fabricates plausible answers out of thin air when no
//! Tor is configured (so that a browser still gets its `about:tor` and
//! "New Identity" niceties).  The session logic upstairs doesn't care
//! which: it talks to the two halves a backend splits into.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info};

use orgate_ctlproto::reply;

use crate::config::Config;
use crate::control::ClientWriter;
use crate::torctl::{TorControl, TorCtlError};
use crate::upstream::BoxedStream;

/// The version string the stub backend claims to be.
const STUB_TOR_VERSION: &str = "0.2.7.1-alpha";

/// The reading half of a backend: everything needed to relay upstream
/// chatter to the client.
pub(crate) enum RelayHalf {
    /// A real upstream control connection's read side.
    Tor(BufReader<ReadHalf<BoxedStream>>),
    /// No upstream: there is never anything to relay.
    Stub,
}

/// The command half of a backend: everything the filter loop needs to
/// answer commands.
pub(crate) enum CommandHalf {
    /// A real upstream control connection's write side.
    Tor {
        /// Write half of the upstream connection.
        wr: WriteHalf<BoxedStream>,
        /// The upstream's version string, cached at init.
        version: String,
        /// Fake-acknowledge NEWNYM instead of forwarding it.
        suppress_newnym: bool,
    },
    /// No upstream: synthesize everything.
    Stub,
}

/// Initialize the backend this configuration calls for.
///
/// For a real Tor this opens the upstream control connection, caches
/// its PROTOCOLINFO version, and authenticates with an empty password;
/// the session must not start its pre-auth dialogue until this has
/// succeeded.
pub(crate) async fn init(cfg: &Config) -> Result<(RelayHalf, CommandHalf), TorCtlError> {
    if !cfg.tor.enable {
        return Ok((RelayHalf::Stub, CommandHalf::Stub));
    }

    let mut conn = TorControl::connect(cfg.tor.control_addr()).await?;
    let pi = conn.protocolinfo().await?;
    conn.authenticate(&pi).await?;
    let (rd, wr) = conn.into_split();

    Ok((
        RelayHalf::Tor(rd),
        CommandHalf::Tor {
            wr,
            version: pi.tor_version,
            suppress_newnym: cfg.tor.suppress_newnym,
        },
    ))
}

impl RelayHalf {
    /// Relay upstream chatter to the client, line by line, until one
    /// side fails.  The terminal error goes to `errs`.
    ///
    /// The stub variant never produces data and never finishes on its
    /// own; the session ends when the filter half does.
    pub(crate) async fn run(self, client: ClientWriter, errs: mpsc::Sender<anyhow::Error>) {
        let mut rd = match self {
            RelayHalf::Tor(rd) => rd,
            RelayHalf::Stub => {
                std::future::pending::<()>().await;
                return;
            }
        };

        loop {
            let mut line = Vec::new();
            match rd.read_until(b'\n', &mut line).await {
                Ok(0) => {
                    let _sent =
                        errs.try_send(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                    return;
                }
                Ok(_n) => {}
                Err(e) => {
                    let _sent = errs.try_send(e.into());
                    return;
                }
            }
            if let Err(e) = client.write_server(&line).await {
                let _sent = errs.try_send(e.into());
                return;
            }
        }
    }
}

impl CommandHalf {
    /// Return the Tor version string to use in spoofed replies.
    pub(crate) fn tor_version(&self) -> &str {
        match self {
            CommandHalf::Tor { version, .. } => version,
            CommandHalf::Stub => STUB_TOR_VERSION,
        }
    }

    /// Handle an allowed `SIGNAL NEWNYM` line.
    ///
    /// The real backend forwards the client's bytes verbatim, and the
    /// upstream's answer comes back through the relay half.  The stub
    /// (and a suppressed real backend) acknowledges locally so the
    /// client at least clears its own state.
    pub(crate) async fn on_newnym(
        &mut self,
        raw: &[u8],
        client: &ClientWriter,
    ) -> io::Result<()> {
        match self {
            CommandHalf::Tor {
                wr,
                suppress_newnym: false,
                ..
            } => {
                debug!("P->S: {}", String::from_utf8_lossy(raw).trim());
                wr.write_all(raw).await?;
                wr.flush().await
            }
            CommandHalf::Tor {
                suppress_newnym: true,
                ..
            } => {
                info!("Suppressing NEWNYM");
                client.write_proxy(reply::RESPONSE_OK.as_bytes()).await
            }
            CommandHalf::Stub => client.write_proxy(reply::RESPONSE_OK.as_bytes()).await,
        }
    }
}
