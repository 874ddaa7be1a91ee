//! The filtered control port: listener and per-connection sessions.
//!
//! Each accepted connection gets its own session and its own upstream
//! (or stub) backend.  A session starts in a strictly sequential
//! pre-auth dialogue; once the client "authenticates" it splits into
//! two concurrent halves: one relaying upstream chatter down to the
//! client, the other reading client commands and either answering them
//! locally, forwarding them, or refusing them.  Refusal is the
//! default.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use orgate_ctlproto::{cmd, reply, CmdLine};

use crate::backend::{self, CommandHalf};
use crate::config::Config;
use crate::upstream::BoxedStream;

/// Serialized writer for the client side of a control session.
///
/// Both session halves write to the client, so all writes go through
/// one mutex.  The pre-auth flag only picks the log prefix.
#[derive(Clone)]
pub(crate) struct ClientWriter {
    /// The client connection's write half.
    wr: Arc<Mutex<WriteHalf<BoxedStream>>>,
    /// Whether the session is still pre-auth (affects logging only).
    preauth: Arc<AtomicBool>,
}

impl ClientWriter {
    /// Wrap a client write half.
    fn new(wr: WriteHalf<BoxedStream>) -> Self {
        ClientWriter {
            wr: Arc::new(Mutex::new(wr)),
            preauth: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Write bytes that originate from the upstream server.
    pub(crate) async fn write_server(&self, b: &[u8]) -> io::Result<()> {
        self.write("S->C:", b).await
    }

    /// Write bytes that this proxy synthesized.
    pub(crate) async fn write_proxy(&self, b: &[u8]) -> io::Result<()> {
        let prefix = if self.preauth.load(Ordering::Relaxed) {
            "P->C [PreAuth]:"
        } else {
            "P->C:"
        };
        self.write(prefix, b).await
    }

    /// Mark the session as authenticated.
    fn end_preauth(&self) {
        self.preauth.store(false, Ordering::Relaxed);
    }

    /// Serialized write of `b`, flushed.
    async fn write(&self, prefix: &str, b: &[u8]) -> io::Result<()> {
        let mut wr = self.wr.lock().await;
        debug!("{} {}", prefix, String::from_utf8_lossy(b).trim_end());
        wr.write_all(b).await?;
        wr.flush().await
    }
}

/// Bind the filtered control listener and dispatch session workers
/// forever.
pub(crate) async fn run_control_listener(cfg: Arc<Config>) -> Result<()> {
    let ln = TcpListener::bind(cfg.filtered_addr)
        .await
        .with_context(|| format!("Failed to listen on the control address {}", cfg.filtered_addr))?;
    info!("Filtered control port listening on {}", cfg.filtered_addr);

    loop {
        match ln.accept().await {
            Ok((stream, peer)) => {
                let cfg = Arc::clone(&cfg);
                tokio::spawn(async move {
                    session_worker(cfg, stream, peer.to_string()).await;
                });
            }
            Err(e) => {
                warn!("Failed to accept control connection: {}", e);
            }
        }
    }
}

/// Run one control session to completion.
pub(crate) async fn session_worker<S>(cfg: Arc<Config>, stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
{
    info!("New control connection from: {}", peer);

    let stream: BoxedStream = Box::new(stream);
    let (rd, wr) = tokio::io::split(stream);
    let mut reader = BufReader::new(rd);
    let writer = ClientWriter::new(wr);

    // The backend must be up and authenticated before the client gets
    // a single reply out of us.
    let (relay, mut commands) = match backend::init(&cfg).await {
        Ok(b) => b,
        Err(e) => {
            warn!("Failed to initialize control backend: {}", e);
            return;
        }
    };

    if let Err(e) = process_preauth(&mut reader, &writer, &commands).await {
        info!("[PreAuth]: {}", e);
        return;
    }
    writer.end_preauth();

    // Two concurrent halves from here on.  Whichever finishes first
    // takes the whole session down with it: the loser is dropped, and
    // with it its endpoints.
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(2);
    tokio::select! {
        _r = relay.run(writer.clone(), err_tx.clone()) => {}
        _r = filter_app(&cfg, &mut reader, &writer, &mut commands, err_tx.clone()) => {}
    }

    match err_rx.try_recv() {
        Ok(e) => info!("Closed control connection from: {}: {}", peer, e),
        Err(_) => info!("Closed control connection from: {}", peer),
    }
}

/// Read one raw line from the client.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(buf)
}

/// Handle the pre-auth dialogue.  Returns Ok once the client has
/// "authenticated"; any error means the session is over.
async fn process_preauth<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    writer: &ClientWriter,
    commands: &CommandHalf,
) -> Result<()> {
    let mut sent_protocolinfo = false;
    loop {
        let raw = read_line(reader)
            .await
            .context("Failed reading client request")?;
        let line = CmdLine::parse(&raw);
        debug!("C [PreAuth]: {}", String::from_utf8_lossy(line.raw()).trim_end());

        match line.cmd() {
            cmd::PROTOCOLINFO => {
                if sent_protocolinfo {
                    writer
                        .write_proxy(reply::ERR_AUTHENTICATION_REQUIRED.as_bytes())
                        .await?;
                    bail!("Client already sent PROTOCOLINFO");
                }
                sent_protocolinfo = true;
                on_protocolinfo(&line, writer, commands).await?;
            }
            cmd::AUTHENTICATE => {
                // Whatever the arguments were: the methods we spoofed
                // make them meaningless anyway.
                writer.write_proxy(reply::RESPONSE_OK.as_bytes()).await?;
                return Ok(());
            }
            cmd::AUTHCHALLENGE => {
                // We should never see this, since PROTOCOLINFO lies
                // about the supported authentication types.
                writer
                    .write_proxy(reply::ERR_UNRECOGNIZED_COMMAND.as_bytes())
                    .await?;
                bail!("Client sent AUTHCHALLENGE, when not supported");
            }
            cmd::QUIT => bail!("Client requested connection close"),
            other => {
                writer
                    .write_proxy(reply::ERR_AUTHENTICATION_REQUIRED.as_bytes())
                    .await?;
                bail!("Invalid app command: '{}'", other);
            }
        }
    }
}

/// The client-to-upstream filter half of an authenticated session.
async fn filter_app<R: AsyncBufRead + Unpin>(
    cfg: &Config,
    reader: &mut R,
    writer: &ClientWriter,
    commands: &mut CommandHalf,
    errs: mpsc::Sender<anyhow::Error>,
) {
    loop {
        let raw = match read_line(reader).await {
            Ok(raw) => raw,
            Err(e) => {
                let _sent = errs.try_send(e.into());
                return;
            }
        };
        let line = CmdLine::parse(&raw);
        debug!("C: {}", String::from_utf8_lossy(line.raw()).trim_end());

        let handled: Result<()> = match line.cmd() {
            cmd::PROTOCOLINFO => on_protocolinfo(&line, writer, commands).await,
            cmd::GETINFO => on_getinfo(cfg, &line, writer).await,
            cmd::SIGNAL => on_signal(&line, writer, commands).await,
            other => {
                debug!("Filtering command: [{}]", other);
                writer
                    .write_proxy(reply::ERR_UNRECOGNIZED_COMMAND.as_bytes())
                    .await
                    .map_err(Into::into)
            }
        };
        if let Err(e) = handled {
            let _sent = errs.try_send(e);
            return;
        }
    }
}

/// Answer a PROTOCOLINFO command with the spoofed response.
///
/// A non-integer version argument gets a `513` and ends the session.
async fn on_protocolinfo(
    line: &CmdLine,
    writer: &ClientWriter,
    commands: &CommandHalf,
) -> Result<()> {
    if let Err(tok) = cmd::validate_protocolinfo_args(line) {
        let resp = reply::no_such_version(tok);
        writer.write_proxy(resp.as_bytes()).await?;
        bail!("PROTOCOLINFO with invalid version argument");
    }
    writer
        .write_proxy(reply::protocolinfo(commands.tor_version()).as_bytes())
        .await?;
    Ok(())
}

/// Answer a GETINFO command.  The only key we admit to knowing is the
/// SOCKS listener, and the answer is our own listener, spoofed.
async fn on_getinfo(cfg: &Config, line: &CmdLine, writer: &ClientWriter) -> Result<()> {
    let tokens = line.tokens();
    if tokens.len() != 2 {
        writer
            .write_proxy(reply::bad_arg_count(cmd::GETINFO, 2, tokens.len()).as_bytes())
            .await?;
        return Ok(());
    }
    if tokens[1] != reply::GETINFO_SOCKS_KEY {
        debug!("Filtering GETINFO: [{}]", tokens[1]);
        writer
            .write_proxy(reply::unrecognized_key(&tokens[1]).as_bytes())
            .await?;
        return Ok(());
    }
    debug!("Spoofing GETINFO: [{}]", tokens[1]);
    writer
        .write_proxy(reply::getinfo_socks(&cfg.socks_addr.to_string()).as_bytes())
        .await?;
    Ok(())
}

/// Handle a SIGNAL command.  NEWNYM goes to the backend; everything
/// else is refused.
async fn on_signal(line: &CmdLine, writer: &ClientWriter, commands: &mut CommandHalf) -> Result<()> {
    let tokens = line.tokens();
    if tokens.len() != 2 {
        writer
            .write_proxy(reply::bad_arg_count(cmd::SIGNAL, 2, tokens.len()).as_bytes())
            .await?;
        return Ok(());
    }
    if tokens[1] != reply::SIGNAL_NEWNYM {
        debug!("Filtering SIGNAL: [{}]", tokens[1]);
        writer
            .write_proxy(reply::unrecognized_signal(&tokens[1]).as_bytes())
            .await?;
        return Ok(());
    }
    commands.on_newnym(line.raw(), writer).await?;
    Ok(())
}
