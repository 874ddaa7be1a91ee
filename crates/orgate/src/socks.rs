//! The multiplexing SOCKS5 front end.
//!
//! Every accepted connection goes through the same stations: terminate
//! the SOCKS5 handshake, classify the target, pick the one upstream
//! allowed to carry it, open that upstream, reply, and splice bytes
//! until either side goes away.  Targets that no enabled upstream can
//! carry are refused with a conforming reply; refusal is the default.

use std::io;
use std::io::Result as IoResult;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use orgate_socksproto::client::{self, SocksReply};
use orgate_socksproto::{
    error_reply, Error as SocksError, SocksAddr, SocksAuth, SocksCmd, SocksHandshake,
    SocksRequest, SocksStatus,
};

use crate::config::Config;
use crate::rewrite::{rewrite_http_request, RewriteError};
use crate::upstream::{dial_http_connect, dial_tcp, BoxedStream, HttpConnectError};

/// Hidden-service suffix that always means Tor.
const SUFFIX_ONION: &str = ".onion";
/// Eepsite suffix that always means I2P.
const SUFFIX_I2P: &str = ".i2p";
/// The port on which I2P targets go through the HTTP proxy.
const HTTP_PORT: u16 = 80;

/// Which upstream a request is destined for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UpstreamKind {
    /// The Tor SOCKS port.
    Tor,
    /// The I2P HTTP or HTTPS CONNECT proxy.
    I2p,
    /// The I2P router console, reached directly.
    I2pConsole,
    /// The I2P router's local server, reached directly.
    I2pLocal,
    /// Everything else.
    Internet,
}

/// Why a request could not be dispatched.
enum DispatchError {
    /// Send this SOCKS reply and close.
    Reply(SocksStatus),
    /// Close without a reply; the session is beyond saving.
    Abort(anyhow::Error),
}

impl From<SocksStatus> for DispatchError {
    fn from(status: SocksStatus) -> Self {
        DispatchError::Reply(status)
    }
}

/// A successfully opened upstream, ready for splicing.
struct Dispatched {
    /// The upstream byte stream.
    upstream: BoxedStream,
    /// The bound address to report in the success reply, if known.
    bnd: Option<(SocksAddr, u16)>,
    /// Bytes to inject into the upstream before splicing.
    opt_data: Vec<u8>,
    /// Bytes to hand the client before splicing (CONNECT-proxy
    /// residue).
    client_residue: Vec<u8>,
}

/// Bind the SOCKS listener and dispatch session workers forever.
pub(crate) async fn run_socks_listener(cfg: Arc<Config>) -> Result<()> {
    let ln = TcpListener::bind(cfg.socks_addr)
        .await
        .with_context(|| format!("Failed to listen on the socks address {}", cfg.socks_addr))?;
    info!("SOCKS port listening on {}", cfg.socks_addr);

    loop {
        match ln.accept().await {
            Ok((stream, peer)) => {
                let cfg = Arc::clone(&cfg);
                tokio::spawn(async move {
                    handle_socks_conn(cfg, stream, peer.to_string()).await;
                });
            }
            Err(e) => {
                warn!("Failed to accept SOCKS connection: {}", e);
            }
        }
    }
}

/// Run one SOCKS session to completion.
pub(crate) async fn handle_socks_conn<S>(cfg: Arc<Config>, stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    info!("New SOCKS connection from: {}", peer);
    let (mut r, mut w) = tokio::io::split(stream);

    let (request, leftover) = match drive_handshake(&mut r, &mut w).await {
        Ok(Some(done)) => done,
        Ok(None) => return,
        Err(e) => {
            debug!("Failed SOCKS5 handshake: {}", e);
            return;
        }
    };
    info!(
        "Got a SOCKS request: {} {}",
        request.command(),
        request.target()
    );

    match request.command() {
        SocksCmd::CONNECT => {}
        SocksCmd::RESOLVE | SocksCmd::RESOLVE_PTR => {
            handle_resolve(&cfg, &request, &mut w).await;
            return;
        }
        other => {
            // Validated as part of the handshake; can't happen.
            warn!("BUG: unsupported SOCKS command: {}", other);
            let _sent = w
                .write_all(&request.reply(SocksStatus::COMMAND_NOT_SUPPORTED, None))
                .await;
            return;
        }
    }

    let dispatched = match dispatch(&cfg, &request, &mut r, leftover).await {
        Ok(d) => d,
        Err(DispatchError::Reply(status)) => {
            let _sent = w.write_all(&request.reply(status, None)).await;
            return;
        }
        Err(DispatchError::Abort(e)) => {
            debug!("SOCKS session aborted: {}", e);
            return;
        }
    };

    let reply = match &dispatched.bnd {
        Some((addr, port)) => request.reply(SocksStatus::SUCCEEDED, Some((addr, *port))),
        None => request.reply(SocksStatus::SUCCEEDED, None),
    };
    if w.write_all(&reply).await.is_err() {
        return;
    }
    if !dispatched.client_residue.is_empty() && w.write_all(&dispatched.client_residue).await.is_err()
    {
        return;
    }

    let (mut ur, mut uw) = tokio::io::split(dispatched.upstream);
    if !dispatched.opt_data.is_empty() {
        if let Err(e) = uw.write_all(&dispatched.opt_data).await {
            warn!("Failed writing optimistic data: {}", e);
            return;
        }
    }

    // Splice until either direction finishes; dropping the loser's
    // future closes its endpoints, which unblocks everything else.
    let spliced = tokio::select! {
        res = copy_interactive(&mut r, &mut uw) => res,
        res = copy_interactive(&mut ur, &mut w) => res,
    };
    match spliced {
        Ok(()) => info!("Closed SOCKS connection from: {}", peer),
        Err(e) => info!("Closed SOCKS connection from: {}: {}", peer, e),
    }
}

/// Drive the SOCKS5 handshake against the client.
///
/// Returns the parsed request plus any bytes the client sent past the
/// end of the handshake (optimistic data), or None if the session was
/// already answered and should simply close.
async fn drive_handshake<R, W>(r: &mut R, w: &mut W) -> Result<Option<(SocksRequest, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut handshake = SocksHandshake::new();
    let mut inbuf = [0_u8; 1024];
    let mut n_read = 0;
    loop {
        if n_read == inbuf.len() {
            bail!("SOCKS handshake message too large");
        }
        let n = r
            .read(&mut inbuf[n_read..])
            .await
            .context("Error while reading SOCKS handshake")?;
        if n == 0 {
            bail!("EOF during SOCKS handshake");
        }
        n_read += n;

        let action = match handshake.handshake(&inbuf[..n_read]) {
            Err(SocksError::Truncated) => continue,
            Err(SocksError::BadCommand(c)) => {
                warn!("Rejecting unsupported SOCKS command: {:#04x}", c);
                w.write_all(&error_reply(SocksStatus::COMMAND_NOT_SUPPORTED))
                    .await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
            Ok(action) => action,
        };

        if action.drain > 0 {
            inbuf.copy_within(action.drain..n_read, 0);
            n_read -= action.drain;
        }
        if !action.reply.is_empty() {
            w.write_all(&action.reply[..])
                .await
                .context("Error while writing reply to SOCKS handshake")?;
        }
        if action.finished {
            return Ok(handshake
                .into_request()
                .map(|req| (req, inbuf[..n_read].to_vec())));
        }
    }
}

/// Decide which upstream should carry `req`, applying the isolation
/// rules.
///
/// The classification comes from the target address alone; the
/// client's credentials can only veto it (for the router services) or
/// flip it (for obviously mismatched network suffixes).
pub(crate) fn classify(cfg: &Config, req: &SocksRequest) -> Result<UpstreamKind, SocksStatus> {
    let host = req.addr().to_string();
    let target = req.target();

    let mut kind = if host.ends_with(SUFFIX_ONION) {
        UpstreamKind::Tor
    } else if host.ends_with(SUFFIX_I2P) {
        UpstreamKind::I2p
    } else if cfg.i2p.is_management_addr(&target) {
        UpstreamKind::I2pConsole
    } else if cfg.i2p.is_local_addr(&target) {
        UpstreamKind::I2pLocal
    } else {
        UpstreamKind::Internet
    };

    if matches!(kind, UpstreamKind::I2pConsole | UpstreamKind::I2pLocal) {
        // The router services hosted on localhost must be protected
        // from arbitrary tabs, so require Tor Browser style
        // IsolateSOCKSAuth credentials naming the service host.
        let uname = match req.auth() {
            SocksAuth::Username(u, _) => String::from_utf8_lossy(u).to_string(),
            SocksAuth::NoAuth => {
                warn!("Rejecting I2P management/local server access, no isolation");
                return Err(SocksStatus::NOT_ALLOWED);
            }
            _ => unreachable!("SocksAuth has no other variants"),
        };
        if kind == UpstreamKind::I2pConsole && !cfg.i2p.is_management_host(&uname) {
            warn!("Rejecting I2P management access, invalid isolation");
            return Err(SocksStatus::NOT_ALLOWED);
        }
        if kind == UpstreamKind::I2pLocal && !cfg.i2p.is_local_host(&uname) {
            warn!("Rejecting I2P local server access, invalid isolation");
            return Err(SocksStatus::NOT_ALLOWED);
        }
    } else if let SocksAuth::Username(u, _) = req.auth() {
        // Detect clearly bogus isolation, and fix up the upstream to
        // avoid leaking that the other network was even considered.
        let uname = String::from_utf8_lossy(u);
        if kind == UpstreamKind::I2p && uname.ends_with(SUFFIX_ONION) {
            warn!("Tor HS isolation for I2P destination, forcing Tor dispatch");
            kind = UpstreamKind::Tor;
        } else if kind == UpstreamKind::Tor && uname.ends_with(SUFFIX_I2P) {
            warn!("I2P isolation for Tor HS destination, forcing I2P dispatch");
            kind = UpstreamKind::I2p;
        }
    }

    Ok(kind)
}

/// Classify `req` and open the upstream that should carry it.
async fn dispatch<R>(
    cfg: &Config,
    req: &SocksRequest,
    client_rd: &mut R,
    leftover: Vec<u8>,
) -> Result<Dispatched, DispatchError>
where
    R: AsyncRead + Unpin,
{
    let target = req.target();
    let kind = classify(cfg, req)?;

    match kind {
        UpstreamKind::Tor => {
            if !cfg.tor.enable {
                warn!("Rejecting Tor HS address: '{}' (Tor not enabled)", target);
                return Err(SocksStatus::NETWORK_UNREACHABLE.into());
            }
            info!("Dispatching Tor HS address: '{}'", target);
            let (stream, bnd) = redispatch_tor(cfg, req).await?;
            Ok(Dispatched {
                upstream: Box::new(stream),
                bnd,
                opt_data: leftover,
                client_residue: Vec::new(),
            })
        }
        UpstreamKind::I2pConsole | UpstreamKind::I2pLocal => {
            let (enabled, addr, what) = if kind == UpstreamKind::I2pConsole {
                (
                    cfg.i2p.enable && cfg.i2p.enable_management,
                    cfg.i2p.enable.then(|| cfg.i2p.management_addr()),
                    "management",
                )
            } else {
                (
                    cfg.i2p.enable && cfg.i2p.enable_local,
                    cfg.i2p.enable.then(|| cfg.i2p.local_addr()),
                    "local server",
                )
            };
            let addr = match (enabled, addr) {
                (true, Some(addr)) => addr,
                _ => {
                    warn!(
                        "Rejecting I2P address: '{}' (I2P {} access not enabled)",
                        target, what
                    );
                    return Err(SocksStatus::NOT_ALLOWED.into());
                }
            };
            info!("Dispatching I2P address: '{}' (Direct)", target);
            let stream = dial_tcp(addr)
                .await
                .map_err(|e| DispatchError::Reply(SocksStatus::from_io_error(&e)))?;
            Ok(Dispatched {
                upstream: Box::new(stream),
                bnd: None,
                opt_data: leftover,
                client_residue: Vec::new(),
            })
        }
        UpstreamKind::I2p => {
            if !cfg.i2p.enable {
                warn!("Rejecting I2P address: '{}' (I2P not enabled)", target);
                return Err(SocksStatus::NETWORK_UNREACHABLE.into());
            }
            if req.port() == HTTP_PORT {
                info!("Dispatching I2P address: '{}' (HTTP)", target);
                let mut stream = dial_tcp(cfg.i2p.http_addr())
                    .await
                    .map_err(|e| DispatchError::Reply(SocksStatus::from_io_error(&e)))?;
                // The proxy wants an absolute URI on the request line;
                // rebuild the client's first line before anything is
                // spliced.
                let opt_data = match rewrite_http_request(client_rd, leftover, &target).await {
                    Ok(data) => data,
                    Err(e @ RewriteError::RewriteFailed) => {
                        let _shutdown = stream.shutdown().await;
                        return Err(DispatchError::Abort(e.into()));
                    }
                    Err(RewriteError::Io(e)) => {
                        let _shutdown = stream.shutdown().await;
                        return Err(DispatchError::Abort(e.into()));
                    }
                };
                return Ok(Dispatched {
                    upstream: Box::new(stream),
                    bnd: None,
                    opt_data,
                    client_residue: Vec::new(),
                });
            }

            // Not going to port 80, so fall back to the HTTPS CONNECT
            // proxy, which will carry any TCP stream.
            info!("Dispatching I2P address: '{}' (HTTPS CONNECT)", target);
            match dial_http_connect(cfg.i2p.https_addr(), &target).await {
                Ok((stream, residue)) => Ok(Dispatched {
                    upstream: Box::new(stream),
                    bnd: None,
                    opt_data: leftover,
                    client_residue: residue,
                }),
                Err(HttpConnectError::Io(e)) => {
                    Err(DispatchError::Reply(SocksStatus::from_io_error(&e)))
                }
                Err(e) => {
                    warn!("HTTPS CONNECT to '{}' failed: {}", target, e);
                    Err(SocksStatus::GENERAL_FAILURE.into())
                }
            }
        }
        UpstreamKind::Internet => {
            if cfg.tor.enable {
                info!("Dispatching clearnet address: '{}' (Tor)", target);
                let (stream, bnd) = redispatch_tor(cfg, req).await?;
                return Ok(Dispatched {
                    upstream: Box::new(stream),
                    bnd,
                    opt_data: leftover,
                    client_residue: Vec::new(),
                });
            }
            if cfg.unsafe_allow_direct {
                info!("Dispatching clearnet address: '{}' (Direct)", target);
                let stream = dial_direct(req)
                    .await
                    .map_err(|e| DispatchError::Reply(SocksStatus::from_io_error(&e)))?;
                return Ok(Dispatched {
                    upstream: Box::new(stream),
                    bnd: None,
                    opt_data: leftover,
                    client_residue: Vec::new(),
                });
            }
            warn!(
                "Unable to dispatch address: '{}' (No suitable upstream)",
                target
            );
            Err(SocksStatus::NOT_ALLOWED.into())
        }
    }
}

/// Open a direct TCP connection to the request's target.
async fn dial_direct(req: &SocksRequest) -> io::Result<TcpStream> {
    match req.addr() {
        SocksAddr::Ip(ip) => TcpStream::connect(SocketAddr::new(*ip, req.port())).await,
        SocksAddr::Hostname(h) => TcpStream::connect((h.as_str(), req.port())).await,
        _ => unreachable!("SocksAddr has no other variants"),
    }
}

/// Replay `req` at the Tor SOCKS port, preserving its isolation
/// credentials.
///
/// Returns the upstream connection and the bound address from its
/// reply.  A non-success reply from the upstream is passed through to
/// the client verbatim.
async fn redispatch_tor(
    cfg: &Config,
    req: &SocksRequest,
) -> Result<(TcpStream, Option<(SocksAddr, u16)>), DispatchError> {
    let mut stream = dial_tcp(cfg.tor.socks_addr())
        .await
        .map_err(|e| DispatchError::Reply(SocksStatus::from_io_error(&e)))?;

    let fail = |e: io::Error| DispatchError::Reply(SocksStatus::from_io_error(&e));

    stream
        .write_all(&client::encode_greeting(req.auth()))
        .await
        .map_err(fail)?;
    let mut choice = [0_u8; 2];
    stream.read_exact(&mut choice).await.map_err(fail)?;
    let (method, _n) = client::decode_method_choice(&choice)
        .map_err(|_| DispatchError::Reply(SocksStatus::GENERAL_FAILURE))?;

    match (method, req.auth()) {
        (0x00, _) => {}
        (0x02, auth @ SocksAuth::Username(_, _)) => {
            let msg = client::encode_username(auth)
                .map_err(|_| DispatchError::Reply(SocksStatus::GENERAL_FAILURE))?;
            stream.write_all(&msg).await.map_err(fail)?;
            let mut ack = [0_u8; 2];
            stream.read_exact(&mut ack).await.map_err(fail)?;
            client::decode_username_ack(&ack)
                .map_err(|_| DispatchError::Reply(SocksStatus::GENERAL_FAILURE))?;
        }
        (_, _) => {
            warn!("Upstream SOCKS picked a method we didn't offer");
            return Err(SocksStatus::GENERAL_FAILURE.into());
        }
    }

    stream.write_all(&req.encode()).await.map_err(fail)?;

    let mut buf = Vec::new();
    let reply = loop {
        match SocksReply::decode(&buf) {
            Ok((reply, _n)) => break reply,
            Err(SocksError::Truncated) => {}
            Err(_) => return Err(SocksStatus::GENERAL_FAILURE.into()),
        }
        let mut tmp = [0_u8; 300];
        let n = stream.read(&mut tmp).await.map_err(fail)?;
        if n == 0 {
            return Err(SocksStatus::GENERAL_FAILURE.into());
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    if reply.status() != SocksStatus::SUCCEEDED {
        // Hand the upstream's verdict to the client unchanged.
        return Err(reply.status().into());
    }
    Ok((stream, Some((reply.addr().clone(), reply.port()))))
}

/// Answer a RESOLVE/RESOLVE_PTR request.
async fn handle_resolve<W>(cfg: &Config, req: &SocksRequest, w: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let resolved: Result<(SocksAddr, u16), SocksStatus> = if cfg.tor.enable {
        info!("Dispatching resolve: '{}' (Tor, DNS)", req.target());
        match redispatch_tor(cfg, req).await {
            Ok((_stream, Some(bnd))) => Ok(bnd),
            Ok((_stream, None)) => Err(SocksStatus::GENERAL_FAILURE),
            Err(DispatchError::Reply(status)) => Err(status),
            Err(DispatchError::Abort(_)) => Err(SocksStatus::GENERAL_FAILURE),
        }
    } else if cfg.unsafe_allow_direct {
        info!("Dispatching resolve: '{}' (Direct, DNS)", req.target());
        resolve_direct(req).await
    } else {
        warn!("Rejecting RESOLVE/RESOLVE_PTR request (Tor not enabled)");
        Err(SocksStatus::COMMAND_NOT_SUPPORTED)
    };

    let reply = match &resolved {
        Ok((addr, port)) => req.reply(SocksStatus::SUCCEEDED, Some((addr, *port))),
        Err(status) => req.reply(*status, None),
    };
    let _sent = w.write_all(&reply).await;
}

/// Perform a forward or reverse lookup with the system resolver.
async fn resolve_direct(req: &SocksRequest) -> Result<(SocksAddr, u16), SocksStatus> {
    use hickory_resolver::TokioAsyncResolver;

    let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
        warn!("Failed to initialize resolver: {}", e);
        SocksStatus::GENERAL_FAILURE
    })?;

    match req.command() {
        SocksCmd::RESOLVE => {
            let host = req.addr().to_string();
            let ips = resolver.lookup_ip(host.as_str()).await.map_err(|e| {
                warn!("DNS lookup for '{}' failed: {}", host, e);
                SocksStatus::GENERAL_FAILURE
            })?;
            // Downstream consumers flip out over non-IPv4 answers, so
            // return the first IPv4 result.
            let ip = ips
                .iter()
                .find(IpAddr::is_ipv4)
                .ok_or(SocksStatus::GENERAL_FAILURE)?;
            Ok((SocksAddr::Ip(ip), req.port()))
        }
        SocksCmd::RESOLVE_PTR => {
            let ip: IpAddr = req
                .addr()
                .to_string()
                .parse()
                .map_err(|_| SocksStatus::GENERAL_FAILURE)?;
            let names = resolver.reverse_lookup(ip).await.map_err(|e| {
                warn!("DNS PTR lookup for '{}' failed: {}", ip, e);
                SocksStatus::GENERAL_FAILURE
            })?;
            let name = names
                .iter()
                .next()
                .ok_or(SocksStatus::GENERAL_FAILURE)?
                .to_string();
            let name = name.trim_end_matches('.').to_string();
            Ok((SocksAddr::Hostname(name), req.port()))
        }
        _ => Err(SocksStatus::COMMAND_NOT_SUPPORTED),
    }
}

/// Copy all the data from `reader` into `writer` until we encounter an
/// EOF or an error.
///
/// Unlike a plain copy loop, this function is meant for interactive
/// streams, where the reader might pause for a while but whatever has
/// arrived should be pushed onward immediately.  It minimizes flushes
/// by only flushing the writer when the reader has nothing buffered.
async fn copy_interactive<R, W>(mut reader: R, mut writer: W) -> IoResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use futures::{poll, task::Poll};

    let mut buf = [0_u8; 1024];

    let loop_result: IoResult<()> = loop {
        let read_future = reader.read(&mut buf[..]);
        tokio::pin!(read_future);
        match poll!(read_future.as_mut()) {
            Poll::Ready(Err(e)) => break Err(e),
            Poll::Ready(Ok(0)) => break Ok(()), // EOF
            Poll::Ready(Ok(n)) => {
                writer.write_all(&buf[..n]).await?;
                continue;
            }
            Poll::Pending => writer.flush().await?,
        }

        // The read future is pending, so we should wait on it.
        match read_future.await {
            Err(e) => break Err(e),
            Ok(0) => break Ok(()),
            Ok(n) => writer.write_all(&buf[..n]).await?,
        }
    };

    // If the reader closed cleanly, close the write side properly;
    // otherwise just get anything lingering onto the wire.
    let flush_result = if loop_result.is_ok() {
        writer.shutdown().await
    } else {
        writer.flush().await
    };

    loop_result.or(flush_result)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::testing;
    use tokio::io::DuplexStream;

    /// Build a CONNECT request by hand.
    fn connect_req(host: &str, port: u16, auth: SocksAuth) -> SocksRequest {
        let mut hs = SocksHandshake::new();
        let methods = match &auth {
            SocksAuth::NoAuth => vec![5, 1, 0],
            SocksAuth::Username(_, _) => vec![5, 1, 2],
            _ => unreachable!("SocksAuth has no other variants"),
        };
        let _greeting = hs.handshake(&methods).unwrap();
        if let SocksAuth::Username(u, p) = &auth {
            let mut msg = vec![1, u.len() as u8];
            msg.extend_from_slice(u);
            msg.push(p.len() as u8);
            msg.extend_from_slice(p);
            let _auth = hs.handshake(&msg).unwrap();
        }
        let mut msg = vec![5, 1, 0, 3, host.len() as u8];
        msg.extend_from_slice(host.as_bytes());
        msg.extend_from_slice(&port.to_be_bytes());
        let _request = hs.handshake(&msg).unwrap();
        hs.into_request().unwrap()
    }

    /// Auth helper.
    fn auth(user: &str) -> SocksAuth {
        SocksAuth::Username(user.as_bytes().to_vec(), b"passwd".to_vec())
    }

    #[test]
    fn classify_by_suffix() {
        let cfg = testing::with_i2p();
        let req = connect_req("example.onion", 443, SocksAuth::NoAuth);
        assert_eq!(classify(&cfg, &req), Ok(UpstreamKind::Tor));

        let req = connect_req("eep.i2p", 80, SocksAuth::NoAuth);
        assert_eq!(classify(&cfg, &req), Ok(UpstreamKind::I2p));

        let req = connect_req("www.example.com", 443, SocksAuth::NoAuth);
        assert_eq!(classify(&cfg, &req), Ok(UpstreamKind::Internet));
    }

    #[test]
    fn classify_router_services() {
        let cfg = testing::with_i2p();

        // No isolation: refused outright.
        let req = connect_req("127.0.0.1", 7657, SocksAuth::NoAuth);
        assert_eq!(classify(&cfg, &req), Err(SocksStatus::NOT_ALLOWED));

        // Isolation naming some other host: refused.
        let req = connect_req("127.0.0.1", 7657, auth("example.com"));
        assert_eq!(classify(&cfg, &req), Err(SocksStatus::NOT_ALLOWED));

        // Isolation naming the console host: in.
        let req = connect_req("127.0.0.1", 7657, auth("127.0.0.1"));
        assert_eq!(classify(&cfg, &req), Ok(UpstreamKind::I2pConsole));

        let req = connect_req("127.0.0.1", 7658, auth("127.0.0.1"));
        assert_eq!(classify(&cfg, &req), Ok(UpstreamKind::I2pLocal));

        // With I2P disabled the console address is just another
        // clearnet target.
        let req = connect_req("127.0.0.1", 7657, SocksAuth::NoAuth);
        assert_eq!(
            classify(&testing::minimal(), &req),
            Ok(UpstreamKind::Internet)
        );
    }

    #[test]
    fn classify_isolation_overrides() {
        let cfg = testing::with_i2p();

        // Tor-style isolation on an eepsite: force Tor.
        let req = connect_req("eep.i2p", 443, auth("x.onion"));
        assert_eq!(classify(&cfg, &req), Ok(UpstreamKind::Tor));

        // I2P-style isolation on a hidden service: force I2P.
        let req = connect_req("x.onion", 443, auth("eep.i2p"));
        assert_eq!(classify(&cfg, &req), Ok(UpstreamKind::I2p));

        // Matching isolation changes nothing.
        let req = connect_req("x.onion", 443, auth("x.onion"));
        assert_eq!(classify(&cfg, &req), Ok(UpstreamKind::Tor));
    }

    /// Start a session over an in-memory stream.
    fn start_session(cfg: Config) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(handle_socks_conn(
            Arc::new(cfg),
            server,
            "test".to_string(),
        ));
        client
    }

    /// Complete a no-auth SOCKS5 greeting on `client`.
    async fn greet(client: &mut DuplexStream) {
        client.write_all(&[5, 1, 0]).await.expect("write");
        let mut buf = [0_u8; 2];
        client.read_exact(&mut buf).await.expect("read");
        assert_eq!(buf, [5, 0]);
    }

    /// Send a domain-target request and return the reply status byte.
    async fn request_status(client: &mut DuplexStream, host: &str, port: u16) -> u8 {
        let mut msg = vec![5, 1, 0, 3, host.len() as u8];
        msg.extend_from_slice(host.as_bytes());
        msg.extend_from_slice(&port.to_be_bytes());
        client.write_all(&msg).await.expect("write");
        let mut reply = [0_u8; 10];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(reply[0], 5);
        reply[1]
    }

    #[tokio::test]
    async fn console_without_isolation_is_refused() {
        let mut client = start_session(testing::with_i2p());
        greet(&mut client).await;
        let status = request_status(&mut client, "127.0.0.1", 7657).await;
        assert_eq!(status, 0x02);
    }

    #[tokio::test]
    async fn clearnet_with_only_i2p_is_refused() {
        let mut client = start_session(testing::with_i2p());
        greet(&mut client).await;
        let status = request_status(&mut client, "1.2.3.4", 443).await;
        assert_eq!(status, 0x02);
    }

    #[tokio::test]
    async fn onion_with_tor_disabled_is_unreachable() {
        let mut client = start_session(testing::with_i2p());
        greet(&mut client).await;
        let status = request_status(&mut client, "example.onion", 443).await;
        assert_eq!(status, 0x03);
    }

    #[tokio::test]
    async fn resolve_with_nothing_enabled_is_unsupported() {
        let mut client = start_session(testing::with_i2p());
        greet(&mut client).await;
        let mut msg = vec![5, 0xF0, 0, 3, 11];
        msg.extend_from_slice(b"example.com");
        msg.extend_from_slice(&53_u16.to_be_bytes());
        client.write_all(&msg).await.expect("write");
        let mut reply = [0_u8; 10];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(reply[1], 0x07);
    }

    #[tokio::test]
    async fn bind_command_gets_a_conforming_reply() {
        let mut client = start_session(testing::with_i2p());
        greet(&mut client).await;
        let msg = [5, 2, 0, 1, 127, 0, 0, 1, 0, 80];
        client.write_all(&msg).await.expect("write");
        let mut reply = [0_u8; 10];
        client.read_exact(&mut reply).await.expect("read");
        assert_eq!(reply[1], 0x07);
    }

    /// Spawn a fake upstream SOCKS server that accepts one no-auth or
    /// user/pass CONNECT, replies with success, then echoes bytes.
    /// Returns its address and a handle yielding the raw request
    /// bytes it saw.
    async fn spawn_fake_socks() -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.expect("accept");
            let mut greeting = [0_u8; 3];
            s.read_exact(&mut greeting).await.expect("greeting");
            let method = greeting[2];
            s.write_all(&[5, method]).await.expect("choice");
            if method == 2 {
                let mut hdr = [0_u8; 2];
                s.read_exact(&mut hdr).await.expect("auth hdr");
                let mut user = vec![0_u8; hdr[1] as usize + 1];
                s.read_exact(&mut user).await.expect("auth user");
                let plen = user[user.len() - 1] as usize;
                let mut pass = vec![0_u8; plen];
                s.read_exact(&mut pass).await.expect("auth pass");
                s.write_all(&[1, 0]).await.expect("auth ok");
            }
            // Read the request: header + domain + port.
            let mut hdr = [0_u8; 5];
            s.read_exact(&mut hdr).await.expect("req hdr");
            assert_eq!(&hdr[..4], &[5, 1, 0, 3]);
            let mut rest = vec![0_u8; hdr[4] as usize + 2];
            s.read_exact(&mut rest).await.expect("req rest");
            let mut seen = hdr.to_vec();
            seen.extend_from_slice(&rest);
            s.write_all(&[5, 0, 0, 1, 127, 0, 0, 1, 0x23, 0x28])
                .await
                .expect("reply");
            // Echo one chunk back, then wind down.
            let mut buf = [0_u8; 64];
            let n = s.read(&mut buf).await.expect("data");
            s.write_all(&buf[..n]).await.expect("echo");
            seen
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn onion_connect_redispatches_and_splices() {
        let (addr, upstream) = spawn_fake_socks().await;
        let mut cfg = testing::minimal();
        cfg.tor.enable = true;
        cfg.tor.socks_addr = Some(addr);
        cfg.tor.control_addr = Some(crate::config::CtlAddr::Tcp(addr));

        let mut client = start_session(cfg);
        greet(&mut client).await;

        let host = "exampleonionaddress.onion";
        let mut msg = vec![5, 1, 0, 3, host.len() as u8];
        msg.extend_from_slice(host.as_bytes());
        msg.extend_from_slice(&443_u16.to_be_bytes());
        client.write_all(&msg).await.expect("write");

        let mut reply = [0_u8; 10];
        client.read_exact(&mut reply).await.expect("reply");
        assert_eq!(reply[1], 0x00);
        // The bound address from the upstream is passed through.
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 9000);

        // Bytes splice through the tunnel and back.
        client.write_all(b"ping").await.expect("write");
        let mut echoed = [0_u8; 4];
        client.read_exact(&mut echoed).await.expect("read");
        assert_eq!(&echoed, b"ping");

        drop(client);
        let seen = upstream.await.expect("join");
        // The CONNECT the upstream saw is the client's, byte for byte.
        assert_eq!(&seen[..4], &[5, 1, 0, 3]);
        assert_eq!(seen[4] as usize, host.len());
        assert_eq!(&seen[5..5 + host.len()], host.as_bytes());
    }

    #[tokio::test]
    async fn isolation_credentials_survive_redispatch() {
        let (addr, upstream) = spawn_fake_socks().await;
        let mut cfg = testing::minimal();
        cfg.tor.enable = true;
        cfg.tor.socks_addr = Some(addr);
        cfg.tor.control_addr = Some(crate::config::CtlAddr::Tcp(addr));

        let mut client = start_session(cfg);
        client.write_all(&[5, 1, 2]).await.expect("write");
        let mut buf = [0_u8; 2];
        client.read_exact(&mut buf).await.expect("read");
        assert_eq!(buf, [5, 2]);
        client
            .write_all(&[1, 3, b'a', b'b', b'c', 2, b'x', b'y'])
            .await
            .expect("write");
        client.read_exact(&mut buf).await.expect("read");
        assert_eq!(buf, [1, 0]);

        let status = request_status(&mut client, "example.onion", 443).await;
        assert_eq!(status, 0x00);

        drop(client);
        let _seen = upstream.await.expect("join");
    }

    /// Spawn a fake I2P HTTP proxy that records what it receives.
    async fn spawn_fake_http_proxy() -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = ln.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.expect("accept");
            let mut seen = Vec::new();
            let mut buf = [0_u8; 1024];
            let n = s.read(&mut buf).await.expect("read");
            seen.extend_from_slice(&buf[..n]);
            s.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.expect("write");
            seen
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn i2p_port_80_goes_through_the_rewriter() {
        let (addr, upstream) = spawn_fake_http_proxy().await;
        let mut cfg = testing::with_i2p();
        cfg.i2p.http_addr = Some(addr);

        let mut client = start_session(cfg);
        greet(&mut client).await;

        let host = "eep.i2p";
        let mut msg = vec![5, 1, 0, 3, host.len() as u8];
        msg.extend_from_slice(host.as_bytes());
        msg.extend_from_slice(&80_u16.to_be_bytes());
        // Optimistic data: the HTTP request rides along immediately.
        msg.extend_from_slice(b"GET /x HTTP/1.1\r\n\r\n");
        client.write_all(&msg).await.expect("write");

        let mut reply = [0_u8; 10];
        client.read_exact(&mut reply).await.expect("reply");
        assert_eq!(reply[1], 0x00);

        let mut proxied = [0_u8; 19];
        client.read_exact(&mut proxied).await.expect("read");
        assert_eq!(&proxied, b"HTTP/1.1 200 OK\r\n\r\n");

        drop(client);
        let seen = upstream.await.expect("join");
        assert_eq!(&seen, b"GET http://eep.i2p:80/x HTTP/1.1\r\n\r\n");
    }
}
