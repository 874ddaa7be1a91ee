//! Uniform dialing interface over this proxy's upstreams.
//!
//! Every session ends up splicing the client against exactly one
//! upstream byte stream, but those streams are born in different ways:
//! a plain TCP connection, a Unix domain socket (for the Tor control
//! port), or a tunnel carved through an HTTP CONNECT proxy.  This
//! module hides the differences behind [`BoxedStream`].

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::CtlAddr;

/// Something we can shovel bytes into and out of.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Stream for T {}

/// An upstream (or client) connection with its origin erased.
pub(crate) type BoxedStream = Box<dyn Stream>;

/// Upper bound on an HTTP CONNECT response head.
const MAX_RESPONSE_HEAD: usize = 8192;

/// An error from establishing an HTTP CONNECT tunnel.
#[derive(Error, Debug)]
pub(crate) enum HttpConnectError {
    /// The underlying socket failed.
    #[error("I/O error during CONNECT: {0}")]
    Io(#[from] io::Error),
    /// The proxy refused the tunnel.
    #[error("proxy error: {0}")]
    Status(String),
    /// The proxy's response couldn't be understood.
    #[error("malformed CONNECT response")]
    Malformed,
}

/// Open a TCP connection to `addr`.
pub(crate) async fn dial_tcp(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Open a connection to a control-port style address.
pub(crate) async fn dial_control(addr: &CtlAddr) -> io::Result<BoxedStream> {
    match addr {
        CtlAddr::Tcp(a) => Ok(Box::new(TcpStream::connect(a).await?)),
        #[cfg(unix)]
        CtlAddr::Unix(p) => Ok(Box::new(tokio::net::UnixStream::connect(p).await?)),
        #[cfg(not(unix))]
        CtlAddr::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix control sockets are not supported on this platform",
        )),
    }
}

/// Open a tunnel to `target` ("host:port") through the HTTP CONNECT
/// proxy at `proxy`.
///
/// Returns the tunnel stream together with any bytes the proxy sent
/// past the end of its response head; the caller must hand those to
/// the client before splicing.
pub(crate) async fn dial_http_connect(
    proxy: SocketAddr,
    target: &str,
) -> Result<(TcpStream, Vec<u8>), HttpConnectError> {
    let mut stream = TcpStream::connect(proxy).await?;

    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n",
        target = target
    );
    stream.write_all(request.as_bytes()).await?;

    // Read until the blank line ending the response head.
    let mut head: Vec<u8> = Vec::new();
    let head_end = loop {
        if let Some(idx) = find_head_end(&head) {
            break idx;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(HttpConnectError::Malformed);
        }
        let mut buf = [0_u8; 512];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(HttpConnectError::Malformed);
        }
        head.extend_from_slice(&buf[..n]);
    };

    let status_line = head
        .split(|&b| b == b'\n')
        .next()
        .map(|l| String::from_utf8_lossy(l).trim().to_string())
        .unwrap_or_default();
    let code = status_line.split(' ').nth(1).unwrap_or("");
    if code != "200" {
        return Err(HttpConnectError::Status(status_line));
    }

    let residue = head[head_end..].to_vec();
    Ok((stream, residue))
}

/// Return the offset just past the first `\r\n\r\n` (or `\n\n`) in
/// `buf`, if one is present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'\n' if buf[i + 1..].starts_with(b"\r\n") => return Some(i + 3),
            b'\n' if buf[i + 1..].starts_with(b"\n") => return Some(i + 2),
            _ => {}
        }
        i += 1;
    }
    None
}
