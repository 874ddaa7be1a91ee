//! Rewrites the first HTTP request line into absolute-URI form.
//!
//! I2P's HTTP proxy wants the request target spelled out as a full URL
//! (`GET http://host/path HTTP/1.1`), but a browser that thinks it is
//! talking through SOCKS sends the usual relative form.  The proxy
//! could perfectly well use the Host header, but so it goes.  We read
//! the client's first line, graft the scheme and host on if they are
//! missing, and hand back the rebuilt bytes to be injected ahead of
//! the splice.

use std::io;

use http::Uri;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Anything over 2000 bytes or so is frowned upon because of stupid
/// legacy server limitations, so this is already generous.
const MAX_REQUEST_LEN: usize = 8192;

/// An error from rewriting the client's HTTP request.
#[derive(Error, Debug)]
pub(crate) enum RewriteError {
    /// The first line wasn't an HTTP request we could rebuild.
    #[error("failed to rewrite HTTP request")]
    RewriteFailed,
    /// The client connection failed while we were reading it.
    #[error("I/O error during HTTP rewrite: {0}")]
    Io(#[from] io::Error),
}

/// Read the client's HTTP request line (from `pushback` first, then
/// `client`) and rebuild it in absolute-URI form for `target`
/// (canonical `host:port`).
///
/// Returns the rebuilt line followed by whatever bytes were buffered
/// beyond it; the whole thing goes to the upstream before splicing.
pub(crate) async fn rewrite_http_request<R>(
    client: &mut R,
    mut pushback: Vec<u8>,
    target: &str,
) -> Result<Vec<u8>, RewriteError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(idx) = pushback.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&pushback[..idx]);
            let line = line.trim_end_matches('\r');
            let split: Vec<&str> = line.split(' ').collect();
            if split.len() != 3 {
                debug!("HTTP request line didn't split right");
                return Err(RewriteError::RewriteFailed);
            }
            if !split[2].starts_with("HTTP/") {
                debug!("HTTP request doesn't appear to be HTTP");
                return Err(RewriteError::RewriteFailed);
            }

            let uri: Uri = split[1].parse().map_err(|_| {
                debug!("HTTP request URI invalid: {}", split[1]);
                RewriteError::RewriteFailed
            })?;

            let absolute = if uri.scheme().is_some() && uri.authority().is_some() {
                uri.to_string()
            } else {
                let path = uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/");
                format!("http://{}{}", target, path)
            };

            let mut out = format!("{} {} {}\r\n", split[0], absolute, split[2]).into_bytes();
            out.extend_from_slice(&pushback[idx + 1..]);
            return Ok(out);
        }

        if pushback.len() > MAX_REQUEST_LEN {
            debug!("HTTP request greater than max len during rewrite");
            return Err(RewriteError::RewriteFailed);
        }

        let mut buf = [0_u8; 512];
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        pushback.extend_from_slice(&buf[..n]);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Run the rewriter over fixed input split between the pushback
    /// buffer and a reader.
    async fn rewrite(pushback: &[u8], stream: &[u8], target: &str) -> Result<Vec<u8>, RewriteError> {
        let mut rd = stream;
        rewrite_http_request(&mut rd, pushback.to_vec(), target).await
    }

    #[tokio::test]
    async fn relative_uri_gets_rebuilt() {
        let out = rewrite(b"GET /x HTTP/1.1\r\n", b"", "eep.i2p:80")
            .await
            .expect("rewrite");
        assert_eq!(out, b"GET http://eep.i2p:80/x HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn absolute_uri_is_untouched() {
        let input = b"GET http://eep.i2p:80/x HTTP/1.1\r\nHost: eep.i2p\r\n\r\n";
        let out = rewrite(input, b"", "eep.i2p:80").await.expect("rewrite");
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn remainder_is_preserved() {
        let out = rewrite(
            b"GET / HTTP/1.1\r\nHost: eep.i2p\r\nAccept: */*\r\n\r\n",
            b"",
            "eep.i2p:80",
        )
        .await
        .expect("rewrite");
        assert_eq!(
            out,
            &b"GET http://eep.i2p:80/ HTTP/1.1\r\nHost: eep.i2p\r\nAccept: */*\r\n\r\n"[..]
        );
    }

    #[tokio::test]
    async fn reads_from_stream_after_pushback() {
        let out = rewrite(b"GET /spl", b"it HTTP/1.0\r\nrest", "eep.i2p:80")
            .await
            .expect("rewrite");
        assert_eq!(out, b"GET http://eep.i2p:80/split HTTP/1.0\r\nrest");
    }

    #[tokio::test]
    async fn query_strings_survive() {
        let out = rewrite(b"GET /cgi?a=1&b=2 HTTP/1.1\r\n", b"", "eep.i2p:80")
            .await
            .expect("rewrite");
        assert_eq!(out, b"GET http://eep.i2p:80/cgi?a=1&b=2 HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn malformed_lines_fail() {
        assert!(matches!(
            rewrite(b"GET /x\r\n", b"", "eep.i2p:80").await,
            Err(RewriteError::RewriteFailed)
        ));
        assert!(matches!(
            rewrite(b"GET /x SMTP/1.1\r\n", b"", "eep.i2p:80").await,
            Err(RewriteError::RewriteFailed)
        ));
    }

    #[tokio::test]
    async fn oversize_line_fails() {
        let huge = vec![b'a'; MAX_REQUEST_LEN + 2];
        assert!(matches!(
            rewrite(&huge, b"", "eep.i2p:80").await,
            Err(RewriteError::RewriteFailed)
        ));
    }

    #[tokio::test]
    async fn eof_mid_line_is_io_error() {
        assert!(matches!(
            rewrite(b"GET / HT", b"", "eep.i2p:80").await,
            Err(RewriteError::Io(_))
        ));
    }
}
