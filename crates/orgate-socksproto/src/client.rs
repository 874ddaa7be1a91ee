//! Client-side messages for speaking to an upstream SOCKS5 server.
//!
//! The proxy redispatches some client requests to Tor's own SOCKS
//! port, replaying the original command with the original isolation
//! credentials.  These helpers encode the client side of that
//! exchange and decode the server's answers.  Like the handshake
//! engine, everything here is I/O free: decoders report
//! [`Error::Truncated`] until a full message is present, so the caller
//! can accumulate bytes from a socket and retry.

use crate::bytes::{Reader, Writer};
use crate::handshake::{take_addr, write_addr};
use crate::msg::{SocksAddr, SocksAuth, SocksRequest, SocksStatus};
use crate::{Error, Result};

/// A decoded SOCKS5 reply from an upstream server.
#[derive(Clone, Debug)]
pub struct SocksReply {
    /// The status code of the reply.
    status: SocksStatus,
    /// The bound address from the reply.
    addr: SocksAddr,
    /// The bound port from the reply.
    port: u16,
}

impl SocksReply {
    /// Return the status code of this reply.
    pub fn status(&self) -> SocksStatus {
        self.status
    }
    /// Return the bound address of this reply.
    pub fn addr(&self) -> &SocksAddr {
        &self.addr
    }
    /// Return the bound port of this reply.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Try to decode a reply from the start of `input`.
    ///
    /// On success, return the reply and the number of bytes consumed.
    pub fn decode(input: &[u8]) -> Result<(SocksReply, usize)> {
        let mut r = Reader::from_slice(input);
        let version = r.take_u8()?;
        if version != 5 {
            return Err(Error::Syntax);
        }
        let status = r.take_u8()?.into();
        let _reserved = r.take_u8()?;
        let addr = take_addr(&mut r)?;
        let port = r.take_u16()?;
        Ok((SocksReply { status, addr, port }, r.consumed()))
    }
}

/// Encode the initial method-negotiation message.
///
/// We offer username/password whenever the original client supplied
/// credentials, so that its isolation survives the extra hop;
/// otherwise we offer "no authentication" alone.
pub fn encode_greeting(auth: &SocksAuth) -> Vec<u8> {
    match auth {
        SocksAuth::NoAuth => vec![5, 1, 0x00],
        SocksAuth::Username(_, _) => vec![5, 1, 0x02],
    }
}

/// Try to decode the server's method choice from the start of `input`.
///
/// On success, return the chosen method and the number of bytes
/// consumed.  A "no acceptable methods" answer is [`Error::NoSupport`].
pub fn decode_method_choice(input: &[u8]) -> Result<(u8, usize)> {
    let mut r = Reader::from_slice(input);
    let version = r.take_u8()?;
    if version != 5 {
        return Err(Error::Syntax);
    }
    let method = r.take_u8()?;
    if method == 0xFF {
        return Err(Error::NoSupport);
    }
    Ok((method, r.consumed()))
}

/// Encode an RFC 1929 username/password message from `auth`.
///
/// Gives [`Error::Internal`] if `auth` holds no credentials, and
/// [`Error::Syntax`] if either field is too long for the wire format.
pub fn encode_username(auth: &SocksAuth) -> Result<Vec<u8>> {
    let (user, pass) = match auth {
        SocksAuth::Username(u, p) => (u, p),
        SocksAuth::NoAuth => return Err(Error::Internal),
    };
    let ulen: u8 = user.len().try_into().map_err(|_| Error::Syntax)?;
    let plen: u8 = pass.len().try_into().map_err(|_| Error::Syntax)?;
    let mut w = Vec::new();
    w.write_u8(1);
    w.write_u8(ulen);
    w.write_all(user);
    w.write_u8(plen);
    w.write_all(pass);
    Ok(w)
}

/// Try to decode the server's answer to a username/password message.
///
/// On success, return the number of bytes consumed.  A nonzero status
/// (the server rejected the credentials) is [`Error::NoSupport`].
pub fn decode_username_ack(input: &[u8]) -> Result<usize> {
    let mut r = Reader::from_slice(input);
    let _version = r.take_u8()?;
    let status = r.take_u8()?;
    if status != 0 {
        return Err(Error::NoSupport);
    }
    Ok(r.consumed())
}

impl SocksRequest {
    /// Encode this request in the SOCKS5 wire format, for replay at an
    /// upstream server.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Vec::new();
        w.write_u8(5);
        w.write_u8(self.command().into());
        w.write_u8(0); // reserved.
        // The hostname fit in a request once, so it fits again.
        let _ignore = write_addr(&mut w, self.addr());
        w.write_u16(self.port());
        w
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handshake::SocksHandshake;

    /// Parse a complete no-auth CONNECT request from raw bytes.
    fn parse_request(bytes: &[u8]) -> SocksRequest {
        let mut hs = SocksHandshake::new();
        let _greeting = hs.handshake(&[5, 1, 0]).unwrap();
        let action = hs.handshake(bytes).unwrap();
        assert!(action.finished);
        hs.into_request().unwrap()
    }

    #[test]
    fn roundtrip() {
        // A parsed request re-encodes to the original bytes.
        let msgs: [&[u8]; 3] = [
            &[5, 1, 0, 1, 1, 2, 3, 4, 1, 0xbb],
            &[5, 1, 0, 3, 8, b'e', b'x', b'.', b'o', b'n', b'i', b'o', b'n', 0, 80],
            &[
                5, 0xF1, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 53,
            ],
        ];
        for msg in msgs {
            assert_eq!(parse_request(msg).encode(), msg);
        }
    }

    #[test]
    fn greeting() {
        assert_eq!(encode_greeting(&SocksAuth::NoAuth), vec![5, 1, 0]);
        assert_eq!(
            encode_greeting(&SocksAuth::Username(b"a".to_vec(), Vec::new())),
            vec![5, 1, 2]
        );
    }

    #[test]
    fn method_choice() {
        assert_eq!(decode_method_choice(&[5, 0]).unwrap(), (0, 2));
        assert_eq!(decode_method_choice(&[5, 2, 9, 9]).unwrap(), (2, 2));
        assert_eq!(decode_method_choice(&[5]).unwrap_err(), Error::Truncated);
        assert_eq!(decode_method_choice(&[4, 0]).unwrap_err(), Error::Syntax);
        assert_eq!(
            decode_method_choice(&[5, 0xFF]).unwrap_err(),
            Error::NoSupport
        );
    }

    #[test]
    fn username() {
        let auth = SocksAuth::Username(b"user".to_vec(), b"pw".to_vec());
        assert_eq!(
            encode_username(&auth).unwrap(),
            vec![1, 4, b'u', b's', b'e', b'r', 2, b'p', b'w']
        );
        assert_eq!(
            encode_username(&SocksAuth::NoAuth).unwrap_err(),
            Error::Internal
        );
        assert_eq!(decode_username_ack(&[1, 0]).unwrap(), 2);
        assert_eq!(decode_username_ack(&[1, 1]).unwrap_err(), Error::NoSupport);
    }

    #[test]
    fn reply_decode() {
        let (reply, n) = SocksReply::decode(&[5, 0, 0, 1, 10, 0, 0, 1, 1, 0xbb]).unwrap();
        assert_eq!(n, 10);
        assert_eq!(reply.status(), SocksStatus::SUCCEEDED);
        assert_eq!(reply.addr().canonical(reply.port()), "10.0.0.1:443");

        // Hostname replies happen for RESOLVE_PTR redispatch.
        let (reply, n) =
            SocksReply::decode(&[5, 0, 0, 3, 4, b'h', b'o', b's', b't', 0, 53]).unwrap();
        assert_eq!(n, 11);
        assert_eq!(reply.addr(), &SocksAddr::Hostname("host".to_string()));

        assert_eq!(
            SocksReply::decode(&[5, 0, 0, 1, 10, 0]).unwrap_err(),
            Error::Truncated
        );
    }
}
