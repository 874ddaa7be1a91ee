//! Types to implement the server side of the SOCKS handshake.

use crate::bytes::{Reader, Writer};
use crate::msg::{SocksAddr, SocksAuth, SocksCmd, SocksRequest, SocksStatus};
use crate::{Error, Result};

use std::net::IpAddr;

/// Constant for Username/Password-style authentication (RFC 1929).
const USERNAME_PASSWORD: u8 = 0x02;
/// Constant for "no authentication".
const NO_AUTHENTICATION: u8 = 0x00;
/// Constant for "no acceptable methods".
const NO_ACCEPTABLE: u8 = 0xFF;

/// An ongoing SOCKS5 handshake.
///
/// To perform a handshake, call the [`SocksHandshake::handshake`]
/// method repeatedly with new inputs, until the resulting [`Action`]
/// has `finished` set to true.
#[derive(Clone, Debug)]
pub struct SocksHandshake {
    /// Current state of the handshake. Each completed message
    /// advances the state.
    state: State,
    /// Authentication that has been received (but not yet put in a
    /// SocksRequest object).
    auth: Option<SocksAuth>,
    /// Completed SOCKS request.
    request: Option<SocksRequest>,
}

/// Possible states for a SOCKS5 connection.
///
/// Each completed message advances the state.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
enum State {
    /// Starting state: no messages have been handled yet.
    Initial,
    /// We've negotiated Username/Password authentication, and are
    /// waiting for the client to send it.
    Username,
    /// We've finished the authentication (if any), and we're waiting
    /// for the actual request.
    Wait,
    /// Ending state: the client has sent all its messages.
    ///
    /// (Note that we still need to send a reply.)
    Done,
}

/// An action to take in response to a SOCKS handshake message.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Action {
    /// If nonzero, this many bytes should be drained from the
    /// client's inputs.
    pub drain: usize,
    /// If nonempty, this reply should be sent to the client.
    pub reply: Vec<u8>,
    /// If true, then this handshake is over, either successfully or not.
    pub finished: bool,
}

impl SocksHandshake {
    /// Construct a new SocksHandshake in its initial state.
    pub fn new() -> Self {
        SocksHandshake {
            state: State::Initial,
            auth: None,
            request: None,
        }
    }

    /// Try to advance a SocksHandshake, given some client input in
    /// `input`.
    ///
    /// If there isn't enough input, gives [`Error::Truncated`].  Other
    /// errors indicate a failure.
    ///
    /// On success, return an Action describing what to tell the client,
    /// and how much of its input to consume.
    pub fn handshake(&mut self, input: &[u8]) -> Result<Action> {
        if input.is_empty() {
            return Err(Error::Truncated);
        }
        match (self.state, input[0]) {
            (State::Initial, 5) => self.s5_initial(input),
            (State::Initial, v) => Err(Error::BadProtocol(v)),
            (State::Username, 1) => self.s5_username(input),
            (State::Username, _) => Err(Error::Syntax),
            (State::Wait, 5) => self.s5_request(input),
            (State::Wait, _) => Err(Error::Syntax),
            (State::Done, _) => Err(Error::AlreadyFinished),
        }
    }

    /// Initial handshake, to negotiate the authentication method.
    ///
    /// We prefer username/password if the client offers it, since the
    /// credentials double as isolation tokens; otherwise we take "no
    /// authentication".  If the client offers neither, we answer with
    /// the "no acceptable methods" marker and the handshake is over.
    fn s5_initial(&mut self, input: &[u8]) -> Result<Action> {
        let mut r = Reader::from_slice(input);
        let _version = r.take_u8()?;

        let nmethods = r.take_u8()?;
        let methods = r.take(nmethods as usize)?;

        let (next, reply) = if methods.contains(&USERNAME_PASSWORD) {
            (State::Username, [5, USERNAME_PASSWORD])
        } else if methods.contains(&NO_AUTHENTICATION) {
            self.auth = Some(SocksAuth::NoAuth);
            (State::Wait, [5, NO_AUTHENTICATION])
        } else {
            self.state = State::Done;
            return Ok(Action {
                drain: r.consumed(),
                reply: vec![5, NO_ACCEPTABLE],
                finished: true,
            });
        };

        self.state = next;
        Ok(Action {
            drain: r.consumed(),
            reply: reply.into(),
            finished: false,
        })
    }

    /// Second step for username/password authentication.
    ///
    /// We never actually check the credentials; we just remember them
    /// and report success.
    fn s5_username(&mut self, input: &[u8]) -> Result<Action> {
        let mut r = Reader::from_slice(input);

        let ver = r.take_u8()?;
        if ver != 1 {
            return Err(Error::NoSupport);
        }

        let ulen = r.take_u8()?;
        let username = r.take(ulen as usize)?;
        let plen = r.take_u8()?;
        let passwd = r.take(plen as usize)?;

        self.auth = Some(SocksAuth::Username(username.into(), passwd.into()));
        self.state = State::Wait;
        Ok(Action {
            drain: r.consumed(),
            reply: vec![1, 0],
            finished: false,
        })
    }

    /// Final step: receive the client's actual request.
    fn s5_request(&mut self, input: &[u8]) -> Result<Action> {
        let mut r = Reader::from_slice(input);

        let _version = r.take_u8()?;
        let cmd = r.take_u8()?.into();
        let _reserved = r.take_u8()?;
        let addr = take_addr(&mut r)?;
        let port = r.take_u16()?;

        let auth = self.auth.take().ok_or(Error::Internal)?;

        let request = SocksRequest::new(cmd, addr, port, auth)?;

        self.state = State::Done;
        self.request = Some(request);

        Ok(Action {
            drain: r.consumed(),
            reply: Vec::new(),
            finished: true,
        })
    }

    /// Return true if this handshake is finished.
    pub fn finished(&self) -> bool {
        self.state == State::Done
    }

    /// Consume this handshake's state; if it finished successfully,
    /// return a SocksRequest.
    pub fn into_request(self) -> Option<SocksRequest> {
        self.request
    }
}

impl Default for SocksHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a SOCKS5 address (ATYP + ADDR) from a reader.
pub(crate) fn take_addr(r: &mut Reader<'_>) -> Result<SocksAddr> {
    let atype = r.take_u8()?;
    match atype {
        1 => {
            let b = r.take(4)?;
            let ip4: std::net::Ipv4Addr = [b[0], b[1], b[2], b[3]].into();
            Ok(SocksAddr::Ip(ip4.into()))
        }
        3 => {
            let hlen = r.take_u8()?;
            let hostname = r.take(hlen as usize)?;
            let hostname = std::str::from_utf8(hostname)
                .map_err(|_| Error::Syntax)?
                .to_string();
            Ok(SocksAddr::Hostname(hostname))
        }
        4 => {
            let b = r.take(16)?;
            let mut ip = [0_u8; 16];
            ip.copy_from_slice(b);
            let ip6: std::net::Ipv6Addr = ip.into();
            Ok(SocksAddr::Ip(ip6.into()))
        }
        _ => Err(Error::Syntax),
    }
}

/// Encode a SOCKS5 address (ATYP + ADDR) onto a writer.
///
/// Gives [`Error::Syntax`] for a hostname too long to encode.
pub(crate) fn write_addr<W: Writer>(w: &mut W, addr: &SocksAddr) -> Result<()> {
    match addr {
        SocksAddr::Ip(IpAddr::V4(ip)) => {
            w.write_u8(1);
            w.write_all(&ip.octets());
        }
        SocksAddr::Ip(IpAddr::V6(ip)) => {
            w.write_u8(4);
            w.write_all(&ip.octets());
        }
        SocksAddr::Hostname(h) => {
            let hlen: u8 = h.len().try_into().map_err(|_| Error::Syntax)?;
            w.write_u8(3);
            w.write_u8(hlen);
            w.write_all(h.as_bytes());
        }
    }
    Ok(())
}

impl SocksRequest {
    /// Format a SOCKS5 reply to this request, indicating success or
    /// failure.
    ///
    /// A bound address (with its port) should be provided on success
    /// when one is known: the upstream proxy's bound address for a
    /// CONNECT, or the result of a RESOLVE/RESOLVE_PTR.
    pub fn reply(&self, status: SocksStatus, addr: Option<(&SocksAddr, u16)>) -> Vec<u8> {
        let mut w = Vec::new();
        w.write_u8(5);
        w.write_u8(status.into());
        w.write_u8(0); // reserved.
        match addr {
            Some((a, port)) => {
                // A hostname over 255 bytes can't get here: it would
                // have failed the request parse first.
                let _ignore = write_addr(&mut w, a);
                w.write_u16(port);
            }
            None => {
                let _ignore = write_addr(
                    &mut w,
                    &SocksAddr::Ip(std::net::Ipv4Addr::UNSPECIFIED.into()),
                );
                w.write_u16(0);
            }
        }
        w
    }
}

/// Format a SOCKS5 reply for a connection that never got as far as a
/// parsed request (for example, an unsupported command byte).
pub fn error_reply(status: SocksStatus) -> Vec<u8> {
    let mut w = Vec::new();
    w.write_u8(5);
    w.write_u8(status.into());
    w.write_u8(0); // reserved.
    let _ignore = write_addr(
        &mut w,
        &SocksAddr::Ip(std::net::Ipv4Addr::UNSPECIFIED.into()),
    );
    w.write_u16(0);
    w
}

#[cfg(test)]
mod test {
    use super::*;

    /// Run a complete no-auth handshake over `msgs`, returning the
    /// request.
    fn run(msgs: &[&[u8]]) -> (SocksHandshake, Vec<Vec<u8>>) {
        let mut hs = SocksHandshake::new();
        let mut replies = Vec::new();
        for (i, msg) in msgs.iter().enumerate() {
            let action = hs.handshake(msg).unwrap();
            assert_eq!(action.drain, msg.len());
            replies.push(action.reply);
            assert_eq!(action.finished, i == msgs.len() - 1);
        }
        (hs, replies)
    }

    #[test]
    fn noauth_connect() {
        let (hs, replies) = run(&[
            &[5, 1, 0],
            &[5, 1, 0, 1, 127, 0, 0, 1, 0x1f, 0x90],
        ]);
        assert_eq!(replies[0], vec![5, 0]);
        assert!(replies[1].is_empty());
        let req = hs.into_request().unwrap();
        assert_eq!(req.command(), SocksCmd::CONNECT);
        assert_eq!(req.target(), "127.0.0.1:8080");
        assert_eq!(req.auth(), &SocksAuth::NoAuth);
    }

    #[test]
    fn userpass_preferred() {
        // The client offers both methods; we take username/password so
        // the credentials can act as isolation tokens.
        let (hs, replies) = run(&[
            &[5, 2, 0, 2],
            &[1, 4, b'u', b's', b'e', b'r', 2, b'p', b'w'],
            &[5, 0xF0, 0, 3, 7, b'e', b'e', b'p', b'.', b'i', b'2', b'p', 0, 80],
        ]);
        assert_eq!(replies[0], vec![5, 2]);
        assert_eq!(replies[1], vec![1, 0]);
        let req = hs.into_request().unwrap();
        assert_eq!(req.command(), SocksCmd::RESOLVE);
        assert_eq!(req.addr(), &SocksAddr::Hostname("eep.i2p".to_string()));
        assert_eq!(
            req.auth(),
            &SocksAuth::Username(b"user".to_vec(), b"pw".to_vec())
        );
    }

    #[test]
    fn no_common_method() {
        let mut hs = SocksHandshake::new();
        let action = hs.handshake(&[5, 1, 3]).unwrap();
        assert_eq!(action.reply, vec![5, 0xFF]);
        assert!(action.finished);
        assert!(hs.into_request().is_none());
    }

    #[test]
    fn truncated() {
        let mut hs = SocksHandshake::new();
        assert_eq!(hs.handshake(&[]).unwrap_err(), Error::Truncated);
        assert_eq!(hs.handshake(&[5]).unwrap_err(), Error::Truncated);
        assert_eq!(hs.handshake(&[5, 2, 0]).unwrap_err(), Error::Truncated);
    }

    #[test]
    fn socks4_rejected() {
        let mut hs = SocksHandshake::new();
        assert_eq!(
            hs.handshake(&[4, 1, 0x1f, 0x90, 1, 2, 3, 4, 0]).unwrap_err(),
            Error::BadProtocol(4)
        );
    }

    #[test]
    fn bind_rejected() {
        let mut hs = SocksHandshake::new();
        let _greeting = hs.handshake(&[5, 1, 0]).unwrap();
        assert_eq!(
            hs.handshake(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80]).unwrap_err(),
            Error::BadCommand(2)
        );
    }

    #[test]
    fn replies() {
        let mut hs = SocksHandshake::new();
        let _greeting = hs.handshake(&[5, 1, 0]).unwrap();
        let _request = hs
            .handshake(&[5, 1, 0, 3, 4, b'e', b'.', b'i', b'p', 1, 0xbb])
            .unwrap();
        let req = hs.into_request().unwrap();

        assert_eq!(
            req.reply(SocksStatus::SUCCEEDED, None),
            vec![5, 0, 0, 1, 0, 0, 0, 0, 0, 0]
        );
        let bnd = SocksAddr::Ip(std::net::Ipv4Addr::new(10, 0, 0, 1).into());
        assert_eq!(
            req.reply(SocksStatus::SUCCEEDED, Some((&bnd, 443))),
            vec![5, 0, 0, 1, 10, 0, 0, 1, 1, 0xbb]
        );
        assert_eq!(
            error_reply(SocksStatus::COMMAND_NOT_SUPPORTED),
            vec![5, 7, 0, 1, 0, 0, 0, 0, 0, 0]
        );
    }
}
