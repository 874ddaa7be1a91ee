//! Implements the subset of SOCKS5 spoken between a privacy browser and
//! the orgate multiplexing proxy.
//!
//! SOCKS is an old and somewhat janky protocol for telling a TCP proxy
//! where to connect.  This crate implements version 5 only, along with
//! the RESOLVE/RESOLVE_PTR command extensions that Tor adds to it, since
//! that is the dialect Tor Browser uses when it talks to a SOCKS port.
//!
//! The crate is split into a server side and a client side:
//!
//!   * [`SocksHandshake`] is a stateful, I/O-free handshake engine: feed
//!     it bytes as they arrive from a client and it tells you what to
//!     drain, what to reply, and eventually yields a [`SocksRequest`].
//!   * [`client`] holds the encoders and decoders needed to replay a
//!     request at an upstream SOCKS server (the "redispatch" path).
//!
//! Username/password credentials are carried but never authenticated;
//! the proxy interprets them as stream-isolation tokens, exactly as Tor
//! does.
//!
//! For more information about SOCKS:
//!
//!   * SOCKS5 is specified in
//!     [RFC 1928](https://tools.ietf.org/html/rfc1928), and see also
//!     [RFC 1929](https://tools.ietf.org/html/rfc1929) for
//!     Username/Password authentication in SOCKS5.
//!   * See
//!     [socks-extensions.txt](https://spec.torproject.org/socks-extensions)
//!     for a description of Tor's extensions and restrictions on the
//!     SOCKS protocol.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::unseparated_literal_suffix)]

mod bytes;
pub mod client;
mod err;
mod handshake;
mod msg;

pub use err::Error;
pub use handshake::{error_reply, Action, SocksHandshake};
pub use msg::{SocksAddr, SocksAuth, SocksCmd, SocksRequest, SocksStatus};

/// A Result type for the orgate_socksproto crate.
pub type Result<T> = std::result::Result<T, Error>;
