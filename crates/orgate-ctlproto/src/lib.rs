//! The text layer of orgate's filtered Tor control port.
//!
//! The Tor control protocol is line oriented: commands are
//! CRLF-terminated lines whose first (case-insensitive) token names the
//! command, and replies are lines carrying a three-digit status code.
//! This crate implements just enough of that wire format for a
//! filtering proxy that sits between a client and a real Tor: parsing
//! client command lines into tokens, and synthesizing the small set of
//! replies the filter is allowed to make up on Tor's behalf.
//!
//! Notably, the [`reply::protocolinfo`] response deliberately
//! advertises only the NULL and HASHEDPASSWORD authentication methods,
//! whatever the upstream Tor supports, so that a well-behaved client
//! authenticates with the cheapest method rather than demanding a
//! cookie this proxy could never hand over.
//!
//! Everything here is pure string manipulation; the I/O and the
//! session state machine live in the daemon.
//!
//! See
//! [control-spec.txt](https://spec.torproject.org/control-spec)
//! for the protocol this is a deliberately tiny subset of.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![warn(clippy::manual_ok_or)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::unseparated_literal_suffix)]

pub mod cmd;
pub mod reply;

pub use cmd::CmdLine;
