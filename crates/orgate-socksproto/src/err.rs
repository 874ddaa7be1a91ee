//! Declare an error type for orgate_socksproto.

use thiserror::Error;

/// An error that occurs while encoding or decoding a SOCKS message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Tried to handle a message that wasn't complete: try again with
    /// more bytes.
    #[error("Message truncated; need to wait for more")]
    Truncated,

    /// The peer didn't implement SOCKS correctly.
    ///
    /// (Or, more likely, we didn't account for its behavior.)
    #[error("SOCKS protocol syntax violation")]
    Syntax,

    /// The client declared a SOCKS version number that isn't one we
    /// support.
    ///
    /// In all likelihood, this is somebody trying to use the port for
    /// some protocol other than SOCKS.
    #[error("Unrecognized SOCKS protocol version {0}")]
    BadProtocol(u8),

    /// The client asked for a SOCKS command we do not relay.
    ///
    /// The session should answer this one with a "command not
    /// supported" reply rather than going silent.
    #[error("Unsupported SOCKS command {0}")]
    BadCommand(u8),

    /// A SOCKS feature we don't support at all, such as an
    /// authentication method nobody agreed on.
    #[error("SOCKS feature not supported")]
    NoSupport,

    /// Tried to progress the SOCKS handshake when it was already
    /// finished.  This is a programming error.
    #[error("SOCKS handshake was finished; no need to call this again")]
    AlreadyFinished,

    /// Something went wrong with the programming of this module.
    #[error("Internal programming error while handling SOCKS")]
    Internal,
}
