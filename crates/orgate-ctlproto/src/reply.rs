//! Synthesized control-port replies.
//!
//! Every reply the filter writes on Tor's behalf is built here, so the
//! exact wire format (status codes, `\r\n` framing, quoting) lives in
//! one place.

/// The all-purpose success reply.
pub const RESPONSE_OK: &str = "250 OK\r\n";

/// Reply for commands that are not allowed before authentication.
pub const ERR_AUTHENTICATION_REQUIRED: &str = "514 Authentication required\r\n";

/// Reply for commands the filter refuses to pass through.
pub const ERR_UNRECOGNIZED_COMMAND: &str = "510 Unrecognized command\r\n";

/// The single GETINFO key the filter will answer.
pub const GETINFO_SOCKS_KEY: &str = "net/listeners/socks";

/// The single SIGNAL name the filter will relay.
pub const SIGNAL_NEWNYM: &str = "NEWNYM";

/// Reply for a PROTOCOLINFO argument that is not a version number.
pub fn no_such_version(tok: &str) -> String {
    format!("513 No such version \"{}\"\r\n", tok)
}

/// Reply for a GETINFO key the filter will not answer or forward.
pub fn unrecognized_key(key: &str) -> String {
    format!("552 Unrecognized key \"{}\"\r\n", key)
}

/// Reply for a SIGNAL name the filter will not relay.
pub fn unrecognized_signal(name: &str) -> String {
    format!("552 Unrecognized signal code \"{}\"\r\n", name)
}

/// Reply for a recognized command with the wrong number of tokens.
///
/// `actual` and `expected` count all tokens on the line, command
/// included.
pub fn bad_arg_count(cmd: &str, expected: usize, actual: usize) -> String {
    if actual > expected {
        format!("512 Too many arguments to {}\r\n", cmd)
    } else {
        format!("512 Missing argument to {}\r\n", cmd)
    }
}

/// The spoofed PROTOCOLINFO response.
///
/// COOKIE and SAFECOOKIE are deliberately absent from the method list:
/// the client cannot read the real Tor's cookie file, so it must be
/// steered toward NULL authentication.  The version string is the one
/// cached from the upstream (or the stub's placeholder), so the answer
/// looks plausible.
pub fn protocolinfo(tor_version: &str) -> String {
    format!(
        "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL,HASHEDPASSWORD\r\n250-VERSION Tor=\"{}\"\r\n{}",
        tor_version, RESPONSE_OK
    )
}

/// The spoofed `GETINFO net/listeners/socks` response.
///
/// The address handed back is this proxy's own SOCKS listener, not
/// Tor's: the whole point of the mux is that the client's streams come
/// back through us.
pub fn getinfo_socks(socks_addr: &str) -> String {
    format!(
        "250-{}=\"{}\"\r\n{}",
        GETINFO_SOCKS_KEY, socks_addr, RESPONSE_OK
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocolinfo_always_lies_about_methods() {
        for version in ["0.4.8.12", "0.2.7.1-alpha"] {
            let r = protocolinfo(version);
            assert!(r.contains("METHODS=NULL,HASHEDPASSWORD"));
            assert!(!r.contains("SAFECOOKIE"));
            assert!(r.ends_with("250 OK\r\n"));
        }
        assert_eq!(
            protocolinfo("0.4.8.12"),
            "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL,HASHEDPASSWORD\r\n\
             250-VERSION Tor=\"0.4.8.12\"\r\n250 OK\r\n"
        );
    }

    #[test]
    fn getinfo_socks_reply() {
        assert_eq!(
            getinfo_socks("127.0.0.1:9150"),
            "250-net/listeners/socks=\"127.0.0.1:9150\"\r\n250 OK\r\n"
        );
    }

    #[test]
    fn error_replies() {
        assert_eq!(no_such_version("x"), "513 No such version \"x\"\r\n");
        assert_eq!(
            unrecognized_key("version"),
            "552 Unrecognized key \"version\"\r\n"
        );
        assert_eq!(
            unrecognized_signal("DUMP"),
            "552 Unrecognized signal code \"DUMP\"\r\n"
        );
        assert_eq!(
            bad_arg_count("GETINFO", 2, 3),
            "512 Too many arguments to GETINFO\r\n"
        );
        assert_eq!(
            bad_arg_count("SIGNAL", 2, 1),
            "512 Missing argument to SIGNAL\r\n"
        );
    }
}
