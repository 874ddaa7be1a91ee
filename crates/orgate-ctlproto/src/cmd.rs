//! Parsing of client command lines.

/// The PROTOCOLINFO command.
pub const PROTOCOLINFO: &str = "PROTOCOLINFO";
/// The AUTHENTICATE command.
pub const AUTHENTICATE: &str = "AUTHENTICATE";
/// The AUTHCHALLENGE command.
pub const AUTHCHALLENGE: &str = "AUTHCHALLENGE";
/// The QUIT command.
pub const QUIT: &str = "QUIT";
/// The GETINFO command.
pub const GETINFO: &str = "GETINFO";
/// The SIGNAL command.
pub const SIGNAL: &str = "SIGNAL";

/// One command line received from a control-port client.
///
/// The raw bytes are retained verbatim (terminator included) so that an
/// allowed command can be replayed on the upstream connection exactly
/// as the client sent it.
#[derive(Clone, Debug)]
pub struct CmdLine {
    /// The line exactly as read from the client.
    raw: Vec<u8>,
    /// The first token, ASCII-uppercased for matching.
    cmd: String,
    /// Every space-separated token of the trimmed line, in original
    /// case.  Always at least one entry (possibly empty).
    tokens: Vec<String>,
}

impl CmdLine {
    /// Parse a raw line, newline terminator and all, into its tokens.
    ///
    /// Tokens are split on single spaces: consecutive spaces produce
    /// empty tokens, which the per-command validators then refuse.
    /// Argument tokens keep their case; only the command token is
    /// folded for matching.
    pub fn parse(raw: &[u8]) -> Self {
        let trimmed = String::from_utf8_lossy(raw);
        let trimmed = trimmed.trim();
        let tokens: Vec<String> = trimmed.split(' ').map(str::to_string).collect();
        let cmd = tokens[0].trim().to_ascii_uppercase();
        CmdLine {
            raw: raw.to_vec(),
            cmd,
            tokens,
        }
    }

    /// Return the uppercased command token.
    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// Return all tokens of the line, command included.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Return the raw bytes of the line, exactly as received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Check the version arguments of a PROTOCOLINFO command.
///
/// Each token after the command must parse as a signed 32-bit integer;
/// any value is acceptable.  On failure, return the offending token so
/// the caller can echo it in a `513` reply.
pub fn validate_protocolinfo_args(line: &CmdLine) -> Result<(), &str> {
    for tok in &line.tokens()[1..] {
        if tok.parse::<i32>().is_err() {
            return Err(tok.as_str());
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_basic() {
        let line = CmdLine::parse(b"getinfo net/listeners/socks\r\n");
        assert_eq!(line.cmd(), "GETINFO");
        assert_eq!(line.tokens(), &["getinfo", "net/listeners/socks"]);
        assert_eq!(line.raw(), b"getinfo net/listeners/socks\r\n");
    }

    #[test]
    fn parse_bare_command() {
        let line = CmdLine::parse(b"AUTHENTICATE\r\n");
        assert_eq!(line.cmd(), "AUTHENTICATE");
        assert_eq!(line.tokens().len(), 1);
    }

    #[test]
    fn parse_repeated_spaces() {
        // Doubled separators yield an empty token, which argument
        // validation treats as a real (bad) argument.
        let line = CmdLine::parse(b"SIGNAL  NEWNYM\r\n");
        assert_eq!(line.cmd(), "SIGNAL");
        assert_eq!(line.tokens().len(), 3);
        assert_eq!(line.tokens()[1], "");
    }

    #[test]
    fn protocolinfo_args() {
        let ok = CmdLine::parse(b"PROTOCOLINFO\r\n");
        assert!(validate_protocolinfo_args(&ok).is_ok());
        let ok = CmdLine::parse(b"PROTOCOLINFO 1\r\n");
        assert!(validate_protocolinfo_args(&ok).is_ok());
        let ok = CmdLine::parse(b"protocolinfo 1 2 -3\r\n");
        assert!(validate_protocolinfo_args(&ok).is_ok());

        let bad = CmdLine::parse(b"PROTOCOLINFO one\r\n");
        assert_eq!(validate_protocolinfo_args(&bad), Err("one"));
        let bad = CmdLine::parse(b"PROTOCOLINFO 1 99999999999\r\n");
        assert_eq!(validate_protocolinfo_args(&bad), Err("99999999999"));
    }
}
