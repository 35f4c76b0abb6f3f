//! Transport prefix lines.
//!
//! The datagram backend frames every packet with a header line identifying
//! the association handle and a monotonically increasing sequence number, and
//! authenticating requests with a `SECURITY USER` claim. The multiplexed
//! backends reuse only the claim line. Both prefixes are consumed by the
//! drivers before the packet text reaches [`crate::Packet::parse`].

use ::core::fmt::Write as FmtWrite;

use crate::error::PacketError;

/// Magic token opening every datagram header line.
pub const DATAGRAM_MAGIC: &str = "ARK";

/// Wire revision advertised in datagram headers.
pub const PROTOCOL_REVISION: u32 = 1;

const SECURITY_PREFIX: &str = "SECURITY USER";

/// A parsed datagram header line:
/// `ARK <revision> HANDLE <hex-token> SEQ <sequence>`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DatagramHeader<'a> {
    /// Wire revision claimed by the sender.
    pub revision: u32,
    /// Association handle, an opaque hex token chosen by the requester.
    pub handle: &'a str,
    /// Monotonically increasing, never reused sequence number.
    pub sequence: u64,
}

/// Splits the first line off `text`, returning the line without its
/// terminator and the remaining text.
#[must_use]
pub fn take_line(text: &str) -> (&str, &str) {
    match memchr::memchr(b'\n', text.as_bytes()) {
        Some(pos) => (text[..pos].trim_end_matches('\r'), &text[pos + 1..]),
        None => (text.trim_end_matches('\r'), ""),
    }
}

/// Parses a datagram header line.
pub fn parse_datagram_header(line: &str) -> Result<DatagramHeader<'_>, PacketError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let malformed = || PacketError::MalformedHeader {
        input: trimmed.to_owned(),
    };

    let mut tokens = trimmed.split_ascii_whitespace();
    if tokens.next() != Some(DATAGRAM_MAGIC) {
        return Err(malformed());
    }
    let revision = tokens
        .next()
        .and_then(|tok| tok.parse::<u32>().ok())
        .ok_or_else(malformed)?;
    if tokens.next() != Some("HANDLE") {
        return Err(malformed());
    }
    let handle = tokens.next().ok_or_else(malformed)?;
    if handle.is_empty() || !handle.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(malformed());
    }
    if tokens.next() != Some("SEQ") {
        return Err(malformed());
    }
    let sequence = tokens
        .next()
        .and_then(|tok| tok.parse::<u64>().ok())
        .ok_or_else(malformed)?;
    if tokens.next().is_some() {
        return Err(malformed());
    }

    Ok(DatagramHeader {
        revision,
        handle,
        sequence,
    })
}

/// Formats a datagram header line with the current wire revision.
#[must_use]
pub fn format_datagram_header(handle: &str, sequence: u64) -> String {
    let mut line = String::with_capacity(DATAGRAM_MAGIC.len() + handle.len() + 32);
    write!(
        line,
        "{DATAGRAM_MAGIC} {PROTOCOL_REVISION} HANDLE {handle} SEQ {sequence}"
    )
    .expect("String implements fmt::Write");
    line.push('\n');
    line
}

/// Extracts the claimed user name from a `SECURITY USER <name>` line.
///
/// Returns `None` when the line does not carry the claim, letting drivers
/// treat the prefix as optional.
#[must_use]
pub fn parse_security_claim(line: &str) -> Option<&str> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let rest = trimmed.strip_prefix(SECURITY_PREFIX)?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let user = rest.trim();
    if user.is_empty() { None } else { Some(user) }
}

/// Formats a `SECURITY USER <name>` claim line.
#[must_use]
pub fn format_security_claim(user: &str) -> String {
    let mut line = String::with_capacity(SECURITY_PREFIX.len() + user.len() + 2);
    line.push_str(SECURITY_PREFIX);
    line.push(' ');
    line.push_str(user);
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let line = format_datagram_header("5f3a01", 42);
        assert_eq!(line, "ARK 1 HANDLE 5f3a01 SEQ 42\n");

        let header = parse_datagram_header(&line).expect("valid header");
        assert_eq!(header.revision, PROTOCOL_REVISION);
        assert_eq!(header.handle, "5f3a01");
        assert_eq!(header.sequence, 42);
    }

    #[test]
    fn header_rejects_wrong_magic() {
        assert!(parse_datagram_header("BRK 1 HANDLE aa SEQ 1").is_err());
    }

    #[test]
    fn header_rejects_non_hex_handle() {
        assert!(parse_datagram_header("ARK 1 HANDLE zz!! SEQ 1").is_err());
    }

    #[test]
    fn header_rejects_missing_sequence() {
        assert!(parse_datagram_header("ARK 1 HANDLE aa SEQ").is_err());
        assert!(parse_datagram_header("ARK 1 HANDLE aa").is_err());
    }

    #[test]
    fn header_rejects_trailing_tokens() {
        assert!(parse_datagram_header("ARK 1 HANDLE aa SEQ 1 extra").is_err());
    }

    #[test]
    fn take_line_splits_at_first_newline() {
        let (line, rest) = take_line("ARK 1 HANDLE aa SEQ 1\r\nREQ\nbody");
        assert_eq!(line, "ARK 1 HANDLE aa SEQ 1");
        assert_eq!(rest, "REQ\nbody");
    }

    #[test]
    fn take_line_handles_terminator_free_input() {
        let (line, rest) = take_line("ACK");
        assert_eq!(line, "ACK");
        assert_eq!(rest, "");
    }

    #[test]
    fn security_claim_round_trips() {
        let line = format_security_claim("backup");
        assert_eq!(line, "SECURITY USER backup\n");
        assert_eq!(parse_security_claim(&line), Some("backup"));
    }

    #[test]
    fn security_claim_requires_delimiter_and_name() {
        assert_eq!(parse_security_claim("SECURITY USERbackup\n"), None);
        assert_eq!(parse_security_claim("SECURITY USER \n"), None);
        assert_eq!(parse_security_claim("REQ\n"), None);
    }
}
