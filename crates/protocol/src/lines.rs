//! Body-grammar helpers for the newline-structured packet payloads.
//!
//! Request bodies open with a `SERVICE` line, replies may carry a single
//! `CONNECT` control line whose handles are rewritten by the daemon before
//! transmission, and `NAK` bodies consist of one `ERROR` line. Everything the
//! grammar does not claim is opaque text and passes through untouched.

use ::core::fmt::Write as FmtWrite;

use crate::error::PacketError;

/// Handle value advertised in a `CONNECT` line when a channel could not be
/// opened. Peers must not attempt to connect it.
pub const NO_STREAM: i64 = -1;

const SERVICE_KEYWORD: &str = "SERVICE";
const CONNECT_KEYWORD: &str = "CONNECT";
const ERROR_KEYWORD: &str = "ERROR";

/// A parsed `SERVICE <name> <argument-blob>` request body.
///
/// The argument blob is opaque to the dispatcher: it spans the rest of the
/// request body (the remainder of the `SERVICE` line plus any following
/// lines) and is forwarded verbatim to the subprocess's standard input.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceRequest<'a> {
    /// The requested service name.
    pub service: &'a str,
    /// Opaque arguments destined for the subprocess's stdin.
    pub options: &'a str,
}

/// Parses a request body into its service name and opaque argument blob.
///
/// The body must begin with the `SERVICE` keyword followed by a non-empty
/// service name on the same line. Whitespace between the name and the
/// argument blob is consumed; a request whose first line carries no arguments
/// yields an empty blob rather than a lone newline.
pub fn parse_request(body: &str) -> Result<ServiceRequest<'_>, PacketError> {
    let line_end = memchr::memchr(b'\n', body.as_bytes()).unwrap_or(body.len());
    let first_line = body[..line_end].trim_end_matches('\r');

    let malformed = || PacketError::MalformedRequest {
        input: first_line.to_owned(),
    };

    let rest = first_line.strip_prefix(SERVICE_KEYWORD).ok_or_else(malformed)?;
    if !rest.starts_with([' ', '\t']) {
        return Err(malformed());
    }

    let rest = rest.trim_start_matches([' ', '\t']);
    let service_len = rest
        .find([' ', '\t'])
        .unwrap_or(rest.len());
    let service = &rest[..service_len];
    if service.is_empty() {
        return Err(malformed());
    }

    // Offset of the blob within `body`: everything after the service token,
    // with leading blanks consumed and a single newline dropped when the
    // first line carried no arguments.
    let service_end = rest[service_len..].as_ptr() as usize - body.as_ptr() as usize;
    let mut options = body[service_end..].trim_start_matches([' ', '\t']);
    options = options.strip_prefix("\r\n").unwrap_or(options);
    if let Some(stripped) = options.strip_prefix('\n') {
        options = stripped;
    }

    Ok(ServiceRequest { service, options })
}

/// One `<channel> <handle>` pair announced by a subprocess on its `CONNECT`
/// control line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectRequest<'a> {
    /// Logical channel name, conventionally `DATA`, `MESG`, or `INDEX`.
    pub channel: &'a str,
    /// The handle the subprocess announced for the channel.
    pub handle: i64,
}

/// Returns `true` when `line` opens with the `CONNECT` keyword and a
/// delimiter.
#[must_use]
pub fn is_connect_line(line: &str) -> bool {
    line.strip_prefix(CONNECT_KEYWORD)
        .is_some_and(|rest| rest.starts_with([' ', '\t']))
}

/// Parses a `CONNECT <chan> <handle> [<chan> <handle>…]` control line.
///
/// Tokens must come in pairs; handles must parse as signed integers. The
/// trailing newline and carriage return are tolerated.
pub fn parse_connect_line(line: &str) -> Result<Vec<ConnectRequest<'_>>, PacketError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let malformed = || PacketError::MalformedConnect {
        input: trimmed.to_owned(),
    };

    let rest = trimmed.strip_prefix(CONNECT_KEYWORD).ok_or_else(malformed)?;
    let mut tokens = rest.split_ascii_whitespace();
    let mut entries = Vec::new();

    while let Some(channel) = tokens.next() {
        let handle = tokens
            .next()
            .and_then(|tok| tok.parse::<i64>().ok())
            .ok_or_else(malformed)?;
        entries.push(ConnectRequest { channel, handle });
    }

    if entries.is_empty() {
        return Err(malformed());
    }
    Ok(entries)
}

/// Rewrites the first `CONNECT` line of a reply body, substituting
/// driver-assigned stream ids for the subprocess-announced handles.
///
/// `alloc` is invoked once per announced pair, in announcement order, and
/// returns the externally visible id to advertise ([`NO_STREAM`] when the
/// channel could not be opened). All other text, including any further
/// `CONNECT`-looking lines after the first, passes through byte-for-byte.
pub fn rewrite_connect_line<F>(reply: &str, mut alloc: F) -> Result<String, PacketError>
where
    F: FnMut(&str, i64) -> i64,
{
    let mut out = String::with_capacity(reply.len());
    let mut rewritten = false;

    for line in reply.split_inclusive('\n') {
        if !rewritten && is_connect_line(line) {
            let entries = parse_connect_line(line)?;
            out.push_str(CONNECT_KEYWORD);
            for entry in entries {
                let id = alloc(entry.channel, entry.handle);
                write!(out, " {} {}", entry.channel, id)
                    .expect("String implements fmt::Write");
            }
            if line.ends_with('\n') {
                out.push('\n');
            }
            rewritten = true;
        } else {
            out.push_str(line);
        }
    }

    Ok(out)
}

/// Formats a `NAK` body: a single `ERROR <message>` line.
#[must_use]
pub fn format_nak_body(message: &str) -> String {
    let mut body = String::with_capacity(ERROR_KEYWORD.len() + message.len() + 2);
    body.push_str(ERROR_KEYWORD);
    if !message.is_empty() {
        body.push(' ');
        body.push_str(message);
    }
    body.push('\n');
    body
}

/// Extracts the human-readable message from a `NAK` body, if it follows the
/// `ERROR` grammar.
#[must_use]
pub fn parse_nak_body(body: &str) -> Option<&str> {
    let line_end = memchr::memchr(b'\n', body.as_bytes()).unwrap_or(body.len());
    let line = body[..line_end].trim_end_matches('\r');
    let rest = line.strip_prefix(ERROR_KEYWORD)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix(' ').map(str::trim_end)
}
