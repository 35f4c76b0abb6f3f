use ::core::fmt::{self, Write as FmtWrite};

use crate::error::PacketError;

/// Upper bound on the wire representation of a single packet.
///
/// The protocol carries reply bodies of arbitrary logical size, but peers
/// bound a single packet to 50 KiB; anything larger indicates a confused or
/// hostile sender and is rejected during decoding.
pub const MAX_PACKET_LEN: usize = 50 * 1024;

/// The four packet kinds exchanged by the request protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PacketKind {
    /// A service request (`REQ`).
    Req,
    /// The reply carrying collected subprocess output (`REP`).
    Rep,
    /// A positive acknowledgement with an empty body (`ACK`).
    Ack,
    /// A negative acknowledgement carrying an `ERROR` line (`NAK`).
    Nak,
}

impl PacketKind {
    /// Returns the wire token for this kind.
    #[must_use]
    pub const fn as_token(self) -> &'static str {
        match self {
            Self::Req => "REQ",
            Self::Rep => "REP",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
        }
    }

    /// Classifies a wire token, returning `None` for anything unrecognised.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "REQ" => Some(Self::Req),
            "REP" => Some(Self::Rep),
            "ACK" => Some(Self::Ack),
            "NAK" => Some(Self::Nak),
            _ => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

/// A decoded protocol packet: a kind tag plus an opaque newline-structured
/// text body.
///
/// Packets are plain value objects created per send or receive; they carry no
/// transport state. The body of an `ACK` is empty by convention, a `NAK` body
/// is a single `ERROR` line, and `REQ`/`REP` bodies follow the service
/// grammar in [`crate::lines`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    kind: PacketKind,
    body: String,
}

impl Packet {
    /// Constructs a packet from a kind and an owned body.
    #[must_use]
    pub const fn new(kind: PacketKind, body: String) -> Self {
        Self { kind, body }
    }

    /// Constructs an `ACK` packet with the conventional empty body.
    #[must_use]
    pub const fn ack() -> Self {
        Self {
            kind: PacketKind::Ack,
            body: String::new(),
        }
    }

    /// Constructs a `NAK` packet whose body is a single `ERROR` line.
    #[must_use]
    pub fn nak(message: &str) -> Self {
        Self {
            kind: PacketKind::Nak,
            body: crate::lines::format_nak_body(message),
        }
    }

    /// Returns the packet kind.
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Returns the packet body text.
    #[must_use]
    #[inline]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Consumes the packet and returns the owned body.
    #[must_use]
    pub fn into_body(self) -> String {
        self.body
    }

    /// Decodes a packet from prefix-stripped wire text.
    ///
    /// The first line must consist of exactly one kind token; everything after
    /// its newline is the body, preserved verbatim. A trailing carriage return
    /// on the token line is tolerated. Transport prefix lines (datagram
    /// headers, `SECURITY` claims) must already have been consumed by the
    /// driver — see [`crate::prefix`].
    pub fn parse(text: &str) -> Result<Self, PacketError> {
        if text.len() > MAX_PACKET_LEN {
            return Err(PacketError::Oversized { len: text.len() });
        }

        let (token_line, body) = match memchr::memchr(b'\n', text.as_bytes()) {
            Some(pos) => (&text[..pos], &text[pos + 1..]),
            None => (text, ""),
        };

        let token = token_line.trim_end_matches('\r').trim();
        let kind = PacketKind::from_token(token).ok_or_else(|| PacketError::UnknownKind {
            token: token.to_owned(),
        })?;

        Ok(Self {
            kind,
            body: body.to_owned(),
        })
    }

    /// Encodes the packet into its wire text: the kind token line followed by
    /// the body.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(4 + self.body.len());
        out.write_str(self.kind.as_token())
            .expect("String implements fmt::Write");
        out.push('\n');
        out.push_str(&self.body);
        out
    }
}
