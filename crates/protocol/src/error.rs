use ::core::fmt;
use std::io;

use crate::packet::MAX_PACKET_LEN;

/// Errors produced while decoding wire packets or their body grammar.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PacketError {
    /// The first token of the packet text is not one of the four packet kinds.
    UnknownKind {
        /// The offending token with surrounding whitespace trimmed.
        token: String,
    },
    /// The packet text exceeds [`MAX_PACKET_LEN`].
    Oversized {
        /// Observed length in bytes.
        len: usize,
    },
    /// A transport prefix line did not match the datagram header grammar.
    MalformedHeader {
        /// The raw header line without trailing newlines.
        input: String,
    },
    /// A request body did not start with a well-formed `SERVICE` line.
    MalformedRequest {
        /// The raw request line without trailing newlines.
        input: String,
    },
    /// A `CONNECT` control line carried an odd token count or a non-numeric
    /// handle.
    MalformedConnect {
        /// The raw control line without trailing newlines.
        input: String,
    },
}

impl PacketError {
    /// Returns the unrecognised kind token, if this is an [`PacketError::UnknownKind`].
    ///
    /// Daemon-side logging surfaces the offending token verbatim so operators
    /// can spot peers speaking a different protocol revision. The accessor
    /// avoids pattern matching at those call sites.
    #[must_use]
    pub fn unknown_kind(&self) -> Option<&str> {
        match self {
            Self::UnknownKind { token } => Some(token.as_str()),
            _ => None,
        }
    }

    /// Returns the raw input line preserved by the malformed-input variants.
    #[must_use]
    pub fn malformed_input(&self) -> Option<&str> {
        match self {
            Self::MalformedHeader { input }
            | Self::MalformedRequest { input }
            | Self::MalformedConnect { input } => Some(input.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKind { token } => {
                write!(f, "unknown packet kind token {token:?}")
            }
            Self::Oversized { len } => {
                write!(
                    f,
                    "packet length {len} exceeds the {MAX_PACKET_LEN} byte limit"
                )
            }
            Self::MalformedHeader { input } => {
                write!(f, "malformed datagram header: {input:?}")
            }
            Self::MalformedRequest { input } => {
                write!(f, "malformed service request line: {input:?}")
            }
            Self::MalformedConnect { input } => {
                write!(f, "malformed CONNECT control line: {input:?}")
            }
        }
    }
}

impl std::error::Error for PacketError {}

impl From<PacketError> for io::Error {
    fn from(err: PacketError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_the_offending_token() {
        let err = PacketError::UnknownKind {
            token: "PING".to_owned(),
        };
        assert_eq!(err.to_string(), "unknown packet kind token \"PING\"");
    }

    #[test]
    fn display_mentions_the_size_limit() {
        let err = PacketError::Oversized { len: 70_000 };
        let rendered = err.to_string();
        assert!(rendered.contains("70000"));
        assert!(rendered.contains(&MAX_PACKET_LEN.to_string()));
    }

    #[test]
    fn accessors_expose_variant_context() {
        let unknown = PacketError::UnknownKind {
            token: "PING".to_owned(),
        };
        assert_eq!(unknown.unknown_kind(), Some("PING"));
        assert_eq!(unknown.malformed_input(), None);

        let malformed = PacketError::MalformedRequest {
            input: "SERVICE".to_owned(),
        };
        assert_eq!(malformed.unknown_kind(), None);
        assert_eq!(malformed.malformed_input(), Some("SERVICE"));
    }

    #[test]
    fn converts_to_io_error_preserving_kind_and_source() {
        let err = PacketError::Oversized { len: 99_999 };
        let io_err: io::Error = err.clone().into();

        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        let source = io_err
            .get_ref()
            .and_then(|src| src.downcast_ref::<PacketError>())
            .expect("io::Error must carry PacketError source");
        assert_eq!(source, &err);
    }
}
