#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `ark-protocol` implements the text wire protocol spoken between the ark
//! request-dispatch daemon and its peers. A protocol transaction exchanges
//! four packet kinds — `REQ`, `ACK`, `REP`, `NAK` — whose bodies are
//! newline-structured text: requests open with a `SERVICE` line, replies may
//! carry a `CONNECT` control line advertising data-stream handles, and
//! negative acknowledgements carry a single `ERROR` line.
//!
//! # Design
//!
//! The crate is a pure codec: parse/format pairs over borrowed text, no I/O
//! and no transport state.
//!
//! - [`Packet`] and [`PacketKind`] classify and frame whole packets.
//! - [`lines`] implements the body grammar (`SERVICE`, `CONNECT`, `ERROR`)
//!   including the CONNECT-handle rewriting performed before a reply is sent.
//! - The prefix helpers ([`parse_datagram_header`], [`parse_security_claim`])
//!   cover the transport prefix lines that drivers strip before packets
//!   reach [`Packet::parse`].
//!
//! # Invariants
//!
//! - Text the grammar does not claim is never altered: bodies round-trip
//!   byte-for-byte through encode/decode, and CONNECT rewriting touches only
//!   the first control line.
//! - Decoding never panics on arbitrary input; every malformed shape maps to
//!   a [`PacketError`] variant carrying the offending text.

mod error;
mod packet;
mod prefix;

pub mod lines;

pub use error::PacketError;
pub use lines::{
    ConnectRequest, NO_STREAM, ServiceRequest, format_nak_body, is_connect_line, parse_connect_line,
    parse_nak_body, parse_request, rewrite_connect_line,
};
pub use packet::{MAX_PACKET_LEN, Packet, PacketKind};
pub use prefix::{
    DATAGRAM_MAGIC, DatagramHeader, PROTOCOL_REVISION, format_datagram_header,
    format_security_claim, parse_datagram_header, parse_security_claim, take_line,
};
