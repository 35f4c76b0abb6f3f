#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `ark-transport` houses the transport/security drivers of the ark
//! request-dispatch daemon. A driver owns everything between the wire and
//! the dispatcher: peer authentication, packet framing, and the byte streams
//! that carry data channels. Three materially different backends implement
//! the same capability surface:
//!
//! - [`udp`] — direct datagram exchange. Packets travel in individually
//!   framed datagrams over one shared socket; data streams are side-band TCP
//!   connections whose port numbers serve as the advertised handles.
//! - [`tcp`] — a single TCP connection multiplexing the packet protocol and
//!   all data streams as framed channels (see [`frame`]).
//! - [`shell`] — the same channel framing spoken over the pipe pair of a
//!   spawned remote-shell client, or over inherited stdio when running as
//!   the tunnelled sub-daemon.
//!
//! # Design
//!
//! The dispatcher consumes two object-safe traits. A [`Listener`] is armed
//! once at startup and re-armed after every transaction; its `accept` turns
//! an admissible inbound request into a [`Connection`]. A [`Connection`]
//! surfaces everything that happens on the wire as [`DriverEvent`] values —
//! the daemon watches [`Connection::readable_fds`] and calls
//! [`Connection::on_readable`] when the reactor reports readiness, so the
//! drivers never block outside the bounded waits documented on the
//! individual methods.
//!
//! Receive scheduling is deliberately not a driver concern: the dispatcher
//! keeps exactly one outstanding packet expectation and re-arms it (last
//! caller wins); drivers only deliver what arrives.
//!
//! # Invariants
//!
//! - A verification failure during stream setup yields an error and no
//!   stream; there is no partially usable state.
//! - Authentication happens before a `Connection` exists: an inbound request
//!   that fails the privileged-port or user-claim checks never reaches the
//!   dispatcher.
//! - `needs_end_marker` is a fixed per-backend policy, never inferred.

use std::os::fd::RawFd;

use ark_protocol::{Packet, PacketKind};

mod error;
pub mod frame;
mod mux;
pub mod shell;
pub mod tcp;
pub mod udp;

pub use error::DriverError;

/// Externally visible identifier of a data stream.
///
/// The value is what the peer sees in a rewritten `CONNECT` line: a TCP port
/// number for the datagram backend, a channel number for the multiplexed
/// backends.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Returns the id as the signed handle advertised in protocol text.
    #[must_use]
    pub const fn as_handle(self) -> i64 {
        self.0 as i64
    }
}

/// Wire activity reported by a [`Connection`].
#[derive(Debug)]
pub enum DriverEvent {
    /// A protocol packet arrived on the packet channel.
    Packet(Packet),
    /// A packet arrived that does not belong to the association (foreign
    /// peer, stale handle, reused sequence). The dispatcher logs and ignores
    /// it; admission of new requests only ever happens through a
    /// [`Listener`].
    Stray {
        /// Rendering of the originating peer.
        from: String,
        /// The packet kind observed.
        kind: PacketKind,
    },
    /// Bytes arrived on an open data stream.
    StreamData(StreamId, Vec<u8>),
    /// The peer closed a data stream.
    StreamEof(StreamId),
    /// The peer closed the association itself.
    Closed,
}

/// One transport association with an authenticated peer.
///
/// Owned exclusively by the dispatcher driving the active transaction; open
/// streams live and die with it.
pub trait Connection {
    /// The authenticated peer identity, as established at admission.
    fn peer_name(&self) -> &str;

    /// Best-effort single packet send. Failure indicates a transport error;
    /// retry policy belongs to the dispatcher, not the driver.
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DriverError>;

    /// Allocates a stream in the listening state and returns the id to
    /// advertise to the peer.
    fn stream_listen(&mut self) -> Result<StreamId, DriverError>;

    /// Opens a stream toward a peer-advertised handle (the client half of
    /// the stream handshake; servers allocate with
    /// [`Connection::stream_listen`] instead). Verification failure yields
    /// an error and no stream.
    fn stream_connect(&mut self, handle: i64) -> Result<StreamId, DriverError>;

    /// Completes the passive side of a listening stream.
    ///
    /// For the datagram backend this performs a bounded wait for the peer's
    /// TCP connection and verifies its source address; for the multiplexed
    /// backends it is immediate.
    fn stream_accept(&mut self, id: StreamId) -> Result<(), DriverError>;

    /// Writes bytes to an open stream.
    fn stream_write(&mut self, id: StreamId, bytes: &[u8]) -> Result<(), DriverError>;

    /// Closes the local side of a stream.
    fn stream_close(&mut self, id: StreamId) -> Result<(), DriverError>;

    /// Signals the end of the protocol transaction.
    ///
    /// Backends whose [`Connection::needs_end_marker`] is `true` close the
    /// multiplexed packet channel here; for the others this is a no-op.
    fn end_transaction(&mut self) -> Result<(), DriverError>;

    /// Whether this backend requires an explicit end-of-transaction marker
    /// on the packet channel. A fixed per-backend policy.
    fn needs_end_marker(&self) -> bool;

    /// The descriptors the dispatcher must watch for readability on behalf
    /// of this connection. The set changes as streams open and close; the
    /// dispatcher re-synchronises after every event batch.
    fn readable_fds(&self) -> Vec<RawFd>;

    /// Handles readiness of `fd`, appending whatever the wire produced.
    ///
    /// Performs at most one read per call; the reactor re-reports readiness
    /// if more input is pending.
    fn on_readable(
        &mut self,
        fd: RawFd,
        events: &mut Vec<DriverEvent>,
    ) -> Result<(), DriverError>;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_name", &self.peer_name())
            .finish_non_exhaustive()
    }
}

/// Result of a successful [`Listener::accept`]: the new connection plus any
/// events already produced while admitting it (the datagram backend decodes
/// the first `REQ` during admission).
#[derive(Debug)]
pub struct Accepted {
    /// The established association.
    pub connection: Box<dyn Connection>,
    /// Events to process before watching the connection's descriptors.
    pub initial: Vec<DriverEvent>,
}

/// Passive side of a transport: accepts inbound transactions.
pub trait Listener {
    /// Binds and arms the listening endpoint. Invoked once at startup.
    fn open(&mut self) -> Result<(), DriverError>;

    /// The descriptor to watch for inbound activity.
    fn fd(&self) -> RawFd;

    /// Attempts to admit one inbound transaction after the listening
    /// descriptor reported readable.
    ///
    /// Returns `Ok(None)` when the readiness did not amount to an admissible
    /// request (spurious wake, stray datagram). Admission failures
    /// (authentication, framing) surface as errors the daemon logs before
    /// continuing to listen.
    fn accept(&mut self) -> Result<Option<Accepted>, DriverError>;

    /// Whether this listener serves exactly one association per daemon
    /// invocation (the inbound tunnel does; socket listeners do not). The
    /// daemon exits instead of re-arming once a single-shot listener's
    /// association has finished.
    fn single_shot(&self) -> bool {
        false
    }
}

/// Authorized-user policy shared by the backends that verify a
/// `SECURITY USER` claim.
#[derive(Clone, Debug, Default)]
pub struct Authorizer {
    users: Vec<String>,
}

impl Authorizer {
    /// Builds a policy from the configured user list.
    #[must_use]
    pub fn new(users: Vec<String>) -> Self {
        Self { users }
    }

    /// Verifies a claimed user name against the list.
    pub fn verify(&self, claim: Option<&str>) -> Result<String, DriverError> {
        let user = claim.ok_or(DriverError::MissingClaim)?;
        if self.users.iter().any(|allowed| allowed == user) {
            Ok(user.to_owned())
        } else {
            Err(DriverError::UnauthorizedUser {
                user: user.to_owned(),
            })
        }
    }
}

/// Highest source port a requesting peer may use and still count as
/// privileged.
pub const MAX_PRIVILEGED_PORT: u16 = 1023;

pub(crate) fn require_privileged_port(port: u16) -> Result<(), DriverError> {
    if port > MAX_PRIVILEGED_PORT {
        return Err(DriverError::UnprivilegedPort { port });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorizer_accepts_listed_users_only() {
        let auth = Authorizer::new(vec!["backup".to_owned(), "operator".to_owned()]);
        assert_eq!(auth.verify(Some("backup")).expect("authorized"), "backup");
        assert!(matches!(
            auth.verify(Some("mallory")),
            Err(DriverError::UnauthorizedUser { .. })
        ));
        assert!(matches!(auth.verify(None), Err(DriverError::MissingClaim)));
    }

    #[test]
    fn privileged_port_boundary() {
        assert!(require_privileged_port(1023).is_ok());
        assert!(require_privileged_port(512).is_ok());
        assert!(matches!(
            require_privileged_port(1024),
            Err(DriverError::UnprivilegedPort { port: 1024 })
        ));
    }

    #[test]
    fn stream_id_converts_to_protocol_handle() {
        assert_eq!(StreamId(50123).as_handle(), 50123);
    }
}
