use std::io;

use ark_protocol::PacketError;

/// Errors surfaced by the transport/security drivers.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Binding a listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
    /// A request arrived from a non-privileged source port.
    #[error("request from unprivileged source port {port}")]
    UnprivilegedPort {
        /// The offending source port.
        port: u16,
    },
    /// The claimed user is not on the authorized-user list.
    #[error("user {user:?} is not authorized")]
    UnauthorizedUser {
        /// The claimed user name.
        user: String,
    },
    /// A request carried no `SECURITY USER` claim where one is required.
    #[error("request carries no SECURITY USER claim")]
    MissingClaim,
    /// Wire text failed to decode.
    #[error("malformed wire text: {0}")]
    Packet(#[from] PacketError),
    /// A channel frame announced a payload beyond the configured bound.
    #[error("frame payload length {len} exceeds the {limit} byte limit")]
    OversizedFrame {
        /// Announced payload length.
        len: usize,
        /// Configured limit.
        limit: usize,
    },
    /// A stream operation was attempted in an incompatible state.
    #[error("stream {id} is not in a usable state for this operation")]
    StreamState {
        /// The stream id involved.
        id: u32,
    },
    /// The remote side of a stream failed address or identity verification.
    #[error("peer {peer} failed stream verification")]
    StreamVerification {
        /// Rendering of the offending peer address.
        peer: String,
    },
    /// Spawning the remote-shell client failed.
    #[error("failed to spawn remote shell {command:?}: {source}")]
    Spawn {
        /// The command that could not be spawned.
        command: String,
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },
    /// Any other transport-level I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DriverError {
    /// Returns `true` for failures that reject a would-be association before
    /// any connection state exists (authentication and framing checks), as
    /// opposed to failures of an established association.
    #[must_use]
    pub const fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Self::UnprivilegedPort { .. }
                | Self::UnauthorizedUser { .. }
                | Self::MissingClaim
                | Self::Packet(_)
        )
    }
}
