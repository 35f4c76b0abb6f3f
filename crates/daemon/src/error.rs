use std::io;
use std::path::PathBuf;

use ark_protocol::PacketKind;
use ark_transport::DriverError;

/// Failures of one protocol transaction.
///
/// Everything detected before the subprocess is launched turns into a single
/// `NAK` and the transaction never starts; everything detected afterwards is
/// folded into the reply body as an appended `ERROR` line so the remote
/// operator sees it next to whatever partial output was produced.
#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    /// The request body did not follow the `SERVICE` grammar.
    #[error("malformed request: {detail}")]
    MalformedRequest {
        /// Description of the parse failure.
        detail: String,
    },
    /// The requested service is not in the service table.
    #[error("unknown service {name:?}")]
    UnknownService {
        /// The requested name.
        name: String,
    },
    /// The requested service exists but is administratively disabled.
    #[error("service {name:?} is disabled")]
    DisabledService {
        /// The requested name.
        name: String,
    },
    /// The service executable is missing or lacks execute permission.
    #[error("service {name:?} is not executable at {path}")]
    NotExecutable {
        /// The requested name.
        name: String,
        /// The path that failed the check.
        path: PathBuf,
    },
    /// Spawning the service subprocess failed.
    #[error("failed to launch service: {source}")]
    Launch {
        /// Underlying spawn error.
        #[source]
        source: io::Error,
    },
    /// A second launch was attempted while a transaction was active.
    #[error("another transaction is already active")]
    Busy,
    /// The service subprocess exited with a failure status.
    #[error("service exited abnormally ({status})")]
    AbnormalExit {
        /// Rendering of the exit status.
        status: String,
    },
    /// Reading the subprocess reply pipe failed.
    #[error("error reading reply pipe: {source}")]
    ReplyPipeRead {
        /// Underlying read error.
        #[source]
        source: io::Error,
    },
    /// The subprocess produced no reply within the configured window.
    #[error("timeout on reply pipe")]
    ReplyPipeTimeout,
    /// Every configured reply retransmission went unacknowledged.
    #[error("ack retries exhausted")]
    AckTimeoutExhausted,
    /// A packet kind arrived that the current state does not permit.
    #[error("unexpected {kind} packet")]
    UnexpectedPacket {
        /// The offending kind.
        kind: PacketKind,
    },
    /// A data stream failed verification while being opened.
    #[error("stream verification failed: {source}")]
    StreamVerification {
        /// Underlying driver error.
        #[source]
        source: DriverError,
    },
    /// Relaying a data stream failed.
    #[error("stream I/O failure: {source}")]
    StreamIo {
        /// Underlying driver or pipe error.
        #[source]
        source: DriverError,
    },
}

impl TxnError {
    /// The message placed in a `NAK` body for this failure.
    #[must_use]
    pub fn nak_message(&self) -> String {
        self.to_string()
    }
}

/// Fatal daemon-level failures: the daemon itself cannot continue.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Arming the transport listener failed.
    #[error("cannot listen for transactions: {source}")]
    Listen {
        /// Underlying driver error.
        #[source]
        source: DriverError,
    },
    /// The reactor failed irrecoverably.
    #[error("event dispatch failed: {source}")]
    Reactor {
        /// Underlying polling error.
        #[source]
        source: io::Error,
    },
}
