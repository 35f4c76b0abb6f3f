#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `ark-daemon` is the request-dispatch core of the ark backup daemon. It
//! accepts one authenticated protocol transaction at a time from a transport
//! driver, maps the requested service name onto a local subprocess, relays
//! the subprocess's pipes and its named auxiliary data channels over
//! transport streams, and drives the acknowledge/reply/retry handshake with
//! the remote peer.
//!
//! # Design
//!
//! Everything runs on one thread, cooperatively, around the reactor the
//! [`Daemon`] is built with:
//!
//! - [`txn`] holds the per-transaction state machine — an explicit state tag
//!   with per-state handlers, driven by packets, pipe readiness, and timer
//!   expiry.
//! - [`channel`] binds logical channel names to subprocess pipes and
//!   transport streams, including the control-header ordering policy for
//!   backup-type services.
//! - [`supervisor`] owns subprocess lifecycle: descriptor renumbering at
//!   launch, the single-transaction guard, and the SIGTERM-then-log soft
//!   teardown.
//! - [`services`] is the allow-list; [`config`] the key/value getter;
//!   [`reply`] the doubling reply buffer.
//!
//! # Invariants
//!
//! - At most one [`ActiveTransaction`] exists at any time; the slot on the
//!   daemon context and the supervisor guard both enforce it.
//! - There is never more than one pending packet expectation; re-arming a
//!   timeout replaces the previous one.
//! - Failures before the subprocess launches yield one `NAK` and no
//!   subprocess; failures after launch are folded into the reply body.

pub mod channel;
pub mod config;
mod daemon;
mod error;
pub mod reply;
pub mod services;
pub mod supervisor;
mod tokens;
pub mod txn;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{DaemonError, TxnError};
pub use services::{ServiceEntry, ServiceKind, ServiceTable};
pub use supervisor::Supervisor;
pub use txn::{ActiveTransaction, Flow, TxnCtx, TxnEvent, TxnState};
