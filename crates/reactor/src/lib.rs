#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `ark-reactor` is the event-dispatch boundary of the ark daemon: a
//! single-threaded readiness-plus-timer multiplexer behind the [`Reactor`]
//! trait. The daemon core registers interest in file-descriptor readability
//! and in deadline expiry, then blocks in [`Reactor::wait`] for the next
//! [`Wake`], which it routes by [`Token`].
//!
//! # Design
//!
//! Registrations are keyed by caller-chosen tokens rather than stored
//! callbacks; re-registering a token replaces the previous registration, so
//! "the second registration supersedes the first" is the explicit contract
//! rather than an accident of pointer overwrites. [`PollReactor`] is the
//! stock implementation over `poll(2)` used by the `arkd` binary and the
//! test suite; the core only ever sees the trait.
//!
//! # Invariants
//!
//! - At most one registration exists per token; timers and fd watches share
//!   the token namespace but not the registration tables.
//! - [`Reactor::wait`] delivers exactly one wake per call and never spins:
//!   with nothing registered it fails instead of blocking forever.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Routing identifier attached to a registration.
///
/// The daemon encodes the wake source (connection, stream, subprocess pipe,
/// per-phase timer) in the token value; the reactor treats it as opaque.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Token(pub u64);

/// One delivered readiness or timer event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wake {
    /// The file descriptor registered under this token became readable.
    Readable(Token),
    /// The timer registered under this token expired.
    Timer(Token),
}

/// Single-threaded readiness and timer dispatch.
///
/// All methods are non-blocking except [`Reactor::wait`]. Implementations
/// are not required to be thread-safe; the daemon drives one reactor from
/// one thread.
pub trait Reactor {
    /// Registers `fd` for readability under `token`, replacing any previous
    /// registration of the same token.
    fn watch_readable(&mut self, fd: RawFd, token: Token) -> io::Result<()>;

    /// Removes the fd watch registered under `token`, if any.
    fn unwatch(&mut self, token: Token);

    /// Removes every watch referring to `fd`. Must be called before the
    /// descriptor is closed, otherwise the reactor may poll a recycled fd.
    fn unwatch_fd(&mut self, fd: RawFd);

    /// Arms a one-shot timer firing `after` from now, replacing any timer
    /// previously armed under the same token.
    fn arm_timer(&mut self, after: Duration, token: Token);

    /// Cancels the timer armed under `token`, if any.
    fn disarm_timer(&mut self, token: Token);

    /// Blocks until the next readiness or timer event and returns it.
    ///
    /// # Errors
    ///
    /// Fails with [`io::ErrorKind::WouldBlock`] when nothing is registered
    /// (waiting would never return), or with the underlying polling error.
    fn wait(&mut self) -> io::Result<Wake>;
}

#[cfg(unix)]
mod poll;

#[cfg(unix)]
pub use poll::PollReactor;

pub(crate) fn nothing_registered() -> io::Error {
    io::Error::new(
        io::ErrorKind::WouldBlock,
        "no readiness sources or timers registered",
    )
}

pub(crate) fn saturating_poll_timeout(deadline: Instant, now: Instant) -> i32 {
    let remaining = deadline.saturating_duration_since(now);
    i32::try_from(remaining.as_millis().saturating_add(1)).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_timeout_rounds_up_and_saturates() {
        let now = Instant::now();
        assert_eq!(saturating_poll_timeout(now, now), 1);

        let later = now + Duration::from_millis(250);
        let timeout = saturating_poll_timeout(later, now);
        assert!((250..=251).contains(&timeout));

        let far = now + Duration::from_secs(1 << 40);
        assert_eq!(saturating_poll_timeout(far, now), i32::MAX);
    }
}
