//! `poll(2)`-backed [`Reactor`] implementation.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::{Reactor, Token, Wake, nothing_registered, saturating_poll_timeout};

struct FdWatch {
    fd: RawFd,
    token: Token,
}

struct TimerEntry {
    deadline: Instant,
    token: Token,
}

/// Stock single-threaded reactor over `poll(2)` with a sorted deadline list.
///
/// Fd readiness is served round-robin so a chatty descriptor cannot starve
/// the others; timers fire in deadline order.
#[derive(Default)]
pub struct PollReactor {
    watches: Vec<FdWatch>,
    timers: Vec<TimerEntry>,
    next_fd: usize,
}

impl PollReactor {
    /// Creates an empty reactor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn due_timer(&mut self, now: Instant) -> Option<Token> {
        let idx = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.deadline <= now)
            .min_by_key(|(_, entry)| entry.deadline)
            .map(|(idx, _)| idx)?;
        Some(self.timers.swap_remove(idx).token)
    }

    fn nearest_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|entry| entry.deadline).min()
    }
}

impl Reactor for PollReactor {
    fn watch_readable(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "negative file descriptor",
            ));
        }
        self.unwatch(token);
        self.watches.push(FdWatch { fd, token });
        Ok(())
    }

    fn unwatch(&mut self, token: Token) {
        self.watches.retain(|watch| watch.token != token);
    }

    fn unwatch_fd(&mut self, fd: RawFd) {
        self.watches.retain(|watch| watch.fd != fd);
    }

    fn arm_timer(&mut self, after: Duration, token: Token) {
        self.disarm_timer(token);
        self.timers.push(TimerEntry {
            deadline: Instant::now() + after,
            token,
        });
    }

    fn disarm_timer(&mut self, token: Token) {
        self.timers.retain(|entry| entry.token != token);
    }

    fn wait(&mut self) -> io::Result<Wake> {
        loop {
            let now = Instant::now();
            if let Some(token) = self.due_timer(now) {
                return Ok(Wake::Timer(token));
            }
            if self.watches.is_empty() && self.timers.is_empty() {
                return Err(nothing_registered());
            }

            let timeout = match self.nearest_deadline() {
                Some(deadline) => saturating_poll_timeout(deadline, now),
                None => -1,
            };

            let mut pollfds: Vec<libc::pollfd> = self
                .watches
                .iter()
                .map(|watch| libc::pollfd {
                    fd: watch.fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();

            // SAFETY: `pollfds` is a live, correctly sized array for the
            // duration of the call.
            let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if rc == 0 {
                // Deadline passed; the due timer is collected on the next
                // loop iteration.
                continue;
            }

            // Round-robin over ready descriptors. POLLHUP/POLLERR count as
            // readable so EOF and error conditions surface as zero-length
            // reads at the owner.
            let len = pollfds.len();
            for offset in 0..len {
                let idx = (self.next_fd + offset) % len;
                let revents = pollfds[idx].revents;
                if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                    self.next_fd = (idx + 1) % len;
                    return Ok(Wake::Readable(self.watches[idx].token));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn wait_without_registrations_refuses_to_block() {
        let mut reactor = PollReactor::new();
        let err = reactor.wait().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn timer_fires_after_deadline() {
        let mut reactor = PollReactor::new();
        reactor.arm_timer(Duration::from_millis(10), Token(7));
        let start = Instant::now();
        assert_eq!(reactor.wait().expect("timer wake"), Wake::Timer(Token(7)));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn rearming_a_timer_supersedes_the_previous_deadline() {
        let mut reactor = PollReactor::new();
        reactor.arm_timer(Duration::from_secs(60), Token(7));
        reactor.arm_timer(Duration::from_millis(5), Token(7));
        assert_eq!(reactor.wait().expect("timer wake"), Wake::Timer(Token(7)));
        assert!(reactor.timers.is_empty());
    }

    #[test]
    fn readable_fd_wakes_with_its_token() {
        let (mut tx, rx) = UnixStream::pair().expect("socketpair");
        let mut reactor = PollReactor::new();
        reactor
            .watch_readable(rx.as_raw_fd(), Token(3))
            .expect("watch");
        tx.write_all(b"x").expect("write");
        assert_eq!(
            reactor.wait().expect("readable wake"),
            Wake::Readable(Token(3))
        );
    }

    #[test]
    fn rewatching_a_token_replaces_the_fd() {
        let (mut tx_a, rx_a) = UnixStream::pair().expect("socketpair");
        let (_tx_b, rx_b) = UnixStream::pair().expect("socketpair");
        let mut reactor = PollReactor::new();
        reactor
            .watch_readable(rx_a.as_raw_fd(), Token(3))
            .expect("watch");
        reactor
            .watch_readable(rx_b.as_raw_fd(), Token(3))
            .expect("rewatch");
        assert_eq!(reactor.watches.len(), 1);

        // Data on the superseded descriptor must not wake token 3.
        tx_a.write_all(b"x").expect("write");
        reactor.arm_timer(Duration::from_millis(20), Token(9));
        assert_eq!(reactor.wait().expect("wake"), Wake::Timer(Token(9)));
    }

    #[test]
    fn hangup_counts_as_readable() {
        let (tx, rx) = UnixStream::pair().expect("socketpair");
        let mut reactor = PollReactor::new();
        reactor
            .watch_readable(rx.as_raw_fd(), Token(4))
            .expect("watch");
        drop(tx);
        assert_eq!(
            reactor.wait().expect("hup wake"),
            Wake::Readable(Token(4))
        );
    }

    #[test]
    fn unwatch_fd_drops_all_watches_for_the_descriptor() {
        let (_tx, rx) = UnixStream::pair().expect("socketpair");
        let mut reactor = PollReactor::new();
        reactor
            .watch_readable(rx.as_raw_fd(), Token(1))
            .expect("watch");
        reactor.unwatch_fd(rx.as_raw_fd());
        assert!(reactor.watches.is_empty());
    }
}
