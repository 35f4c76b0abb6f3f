//! Data-channel bindings and the control-header ordering policy.
//!
//! A [`DataChannel`] pairs one logical channel name with the subprocess pipe
//! ends wired at launch and, once the reply's `CONNECT` line has been
//! rewritten, with the network stream the peer connects back to. Relay runs
//! until either side reaches EOF or a write fails, at which point both sides
//! close together.

use std::fs::File;

use ark_transport::StreamId;

use crate::supervisor::{AuxPipes, CHANNEL_NAMES};

/// The control-channel line marking the end of backup header metadata.
///
/// Remote dumper programs assume the control channel has delivered the full
/// header before any primary data arrives, so backup-type services hold the
/// data channel until this marker has been seen.
pub const HEADER_SENTINEL: &[u8] = b"sendbackup: info end\n";

/// When a channel's subprocess-side relay may start.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataOrdering {
    /// Relay from the first byte.
    Immediate,
    /// Hold until the control channel has carried [`HEADER_SENTINEL`].
    AfterControlHeader,
}

/// One logical channel binding.
#[derive(Debug)]
pub struct DataChannel {
    /// Channel name as announced in `CONNECT` lines.
    pub name: &'static str,
    /// Stream the peer connects back to, assigned during reply processing.
    pub stream: Option<StreamId>,
    /// Pipe carrying subprocess output toward the network.
    pub from_child: Option<File>,
    /// Pipe carrying network input toward the subprocess.
    pub to_child: Option<File>,
    /// Ordering policy for the subprocess-side relay.
    pub ordering: DataOrdering,
    /// Set once both sides are closed and the binding is dead.
    pub finished: bool,
}

impl DataChannel {
    /// Builds the binding for channel `index` from the launched process's
    /// pipe ends.
    #[must_use]
    pub fn from_aux(index: usize, pipes: AuxPipes, ordering: DataOrdering) -> Self {
        Self {
            name: CHANNEL_NAMES[index],
            stream: None,
            from_child: pipes.from_child,
            to_child: pipes.to_child,
            ordering,
            finished: false,
        }
    }

    /// Whether the binding is live: bound to a stream and not yet torn down.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.finished && self.stream.is_some()
    }
}

/// Incremental scanner for [`HEADER_SENTINEL`] on the control channel.
///
/// The sentinel may straddle read boundaries, so the scanner keeps a tail of
/// the previous chunk; scanning stops for good at the first sighting.
#[derive(Debug, Default)]
pub struct SentinelScanner {
    seen: bool,
    tail: Vec<u8>,
}

impl SentinelScanner {
    /// Creates a scanner that has not seen the sentinel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the sentinel has been observed.
    #[must_use]
    pub fn seen(&self) -> bool {
        self.seen
    }

    /// Feeds one control-channel chunk; returns `true` exactly once, on the
    /// read that completes the sentinel.
    pub fn observe(&mut self, chunk: &[u8]) -> bool {
        if self.seen {
            return false;
        }

        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);

        if memchr::memmem::find(&window, HEADER_SENTINEL).is_some() {
            self.seen = true;
            return true;
        }

        let keep = window.len().min(HEADER_SENTINEL.len() - 1);
        self.tail = window.split_off(window.len() - keep);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_found_in_a_single_chunk() {
        let mut scanner = SentinelScanner::new();
        assert!(scanner.observe(b"header line\nsendbackup: info end\ndata"));
        assert!(scanner.seen());
    }

    #[test]
    fn sentinel_found_across_every_split_point() {
        let text = b"some header\nsendbackup: info end\n";
        for split in 0..text.len() {
            let mut scanner = SentinelScanner::new();
            let first = scanner.observe(&text[..split]);
            let second = scanner.observe(&text[split..]);
            assert!(
                first ^ second,
                "sentinel must be reported exactly once (split {split})"
            );
        }
    }

    #[test]
    fn scanner_reports_only_the_first_sighting() {
        let mut scanner = SentinelScanner::new();
        assert!(scanner.observe(HEADER_SENTINEL));
        assert!(!scanner.observe(HEADER_SENTINEL));
        assert!(scanner.seen());
    }

    #[test]
    fn unrelated_text_never_triggers() {
        let mut scanner = SentinelScanner::new();
        assert!(!scanner.observe(b"sendbackup: info start\n"));
        assert!(!scanner.observe(b"plain output\n"));
        assert!(!scanner.seen());
    }
}
