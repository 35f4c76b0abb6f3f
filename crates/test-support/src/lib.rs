#![deny(missing_docs)]

//! Shared test fixtures for the ark workspace: throwaway service scripts
//! and a scripted in-memory transport connection for exercising the
//! dispatcher without sockets.

use std::collections::HashSet;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use ark_protocol::{Packet, PacketKind};
use ark_transport::{Connection, DriverError, DriverEvent, StreamId};

/// A temporary executable service script.
///
/// The backing directory lives as long as this value; dropping it removes
/// the script.
#[derive(Debug)]
pub struct ServiceScript {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl ServiceScript {
    /// Path of the executable script.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the script lives in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.path.parent().expect("script has a parent directory")
    }
}

/// Writes `contents` as an executable script named `name` in a fresh
/// temporary directory.
///
/// # Panics
///
/// Panics on filesystem errors; fixtures have no error surface.
#[must_use]
pub fn service_script(name: &str, contents: &str) -> ServiceScript {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("mark script executable");
    ServiceScript { _dir: dir, path }
}

/// Scripted in-memory [`Connection`] recording everything the dispatcher
/// does to it.
#[derive(Debug, Default)]
pub struct ScriptedConnection {
    /// Packets sent over the association, in order.
    pub sent: Vec<Packet>,
    /// Bytes written per stream id.
    pub stream_writes: Vec<(u32, Vec<u8>)>,
    /// Streams the dispatcher closed, in order.
    pub closed_streams: Vec<u32>,
    /// Streams the dispatcher accepted, in order.
    pub accepted_streams: Vec<u32>,
    /// How often `end_transaction` ran.
    pub end_transactions: usize,
    /// Zero-based `stream_listen` call indices that must fail.
    pub fail_listen_calls: HashSet<usize>,
    /// Stream ids whose accept must fail verification.
    pub fail_accept_ids: HashSet<u32>,
    /// Whether `send_packet` fails.
    pub fail_sends: bool,
    /// Reported end-marker policy.
    pub end_marker_policy: bool,
    listen_calls: usize,
    next_stream: u32,
}

impl ScriptedConnection {
    /// Creates a connection with stream ids starting at `first_stream_id`.
    #[must_use]
    pub fn new(first_stream_id: u32) -> Self {
        Self {
            next_stream: first_stream_id,
            ..Self::default()
        }
    }

    /// Kinds of the packets sent so far.
    #[must_use]
    pub fn sent_kinds(&self) -> Vec<PacketKind> {
        self.sent.iter().map(Packet::kind).collect()
    }

    /// Concatenated bytes written to `stream`.
    #[must_use]
    pub fn stream_bytes(&self, stream: u32) -> Vec<u8> {
        self.stream_writes
            .iter()
            .filter(|(id, _)| *id == stream)
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect()
    }
}

impl Connection for ScriptedConnection {
    fn peer_name(&self) -> &str {
        "backup@client.example"
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), DriverError> {
        if self.fail_sends {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted send failure",
            )));
        }
        self.sent.push(packet.clone());
        Ok(())
    }

    fn stream_listen(&mut self) -> Result<StreamId, DriverError> {
        let call = self.listen_calls;
        self.listen_calls += 1;
        if self.fail_listen_calls.contains(&call) {
            return Err(DriverError::StreamVerification {
                peer: "scripted listen failure".to_owned(),
            });
        }
        let id = self.next_stream;
        self.next_stream += 1;
        Ok(StreamId(id))
    }

    fn stream_connect(&mut self, handle: i64) -> Result<StreamId, DriverError> {
        Ok(StreamId(handle.max(0) as u32))
    }

    fn stream_accept(&mut self, id: StreamId) -> Result<(), DriverError> {
        if self.fail_accept_ids.contains(&id.0) {
            return Err(DriverError::StreamVerification {
                peer: "scripted accept failure".to_owned(),
            });
        }
        self.accepted_streams.push(id.0);
        Ok(())
    }

    fn stream_write(&mut self, id: StreamId, bytes: &[u8]) -> Result<(), DriverError> {
        self.stream_writes.push((id.0, bytes.to_vec()));
        Ok(())
    }

    fn stream_close(&mut self, id: StreamId) -> Result<(), DriverError> {
        self.closed_streams.push(id.0);
        Ok(())
    }

    fn end_transaction(&mut self) -> Result<(), DriverError> {
        self.end_transactions += 1;
        Ok(())
    }

    fn needs_end_marker(&self) -> bool {
        self.end_marker_policy
    }

    fn readable_fds(&self) -> Vec<RawFd> {
        Vec::new()
    }

    fn on_readable(
        &mut self,
        _fd: RawFd,
        _events: &mut Vec<DriverEvent>,
    ) -> Result<(), DriverError> {
        Ok(())
    }
}
