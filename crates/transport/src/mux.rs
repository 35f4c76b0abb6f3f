//! Connection plumbing shared by the TCP and shell-tunnel backends.
//!
//! Both backends speak the channel framing of [`crate::frame`] over a single
//! byte pipe; they differ only in what the pipe is (a socket, a spawned
//! remote-shell client, or inherited stdio) and in the end-of-transaction
//! quirk policy.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ChildStdout};

use ark_protocol::{Packet, format_security_claim, parse_security_claim, take_line};
use tracing::{debug, warn};

use crate::frame::{FrameDecoder, MAX_FRAME_PAYLOAD, PACKET_CHANNEL, encode_frame};
use crate::{Authorizer, Connection, DriverError, DriverEvent, StreamId};

const READ_CHUNK: usize = 64 * 1024;

/// The byte pipe under a multiplexed connection.
pub(crate) enum MuxEndpoint {
    /// A connected TCP socket.
    Tcp(TcpStream),
    /// Pipes to a spawned remote-shell client.
    Child(ChildEndpoint),
    /// Pre-existing descriptor pair (the tunnelled sub-daemon's stdio).
    Pipes {
        input: File,
        output: File,
    },
}

pub(crate) struct ChildEndpoint {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
}

impl ChildEndpoint {
    pub(crate) fn new(mut child: Child) -> io::Result<Self> {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "remote shell stdout not piped")
        })?;
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }
}

impl Drop for ChildEndpoint {
    fn drop(&mut self) {
        // Closing stdin signals EOF to the tunnel; give the child a chance
        // to exit on its own before reclaiming it.
        drop(self.stdin.take());
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

impl MuxEndpoint {
    fn read_fd(&self) -> RawFd {
        match self {
            Self::Tcp(stream) => stream.as_raw_fd(),
            Self::Child(endpoint) => endpoint.stdout.as_raw_fd(),
            Self::Pipes { input, .. } => input.as_raw_fd(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Child(endpoint) => endpoint.stdout.read(buf),
            Self::Pipes { input, .. } => input.read(buf),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.write_all(bytes),
            Self::Child(endpoint) => match endpoint.stdin.as_mut() {
                Some(stdin) => stdin.write_all(bytes),
                None => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "remote shell stdin already closed",
                )),
            },
            Self::Pipes { output, .. } => output.write_all(bytes),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct StreamSlot {
    local_open: bool,
    remote_open: bool,
}

/// A connection multiplexing packets and data streams over one byte pipe.
pub struct MuxConnection {
    endpoint: MuxEndpoint,
    peer_name: String,
    /// Claim verification policy for the first inbound packet; `None` once
    /// verified or when the backend authenticates out of band.
    auth: Option<Authorizer>,
    /// Expected peer identity for claim agreement when no user list applies.
    expected_user: Option<String>,
    /// Claim to prepend to the first outbound packet (client side).
    outbound_claim: Option<String>,
    claim_checked: bool,
    decoder: FrameDecoder,
    streams: HashMap<u32, StreamSlot>,
    next_stream: u32,
    needs_end_marker: bool,
    end_marker_sent: bool,
    closed: bool,
}

impl MuxConnection {
    fn new(endpoint: MuxEndpoint, peer_name: String, needs_end_marker: bool) -> Self {
        Self {
            endpoint,
            peer_name,
            auth: None,
            expected_user: None,
            outbound_claim: None,
            claim_checked: false,
            decoder: FrameDecoder::new(),
            streams: HashMap::new(),
            next_stream: PACKET_CHANNEL + 1,
            needs_end_marker,
            end_marker_sent: false,
            closed: false,
        }
    }

    /// Inbound TCP association; the first packet must carry an authorized
    /// `SECURITY USER` claim.
    pub(crate) fn inbound_tcp(stream: TcpStream, peer: String, auth: Authorizer) -> Self {
        let mut conn = Self::new(MuxEndpoint::Tcp(stream), peer, true);
        conn.auth = Some(auth);
        conn
    }

    /// Inbound tunnel association over inherited stdio. The tunnel itself
    /// authenticated the peer; a claim, when present, must agree with the
    /// configured identity.
    pub(crate) fn inbound_stdio(
        input: File,
        output: File,
        expected_user: Option<String>,
    ) -> Self {
        let peer = expected_user.clone().unwrap_or_else(|| "tunnel".to_owned());
        let mut conn = Self::new(MuxEndpoint::Pipes { input, output }, peer, false);
        conn.expected_user = expected_user;
        conn
    }

    /// Outbound association (client side of either multiplexed backend).
    pub(crate) fn outbound(
        endpoint: MuxEndpoint,
        peer_name: String,
        claim: Option<String>,
        needs_end_marker: bool,
    ) -> Self {
        let mut conn = Self::new(endpoint, peer_name, needs_end_marker);
        conn.outbound_claim = claim;
        conn.claim_checked = true;
        conn
    }

    fn verify_claim<'a>(&mut self, text: &'a str) -> Result<&'a str, DriverError> {
        let (first_line, rest) = take_line(text);
        let claim = parse_security_claim(first_line);

        if let Some(auth) = self.auth.take() {
            let user = auth.verify(claim)?;
            self.peer_name = user;
            self.claim_checked = true;
            return Ok(rest);
        }

        self.claim_checked = true;
        match claim {
            Some(user) => {
                if let Some(expected) = self.expected_user.as_deref() {
                    if user != expected {
                        return Err(DriverError::UnauthorizedUser {
                            user: user.to_owned(),
                        });
                    }
                } else {
                    self.peer_name = user.to_owned();
                }
                Ok(rest)
            }
            None => Ok(text),
        }
    }

    fn dispatch_frame(
        &mut self,
        channel: u32,
        payload: Vec<u8>,
        events: &mut Vec<DriverEvent>,
    ) -> Result<(), DriverError> {
        if channel == PACKET_CHANNEL {
            if payload.is_empty() {
                // The peer's end-of-transaction marker. Remaining traffic on
                // this pipe is stream data only.
                debug!(peer = %self.peer_name, "peer closed the packet channel");
                return Ok(());
            }
            let text = String::from_utf8(payload).map_err(|_| {
                DriverError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "packet frame is not UTF-8",
                ))
            })?;
            let body = if self.claim_checked {
                text.as_str()
            } else {
                self.verify_claim(&text)?
            };
            events.push(DriverEvent::Packet(Packet::parse(body)?));
            return Ok(());
        }

        match self.streams.get_mut(&channel) {
            Some(slot) if slot.remote_open => {
                if payload.is_empty() {
                    slot.remote_open = false;
                    events.push(DriverEvent::StreamEof(StreamId(channel)));
                } else {
                    events.push(DriverEvent::StreamData(StreamId(channel), payload));
                }
            }
            _ => {
                warn!(channel, "dropping frame for unknown or closed stream");
            }
        }
        Ok(())
    }

    fn slot_mut(&mut self, id: StreamId) -> Result<&mut StreamSlot, DriverError> {
        self.streams
            .get_mut(&id.0)
            .ok_or(DriverError::StreamState { id: id.0 })
    }
}

impl Connection for MuxConnection {
    fn peer_name(&self) -> &str {
        &self.peer_name
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), DriverError> {
        let mut text = String::new();
        if let Some(claim) = self.outbound_claim.take() {
            text.push_str(&format_security_claim(&claim));
        }
        text.push_str(&packet.to_wire());
        self.endpoint
            .write_all(&encode_frame(PACKET_CHANNEL, text.as_bytes()))?;
        Ok(())
    }

    fn stream_listen(&mut self) -> Result<StreamId, DriverError> {
        let id = self.next_stream;
        self.next_stream += 1;
        self.streams.insert(
            id,
            StreamSlot {
                local_open: true,
                remote_open: true,
            },
        );
        Ok(StreamId(id))
    }

    fn stream_connect(&mut self, handle: i64) -> Result<StreamId, DriverError> {
        let id = u32::try_from(handle).map_err(|_| DriverError::StreamState {
            id: handle.max(0) as u32,
        })?;
        if id == PACKET_CHANNEL {
            return Err(DriverError::StreamState { id });
        }
        self.streams.insert(
            id,
            StreamSlot {
                local_open: true,
                remote_open: true,
            },
        );
        Ok(StreamId(id))
    }

    fn stream_accept(&mut self, id: StreamId) -> Result<(), DriverError> {
        // Virtual channels need no handshake; the peer simply starts
        // sending frames. Accepting merely validates the id.
        self.slot_mut(id).map(|_| ())
    }

    fn stream_write(&mut self, id: StreamId, bytes: &[u8]) -> Result<(), DriverError> {
        let slot = *self.slot_mut(id)?;
        if !slot.local_open {
            return Err(DriverError::StreamState { id: id.0 });
        }
        for chunk in bytes.chunks(MAX_FRAME_PAYLOAD) {
            self.endpoint.write_all(&encode_frame(id.0, chunk))?;
        }
        Ok(())
    }

    fn stream_close(&mut self, id: StreamId) -> Result<(), DriverError> {
        let slot = self.slot_mut(id)?;
        if slot.local_open {
            slot.local_open = false;
            self.endpoint.write_all(&encode_frame(id.0, &[]))?;
        }
        Ok(())
    }

    fn end_transaction(&mut self) -> Result<(), DriverError> {
        if self.needs_end_marker && !self.end_marker_sent {
            self.end_marker_sent = true;
            self.endpoint
                .write_all(&encode_frame(PACKET_CHANNEL, &[]))?;
        }
        Ok(())
    }

    fn needs_end_marker(&self) -> bool {
        self.needs_end_marker
    }

    fn readable_fds(&self) -> Vec<RawFd> {
        if self.closed {
            Vec::new()
        } else {
            vec![self.endpoint.read_fd()]
        }
    }

    fn on_readable(
        &mut self,
        _fd: RawFd,
        events: &mut Vec<DriverEvent>,
    ) -> Result<(), DriverError> {
        let mut buf = vec![0u8; READ_CHUNK];
        match self.endpoint.read(&mut buf) {
            Ok(0) => {
                self.closed = true;
                events.push(DriverEvent::Closed);
                return Ok(());
            }
            Ok(n) => self.decoder.extend(&buf[..n]),
            Err(err)
                if err.kind() == io::ErrorKind::Interrupted
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        while let Some(frame) = self.decoder.next_frame()? {
            self.dispatch_frame(frame.channel, frame.payload, events)?;
        }
        Ok(())
    }
}
