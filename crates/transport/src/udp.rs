//! Direct-datagram backend.
//!
//! Every packet travels in its own datagram, framed with a header line
//! carrying the association handle and a monotonically increasing sequence
//! number; there is no persistent connection state beyond the one shared
//! socket. Requests must originate from a privileged port and carry a
//! `SECURITY USER` claim checked against the authorized-user list. Data
//! streams are side-band TCP connections: the daemon binds an ephemeral
//! listener per stream and advertises its port number as the handle, and
//! the connecting peer's address is verified against the association before
//! the stream becomes usable.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use ark_protocol::{
    Packet, PacketKind, PROTOCOL_REVISION, format_datagram_header, parse_datagram_header,
    parse_security_claim, take_line,
};

use crate::{
    Accepted, Authorizer, Connection, DriverError, DriverEvent, Listener, StreamId,
    require_privileged_port,
};

/// Default port the daemon listens on for the datagram backend.
pub const DEFAULT_PORT: u16 = 10080;

/// Largest datagram the backend will receive: a full packet plus framing.
const MAX_DATAGRAM: usize = ark_protocol::MAX_PACKET_LEN + 256;

/// Bounded wait for the peer's TCP connection during stream accept.
const STREAM_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

const STREAM_READ_CHUNK: usize = 32 * 1024;

/// Listening side of the datagram backend.
pub struct UdpDriverListener {
    bind_addr: SocketAddr,
    auth: Authorizer,
    socket: Option<UdpSocket>,
}

impl UdpDriverListener {
    /// Creates a listener for `bind_addr` admitting the given users.
    #[must_use]
    pub fn new(bind_addr: SocketAddr, auth: Authorizer) -> Self {
        Self {
            bind_addr,
            auth,
            socket: None,
        }
    }

    /// Creates a listener on the default address and port.
    #[must_use]
    pub fn on_default_port(auth: Authorizer) -> Self {
        Self::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            auth,
        )
    }
}

impl Listener for UdpDriverListener {
    fn open(&mut self) -> Result<(), DriverError> {
        let domain = Domain::for_address(self.bind_addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .and_then(|socket| {
                socket.set_reuse_address(true)?;
                socket.bind(&self.bind_addr.into())?;
                Ok(socket)
            })
            .map_err(|source| DriverError::Bind {
                addr: self.bind_addr.to_string(),
                source,
            })?;

        info!(addr = %self.bind_addr, "datagram driver listening");
        self.socket = Some(socket.into());
        Ok(())
    }

    fn fd(&self) -> RawFd {
        self.socket.as_ref().map_or(-1, UdpSocket::as_raw_fd)
    }

    fn accept(&mut self) -> Result<Option<Accepted>, DriverError> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            DriverError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "datagram socket is not open",
            ))
        })?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            warn!(%src, "dropping non-UTF-8 datagram");
            return Ok(None);
        };

        let (header_line, rest) = take_line(text);
        let header = parse_datagram_header(header_line)?;
        if header.revision != PROTOCOL_REVISION {
            warn!(%src, revision = header.revision, "dropping datagram with foreign revision");
            return Ok(None);
        }

        let (claim_line, after_claim) = take_line(rest);
        let claim = parse_security_claim(claim_line);
        let packet_text = if claim.is_some() { after_claim } else { rest };

        let packet = Packet::parse(packet_text)?;
        if packet.kind() != PacketKind::Req {
            debug!(%src, kind = %packet.kind(), "ignoring non-request datagram while idle");
            return Ok(None);
        }

        require_privileged_port(src.port())?;
        let user = self.auth.verify(claim)?;

        let connection = UdpConnection {
            socket: socket.try_clone()?,
            peer: src,
            peer_name: user,
            handle: header.handle.to_owned(),
            claim: None,
            last_peer_seq: header.sequence,
            send_seq: 0,
            streams: HashMap::new(),
        };

        Ok(Some(Accepted {
            connection: Box::new(connection),
            initial: vec![DriverEvent::Packet(packet)],
        }))
    }
}

/// Opens an outbound datagram association to `host:port`, claiming `user`.
///
/// The client half of the backend: binds a reserved source port so the far
/// daemon's privileged-port check passes, picks a fresh association handle,
/// and attaches the `SECURITY USER` claim to the first packet sent.
pub fn connect(host: IpAddr, port: u16, user: &str) -> Result<Box<dyn Connection>, DriverError> {
    let remote = SocketAddr::new(host, port);
    let socket = crate::tcp::reserved_socket(
        Domain::for_address(remote),
        Type::DGRAM,
        Protocol::UDP,
    )?;
    let socket: UdpSocket = socket.into();

    Ok(Box::new(UdpConnection {
        socket,
        peer: remote,
        peer_name: remote.to_string(),
        handle: fresh_handle(),
        claim: Some(user.to_owned()),
        last_peer_seq: 0,
        send_seq: 0,
        streams: HashMap::new(),
    }))
}

/// Association handles never repeat across daemon invocations in practice:
/// the pid changes per process and the clock only moves forward.
fn fresh_handle() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |since| since.subsec_nanos());
    format!("{:04x}{:08x}", std::process::id() & 0xffff, nanos)
}

struct UdpStreamSlot {
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    local_open: bool,
    remote_open: bool,
}

/// One datagram association, bound to the peer that sent the admitted `REQ`
/// (or, on the client side, to the daemon being addressed).
struct UdpConnection {
    socket: UdpSocket,
    peer: SocketAddr,
    peer_name: String,
    handle: String,
    /// `SECURITY USER` claim attached to the first outbound packet.
    claim: Option<String>,
    last_peer_seq: u64,
    send_seq: u64,
    streams: HashMap<u32, UdpStreamSlot>,
}

impl UdpConnection {
    fn handle_datagram(&mut self, events: &mut Vec<DriverEvent>) -> Result<(), DriverError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, src) = match self.socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let Ok(text) = std::str::from_utf8(&buf[..len]) else {
            warn!(%src, "dropping non-UTF-8 datagram");
            return Ok(());
        };
        let (header_line, rest) = take_line(text);
        let Ok(header) = parse_datagram_header(header_line) else {
            warn!(%src, "dropping datagram with malformed header");
            return Ok(());
        };

        let (claim_line, after_claim) = take_line(rest);
        let packet_text = if parse_security_claim(claim_line).is_some() {
            after_claim
        } else {
            rest
        };
        let Ok(packet) = Packet::parse(packet_text) else {
            warn!(%src, "dropping undecodable datagram");
            return Ok(());
        };

        if src != self.peer || header.handle != self.handle {
            events.push(DriverEvent::Stray {
                from: src.to_string(),
                kind: packet.kind(),
            });
            return Ok(());
        }

        // Retransmissions repeat the original sequence number; anything
        // older is stale and dropped.
        if header.sequence < self.last_peer_seq {
            debug!(seq = header.sequence, "dropping stale datagram");
            return Ok(());
        }
        self.last_peer_seq = header.sequence;
        events.push(DriverEvent::Packet(packet));
        Ok(())
    }

    fn handle_stream_readable(
        &mut self,
        fd: RawFd,
        events: &mut Vec<DriverEvent>,
    ) -> Result<(), DriverError> {
        let Some((&id, slot)) = self
            .streams
            .iter_mut()
            .find(|(_, slot)| slot.stream.as_ref().is_some_and(|s| s.as_raw_fd() == fd))
        else {
            debug!(fd, "readiness for an unknown descriptor");
            return Ok(());
        };
        let Some(stream) = slot.stream.as_mut() else {
            return Ok(());
        };

        let mut buf = vec![0u8; STREAM_READ_CHUNK];
        match stream.read(&mut buf) {
            Ok(0) => {
                slot.remote_open = false;
                events.push(DriverEvent::StreamEof(StreamId(id)));
            }
            Ok(n) => {
                buf.truncate(n);
                events.push(DriverEvent::StreamData(StreamId(id), buf));
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn slot_mut(&mut self, id: StreamId) -> Result<&mut UdpStreamSlot, DriverError> {
        self.streams
            .get_mut(&id.0)
            .ok_or(DriverError::StreamState { id: id.0 })
    }
}

impl Connection for UdpConnection {
    fn peer_name(&self) -> &str {
        &self.peer_name
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<(), DriverError> {
        self.send_seq += 1;
        let mut wire = format_datagram_header(&self.handle, self.send_seq);
        if let Some(user) = self.claim.take() {
            wire.push_str(&ark_protocol::format_security_claim(&user));
        }
        wire.push_str(&packet.to_wire());
        self.socket.send_to(wire.as_bytes(), self.peer)?;
        Ok(())
    }

    fn stream_listen(&mut self) -> Result<StreamId, DriverError> {
        let bind_ip = self
            .socket
            .local_addr()
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |addr| addr.ip());
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, 0))?;
        let port = listener.local_addr()?.port();

        self.streams.insert(
            u32::from(port),
            UdpStreamSlot {
                listener: Some(listener),
                stream: None,
                local_open: true,
                remote_open: true,
            },
        );
        Ok(StreamId(u32::from(port)))
    }

    fn stream_connect(&mut self, handle: i64) -> Result<StreamId, DriverError> {
        let port = u16::try_from(handle).map_err(|_| DriverError::StreamState {
            id: handle.max(0) as u32,
        })?;
        let remote = SocketAddr::new(self.peer.ip(), port);
        let socket =
            crate::tcp::reserved_socket(Domain::for_address(remote), Type::STREAM, Protocol::TCP)?;
        socket.connect(&remote.into())?;

        self.streams.insert(
            u32::from(port),
            UdpStreamSlot {
                listener: None,
                stream: Some(socket.into()),
                local_open: true,
                remote_open: true,
            },
        );
        Ok(StreamId(u32::from(port)))
    }

    fn stream_accept(&mut self, id: StreamId) -> Result<(), DriverError> {
        let peer_ip = self.peer.ip();
        let slot = self.slot_mut(id)?;
        let listener = slot
            .listener
            .take()
            .ok_or(DriverError::StreamState { id: id.0 })?;

        if !wait_readable(listener.as_raw_fd(), STREAM_ACCEPT_TIMEOUT)? {
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer did not connect the stream in time",
            )));
        }

        let (stream, remote) = listener.accept()?;
        if remote.ip() != peer_ip {
            return Err(DriverError::StreamVerification {
                peer: remote.to_string(),
            });
        }

        slot.stream = Some(stream);
        Ok(())
    }

    fn stream_write(&mut self, id: StreamId, bytes: &[u8]) -> Result<(), DriverError> {
        let slot = self.slot_mut(id)?;
        if !slot.local_open {
            return Err(DriverError::StreamState { id: id.0 });
        }
        let stream = slot
            .stream
            .as_mut()
            .ok_or(DriverError::StreamState { id: id.0 })?;
        stream.write_all(bytes)?;
        Ok(())
    }

    fn stream_close(&mut self, id: StreamId) -> Result<(), DriverError> {
        let slot = self.slot_mut(id)?;
        slot.local_open = false;
        if let Some(stream) = slot.stream.as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
        if !slot.remote_open {
            self.streams.remove(&id.0);
        }
        Ok(())
    }

    fn end_transaction(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn needs_end_marker(&self) -> bool {
        false
    }

    fn readable_fds(&self) -> Vec<RawFd> {
        let mut fds = vec![self.socket.as_raw_fd()];
        fds.extend(
            self.streams
                .values()
                .filter(|slot| slot.remote_open)
                .filter_map(|slot| slot.stream.as_ref().map(TcpStream::as_raw_fd)),
        );
        fds
    }

    fn on_readable(
        &mut self,
        fd: RawFd,
        events: &mut Vec<DriverEvent>,
    ) -> Result<(), DriverError> {
        if fd == self.socket.as_raw_fd() {
            self.handle_datagram(events)
        } else {
            self.handle_stream_readable(fd, events)
        }
    }
}

/// Waits for `fd` to become readable within `timeout`; the accept-side
/// bounded wait of the stream handshake.
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let millis = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX);
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `pollfd` is a valid single-element array for the call.
        let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener_on_loopback(users: &[&str]) -> (UdpDriverListener, SocketAddr) {
        let mut listener = UdpDriverListener::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            Authorizer::new(users.iter().map(|u| (*u).to_owned()).collect()),
        );
        listener.open().expect("open");
        let addr = listener
            .socket
            .as_ref()
            .expect("socket")
            .local_addr()
            .expect("addr");
        (listener, addr)
    }

    fn request_datagram(handle: &str, seq: u64, user: &str, body: &str) -> String {
        let mut wire = format_datagram_header(handle, seq);
        wire.push_str(&ark_protocol::format_security_claim(user));
        wire.push_str("REQ\n");
        wire.push_str(body);
        wire
    }

    #[test]
    fn alien_datagrams_never_admit_a_connection() {
        let (mut listener, addr) = listener_on_loopback(&["backup"]);
        let client = UdpSocket::bind("127.0.0.1:0").expect("bind");

        // Garbled header.
        client.send_to(b"hello world\n", addr).expect("send");
        assert!(listener.accept().is_err());

        // Valid framing but a non-request kind.
        let mut wire = format_datagram_header("abc123", 1);
        wire.push_str("ACK\n");
        client.send_to(wire.as_bytes(), addr).expect("send");
        assert!(listener.accept().expect("no admission").is_none());
    }

    #[test]
    fn unprivileged_request_is_rejected() {
        let (mut listener, addr) = listener_on_loopback(&["backup"]);
        let client = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let wire = request_datagram("abc123", 1, "backup", "SERVICE noop \n");
        client.send_to(wire.as_bytes(), addr).expect("send");

        let err = listener.accept().unwrap_err();
        assert!(matches!(err, DriverError::UnprivilegedPort { .. }));
    }

    #[test]
    fn unknown_user_is_rejected_before_admission() {
        let (mut listener, addr) = listener_on_loopback(&[]);
        let client = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let wire = request_datagram("abc123", 1, "backup", "SERVICE noop \n");
        client.send_to(wire.as_bytes(), addr).expect("send");

        let err = listener.accept().unwrap_err();
        // The privileged-port gate fires first for ephemeral test ports;
        // both paths must reject without admitting.
        assert!(err.is_admission_failure());
    }

    #[test]
    fn association_filters_stale_foreign_and_duplicate_datagrams() {
        let daemon_sock = UdpSocket::bind("127.0.0.1:0").expect("bind daemon");
        let peer_sock = UdpSocket::bind("127.0.0.1:0").expect("bind peer");
        let daemon_addr = daemon_sock.local_addr().expect("daemon addr");

        let mut conn = UdpConnection {
            socket: daemon_sock.try_clone().expect("clone socket"),
            peer: peer_sock.local_addr().expect("peer addr"),
            peer_name: "backup".to_owned(),
            handle: "abc123".to_owned(),
            claim: None,
            last_peer_seq: 5,
            send_seq: 0,
            streams: HashMap::new(),
        };

        let send = |header: String, rest: &str| {
            let mut wire = header;
            wire.push_str(rest);
            peer_sock
                .send_to(wire.as_bytes(), daemon_addr)
                .expect("send datagram");
        };

        // A reused (older) sequence number is dropped silently.
        send(format_datagram_header("abc123", 4), "ACK\n");
        let mut events = Vec::new();
        conn.handle_datagram(&mut events).expect("drain");
        assert!(events.is_empty(), "stale datagram must be dropped");

        // A retransmission repeats the current sequence and is delivered.
        send(format_datagram_header("abc123", 5), "REQ\nSERVICE noop \n");
        conn.handle_datagram(&mut events).expect("drain");
        assert!(matches!(
            events.as_slice(),
            [DriverEvent::Packet(pkt)] if pkt.kind() == PacketKind::Req
        ));
        events.clear();

        // A foreign handle surfaces as a stray for the daemon to log.
        send(format_datagram_header("ffff00", 6), "ACK\n");
        conn.handle_datagram(&mut events).expect("drain");
        assert!(matches!(events.as_slice(), [DriverEvent::Stray { .. }]));
    }

    #[test]
    fn wait_readable_times_out_on_silent_descriptor() {
        let quiet = TcpListener::bind("127.0.0.1:0").expect("bind");
        let ready = wait_readable(quiet.as_raw_fd(), Duration::from_millis(25)).expect("poll");
        assert!(!ready);
    }
}
