//! TCP-multiplexed backend.
//!
//! One TCP connection carries the packet protocol and every data stream as
//! framed channels. Admission requires a privileged source port; the first
//! packet frame must open with an authorized `SECURITY USER` claim. This
//! backend needs the explicit end-of-transaction marker: without it the peer
//! keeps waiting for protocol traffic on a channel that now only carries
//! stream data.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::mux::{MuxConnection, MuxEndpoint};
use crate::{Accepted, Authorizer, Connection, DriverError, Listener, require_privileged_port};

/// Default port the daemon listens on for the TCP backend.
pub const DEFAULT_PORT: u16 = 10080;

const LISTEN_BACKLOG: i32 = 5;

/// Lowest port tried when binding a reserved source port for outbound
/// associations.
const RESERVED_PORT_FLOOR: u16 = 512;

/// Listening side of the TCP-multiplexed backend.
pub struct TcpDriverListener {
    bind_addr: SocketAddr,
    auth: Authorizer,
    listener: Option<TcpListener>,
}

impl TcpDriverListener {
    /// Creates a listener for `bind_addr` admitting the given users.
    #[must_use]
    pub fn new(bind_addr: SocketAddr, auth: Authorizer) -> Self {
        Self {
            bind_addr,
            auth,
            listener: None,
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

impl Listener for TcpDriverListener {
    fn open(&mut self) -> Result<(), DriverError> {
        let domain = Domain::for_address(self.bind_addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .and_then(|socket| {
                socket.set_reuse_address(true)?;
                socket.bind(&self.bind_addr.into())?;
                socket.listen(LISTEN_BACKLOG)?;
                Ok(socket)
            })
            .map_err(|source| DriverError::Bind {
                addr: self.bind_addr.to_string(),
                source,
            })?;

        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        info!(addr = %self.bind_addr, "tcp driver listening");
        self.listener = Some(listener);
        Ok(())
    }

    fn fd(&self) -> RawFd {
        self.listener
            .as_ref()
            .map_or(-1, |listener| listener.as_raw_fd())
    }

    fn accept(&mut self) -> Result<Option<Accepted>, DriverError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| DriverError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener is not open",
            )))?;

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        require_privileged_port(peer.port())?;
        stream.set_nonblocking(false)?;

        let connection = MuxConnection::inbound_tcp(stream, peer.to_string(), self.auth.clone());
        Ok(Some(Accepted {
            connection: Box::new(connection),
            initial: Vec::new(),
        }))
    }
}

/// Opens an outbound association to `host:port`, claiming `user`.
///
/// The client half of the backend: binds a reserved source port so the far
/// daemon's privileged-port check passes, then sends the `SECURITY USER`
/// claim with the first packet.
pub fn connect(host: IpAddr, port: u16, user: &str) -> Result<Box<dyn Connection>, DriverError> {
    let remote = SocketAddr::new(host, port);
    let socket = reserved_socket(Domain::for_address(remote), Type::STREAM, Protocol::TCP)?;
    socket.connect(&remote.into())?;
    let stream: TcpStream = socket.into();

    Ok(Box::new(MuxConnection::outbound(
        MuxEndpoint::Tcp(stream),
        remote.to_string(),
        Some(user.to_owned()),
        true,
    )))
}

/// Binds a socket to the first free reserved port, scanning downward the way
/// `rresvport` does.
pub(crate) fn reserved_socket(
    domain: Domain,
    kind: Type,
    protocol: Protocol,
) -> Result<Socket, DriverError> {
    let unspecified: IpAddr = if domain == Domain::IPV6 {
        IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };

    let mut last_err: Option<io::Error> = None;
    for port in (RESERVED_PORT_FLOOR..=crate::MAX_PRIVILEGED_PORT).rev() {
        let socket = Socket::new(domain, kind, Some(protocol))?;
        let addr = SocketAddr::new(unspecified, port);
        match socket.bind(&addr.into()) {
            Ok(()) => return Ok(socket),
            Err(err) => last_err = Some(err),
        }
    }

    Err(DriverError::Bind {
        addr: "reserved port range".to_owned(),
        source: last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "range exhausted")),
    })
}
