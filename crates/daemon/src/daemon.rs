//! The daemon context and its single-threaded run loop.
//!
//! One [`Daemon`] owns the transport listener, the service table, the
//! supervisor, and the at-most-one active association and transaction. All
//! shared mutable state lives here and is touched only from the run loop:
//! one wake is processed to completion, including every state transition it
//! triggers, before the next is taken from the reactor.

use std::os::fd::RawFd;

use ark_protocol::Packet;
use ark_reactor::{Reactor, Wake};
use ark_transport::{Accepted, Connection, DriverEvent, Listener};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::DaemonError;
use crate::services::ServiceTable;
use crate::supervisor::Supervisor;
use crate::tokens::{self, Route};
use crate::txn::{ActiveTransaction, Flow, TxnCtx, TxnEvent};

/// The daemon context: listener, service table, and the single active
/// association.
pub struct Daemon<R: Reactor> {
    reactor: R,
    listener: Box<dyn Listener>,
    services: ServiceTable,
    config: Config,
    supervisor: Supervisor,
    conn: Option<Box<dyn Connection>>,
    txn: Option<ActiveTransaction>,
    watched_conn_fds: Vec<RawFd>,
    done: bool,
}

impl<R: Reactor> Daemon<R> {
    /// Builds a daemon over the given reactor and listener.
    pub fn new(
        reactor: R,
        listener: Box<dyn Listener>,
        services: ServiceTable,
        config: Config,
    ) -> Self {
        Self {
            reactor,
            listener,
            services,
            config,
            supervisor: Supervisor::new(),
            conn: None,
            txn: None,
            watched_conn_fds: Vec::new(),
            done: false,
        }
    }

    /// Opens the listener and serves transactions until the listener is
    /// exhausted or the reactor fails.
    pub fn run(&mut self) -> Result<(), DaemonError> {
        self.listener
            .open()
            .map_err(|source| DaemonError::Listen { source })?;
        self.arm_accept();
        info!("accepting transactions");

        while !self.done {
            match self.reactor.wait() {
                Ok(wake) => self.dispatch(wake),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(source) => return Err(DaemonError::Reactor { source }),
            }
        }
        Ok(())
    }

    fn arm_accept(&mut self) {
        let fd = self.listener.fd();
        if fd >= 0 {
            let _ = self.reactor.watch_readable(fd, tokens::listener());
        }
    }

    fn dispatch(&mut self, wake: Wake) {
        match tokens::route(wake) {
            Route::Listener => self.on_listener_readable(),
            Route::Conn(fd) => self.on_conn_readable(fd),
            Route::ChildStdout => self.on_txn_event(TxnEvent::ReplyReadable),
            Route::ChildStderr => self.on_txn_event(TxnEvent::StderrReadable),
            Route::Channel(index) => self.on_txn_event(TxnEvent::ChannelChildReadable(index)),
            Route::ReplyTimer => self.on_txn_event(TxnEvent::ReplyTimeout),
            Route::AckTimer => self.on_txn_event(TxnEvent::AckTimeout),
            Route::Unknown => debug!(?wake, "wake with an unknown token"),
        }
        self.sync_conn_watches();
    }

    fn on_listener_readable(&mut self) {
        if self.conn.is_some() {
            return;
        }
        match self.listener.accept() {
            Ok(Some(Accepted {
                connection,
                initial,
            })) => {
                info!(peer = connection.peer_name(), "association established");
                self.reactor.unwatch(tokens::listener());
                self.conn = Some(connection);
                self.sync_conn_watches();
                self.process_driver_events(initial);
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "inbound request rejected"),
        }
    }

    fn on_conn_readable(&mut self, fd: RawFd) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let mut events = Vec::new();
        match conn.on_readable(fd, &mut events) {
            Ok(()) => self.process_driver_events(events),
            Err(err) => {
                warn!(%err, "transport failure on the active association");
                self.connection_lost();
            }
        }
    }

    fn process_driver_events(&mut self, events: Vec<DriverEvent>) {
        for event in events {
            if self.conn.is_none() {
                break;
            }
            match event {
                DriverEvent::Packet(packet) => {
                    if self.txn.is_some() {
                        self.on_txn_event(TxnEvent::Packet(packet));
                    } else {
                        self.try_begin(packet);
                    }
                }
                DriverEvent::Stray { from, kind } => {
                    warn!(from, kind = %kind, "ignoring stray packet");
                }
                DriverEvent::StreamData(id, bytes) => {
                    self.on_txn_event(TxnEvent::StreamData(id, bytes));
                }
                DriverEvent::StreamEof(id) => {
                    self.on_txn_event(TxnEvent::StreamEof(id));
                }
                DriverEvent::Closed => {
                    debug!("peer closed the association");
                    self.connection_lost();
                }
            }
        }
    }

    fn try_begin(&mut self, packet: Packet) {
        let Self {
            reactor,
            conn,
            txn,
            services,
            supervisor,
            config,
            ..
        } = self;
        let Some(conn_box) = conn.as_mut() else {
            return;
        };
        let mut ctx = TxnCtx {
            conn: conn_box.as_mut(),
            reactor,
            config,
        };

        match ActiveTransaction::begin(&mut ctx, services, supervisor, &packet) {
            Ok((started, flow)) => {
                *txn = Some(started);
                if flow == Flow::Done {
                    self.finish_transaction();
                }
            }
            Err(err) => {
                warn!(%err, "rejecting request");
                if let Err(send_err) = ctx.conn.send_packet(&Packet::nak(&err.nak_message())) {
                    warn!(%send_err, "cannot send NAK");
                }
                self.drop_connection();
            }
        }
    }

    fn on_txn_event(&mut self, event: TxnEvent) {
        let Self {
            reactor,
            conn,
            txn,
            config,
            ..
        } = self;
        let (Some(active), Some(conn_box)) = (txn.as_mut(), conn.as_mut()) else {
            return;
        };
        let mut ctx = TxnCtx {
            conn: conn_box.as_mut(),
            reactor,
            config,
        };
        let flow = active.on_event(&mut ctx, event);
        if flow == Flow::Done {
            self.finish_transaction();
        }
    }

    fn finish_transaction(&mut self) {
        let Self {
            reactor,
            conn,
            txn,
            supervisor,
            config,
            ..
        } = self;
        if let (Some(active), Some(conn_box)) = (txn.take(), conn.as_mut()) {
            let mut ctx = TxnCtx {
                conn: conn_box.as_mut(),
                reactor,
                config,
            };
            active.finish(&mut ctx, supervisor);
        }
        self.drop_connection();
    }

    fn connection_lost(&mut self) {
        if self.txn.is_some() {
            warn!("association lost mid-transaction");
            self.finish_transaction();
        } else {
            self.drop_connection();
        }
    }

    fn drop_connection(&mut self) {
        for fd in std::mem::take(&mut self.watched_conn_fds) {
            self.reactor.unwatch_fd(fd);
        }
        self.conn = None;
        if self.listener.single_shot() {
            info!("single association served, shutting down");
            self.done = true;
        } else {
            self.arm_accept();
        }
    }

    /// Reconciles the reactor's fd watches with what the connection
    /// currently wants observed; stream sockets come and go as channels
    /// open and close.
    fn sync_conn_watches(&mut self) {
        let desired = self
            .conn
            .as_ref()
            .map(|conn| conn.readable_fds())
            .unwrap_or_default();
        let current = std::mem::take(&mut self.watched_conn_fds);

        for fd in &current {
            if !desired.contains(fd) {
                self.reactor.unwatch_fd(*fd);
            }
        }
        for fd in &desired {
            if !current.contains(fd) {
                let _ = self.reactor.watch_readable(*fd, tokens::conn_fd(*fd));
            }
        }
        self.watched_conn_fds = desired;
    }
}
