//! The per-transaction protocol state machine.
//!
//! One [`ActiveTransaction`] exists per admitted request and advances through
//! an explicit state tag in response to externally delivered events: packets,
//! subprocess pipe readiness, and per-phase timer expiry. Each handler
//! returns an action; synchronous states chain through `Continue` until the
//! machine suspends for the next event or finishes.
//!
//! At most one transaction exists at a time. A request arriving while one is
//! active never starts a second subprocess: an identical duplicate is
//! answered idempotently (re-acknowledged, or the reply is retransmitted),
//! anything else is logged and ignored.

use std::io::{self, Read, Write};

use ark_protocol::{NO_STREAM, Packet, PacketKind, parse_request, rewrite_connect_line};
use ark_reactor::Reactor;
use ark_transport::{Connection, StreamId};
use tracing::{debug, info, warn};

use crate::channel::{DataChannel, DataOrdering, SentinelScanner};
use crate::config::Config;
use crate::error::TxnError;
use crate::reply::ReplyBuffer;
use crate::services::{ServiceKind, ServiceTable};
use crate::supervisor::{
    CHANNEL_COUNT, CONTROL_CHANNEL, PRIMARY_DATA_CHANNEL, ServiceProcess, Supervisor,
};
use crate::tokens;

const REPLY_READ_CHUNK: usize = 16 * 1024;
const RELAY_READ_CHUNK: usize = 32 * 1024;

/// State tag of the transaction machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    /// Acknowledging the admitted request and launching the service.
    Acknowledging,
    /// Collecting subprocess stdout into the reply buffer.
    AwaitingReply,
    /// Rewriting the collected reply's `CONNECT` line.
    ProcessingReply,
    /// Transmitting the reply.
    Sending,
    /// Waiting for the peer to acknowledge the reply.
    AwaitingAck,
    /// Accepting the advertised streams and starting the relays.
    OpeningStreams,
    /// Relaying data channels until all of them close.
    RelayingStreams,
    /// Terminal.
    Finished,
}

/// Externally delivered events.
#[derive(Debug)]
pub enum TxnEvent {
    /// A protocol packet arrived.
    Packet(Packet),
    /// The subprocess reply pipe became readable.
    ReplyReadable,
    /// The subprocess stderr became readable.
    StderrReadable,
    /// The reply-collection window expired.
    ReplyTimeout,
    /// The ack-wait window expired.
    AckTimeout,
    /// Bytes arrived on a data stream.
    StreamData(StreamId, Vec<u8>),
    /// The peer closed a data stream.
    StreamEof(StreamId),
    /// A data channel's subprocess pipe became readable.
    ChannelChildReadable(usize),
}

/// Control action yielded by a state handler.
#[derive(Debug)]
enum Action {
    /// Enter the current state's synchronous handler immediately.
    Continue,
    /// Wait for the next event.
    Suspend,
    /// Tear the transaction down.
    Finish,
    /// Send a `NAK` with this message, then wait for the next event.
    NakAndSuspend(String),
}

/// What the daemon does after feeding an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    /// The transaction is waiting for further events.
    Pending,
    /// The transaction reached its terminal state; tear it down.
    Done,
}

/// Everything a state handler may touch outside the transaction itself.
pub struct TxnCtx<'a> {
    /// The association carrying this transaction.
    pub conn: &'a mut dyn Connection,
    /// Readiness and timer registration.
    pub reactor: &'a mut dyn Reactor,
    /// Configuration getter.
    pub config: &'a Config,
}

/// The aggregate root of one in-flight request.
#[derive(Debug)]
pub struct ActiveTransaction {
    state: TxnState,
    service_name: String,
    service_kind: ServiceKind,
    request_body: String,
    peer_name: String,
    reply: ReplyBuffer,
    reply_body: String,
    retries_left: u32,
    process: Option<ServiceProcess>,
    channels: Vec<DataChannel>,
    sentinel: SentinelScanner,
}

impl ActiveTransaction {
    /// Validates an admitted packet and, if it names a runnable service,
    /// starts the transaction: acknowledge, launch, begin collecting the
    /// reply.
    ///
    /// # Errors
    ///
    /// Validation failures (wrong packet kind, malformed request, unknown or
    /// disabled or non-executable service) mean the transaction never
    /// starts; the caller answers with a single `NAK`.
    pub fn begin(
        ctx: &mut TxnCtx<'_>,
        services: &ServiceTable,
        supervisor: &mut Supervisor,
        packet: &Packet,
    ) -> Result<(Self, Flow), TxnError> {
        if packet.kind() != PacketKind::Req {
            return Err(TxnError::UnexpectedPacket {
                kind: packet.kind(),
            });
        }
        let request = parse_request(packet.body()).map_err(|err| TxnError::MalformedRequest {
            detail: err.to_string(),
        })?;
        let entry = services.resolve(request.service)?;

        let peer_name = ctx.conn.peer_name().to_owned();
        info!(
            service = entry.name,
            peer = peer_name,
            "dispatching request"
        );

        let mut txn = Self {
            state: TxnState::Acknowledging,
            service_name: entry.name.clone(),
            service_kind: entry.kind,
            request_body: packet.body().to_owned(),
            peer_name,
            reply: ReplyBuffer::new(),
            reply_body: String::new(),
            retries_left: 0,
            process: None,
            channels: Vec::new(),
            sentinel: SentinelScanner::new(),
        };
        let path = entry.path.clone();
        let options = request.options.to_owned();
        let action = txn.enter_acknowledging(ctx, supervisor, &path, &options);
        let flow = txn.run_actions(ctx, action);
        Ok((txn, flow))
    }

    /// The current state tag.
    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// The service this transaction runs.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Feeds one event into the machine.
    pub fn on_event(&mut self, ctx: &mut TxnCtx<'_>, event: TxnEvent) -> Flow {
        let action = match self.state {
            TxnState::AwaitingReply => self.awaiting_reply(ctx, event),
            TxnState::AwaitingAck => self.awaiting_ack(ctx, event),
            TxnState::RelayingStreams => self.relaying(ctx, event),
            state => {
                debug!(?state, ?event, "event ignored in transient state");
                Action::Suspend
            }
        };
        self.run_actions(ctx, action)
    }

    fn run_actions(&mut self, ctx: &mut TxnCtx<'_>, mut action: Action) -> Flow {
        loop {
            match action {
                Action::Continue => {
                    action = match self.state {
                        TxnState::ProcessingReply => {
                            self.process_reply(ctx);
                            self.state = TxnState::Sending;
                            Action::Continue
                        }
                        TxnState::Sending => self.enter_sending(ctx, true),
                        TxnState::OpeningStreams => self.enter_opening_streams(ctx),
                        state => {
                            debug!(?state, "no synchronous entry for state");
                            Action::Suspend
                        }
                    };
                }
                Action::Suspend => return Flow::Pending,
                Action::NakAndSuspend(message) => {
                    if let Err(err) = ctx.conn.send_packet(&Packet::nak(&message)) {
                        warn!(%err, "cannot send NAK");
                    }
                    return Flow::Pending;
                }
                Action::Finish => {
                    self.state = TxnState::Finished;
                    return Flow::Done;
                }
            }
        }
    }

    fn enter_acknowledging(
        &mut self,
        ctx: &mut TxnCtx<'_>,
        supervisor: &mut Supervisor,
        path: &std::path::Path,
        options: &str,
    ) -> Action {
        if let Err(err) = ctx.conn.send_packet(&Packet::ack()) {
            warn!(%err, "cannot acknowledge request");
            return Action::Finish;
        }

        match supervisor.launch(path, &self.peer_name) {
            Ok(mut process) => {
                if let Err(err) = process.write_request(options) {
                    warn!(%err, "cannot forward request arguments");
                    self.reply
                        .append_error_line(&format!("cannot forward request arguments: {err}"));
                }

                self.channels = (0..CHANNEL_COUNT)
                    .map(|index| {
                        let ordering = if index == PRIMARY_DATA_CHANNEL
                            && self.service_kind.holds_data_until_header()
                        {
                            DataOrdering::AfterControlHeader
                        } else {
                            DataOrdering::Immediate
                        };
                        DataChannel::from_aux(index, process.take_aux(index), ordering)
                    })
                    .collect();

                let _ = ctx
                    .reactor
                    .watch_readable(process.stdout_fd(), tokens::child_stdout());
                let _ = ctx
                    .reactor
                    .watch_readable(process.stderr_fd(), tokens::child_stderr());
                ctx.reactor
                    .arm_timer(ctx.config.reply_timeout(), tokens::reply_timer());

                self.process = Some(process);
                self.state = TxnState::AwaitingReply;
                Action::Suspend
            }
            Err(err) => {
                // The request was already acknowledged; surface the failure
                // in the reply rather than dropping it on the floor.
                warn!(%err, service = self.service_name, "service launch failed");
                self.reply.append_error_line(&err.to_string());
                self.state = TxnState::ProcessingReply;
                Action::Continue
            }
        }
    }

    fn awaiting_reply(&mut self, ctx: &mut TxnCtx<'_>, event: TxnEvent) -> Action {
        match event {
            TxnEvent::ReplyReadable => {
                let Some(process) = self.process.as_mut() else {
                    return Action::Suspend;
                };
                let mut buf = [0u8; REPLY_READ_CHUNK];
                match process.read_reply_chunk(&mut buf) {
                    Ok(0) => self.reply_collected(ctx),
                    Ok(n) => {
                        self.reply.append(&buf[..n]);
                        Action::Suspend
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::Interrupted =>
                    {
                        Action::Suspend
                    }
                    Err(source) => {
                        let err = TxnError::ReplyPipeRead { source };
                        warn!(%err, service = self.service_name, "reply pipe failed");
                        self.reply.append_error_line(&err.to_string());
                        self.reply_collected(ctx)
                    }
                }
            }
            TxnEvent::StderrReadable => {
                self.relay_stderr(ctx);
                Action::Suspend
            }
            TxnEvent::ReplyTimeout => {
                let err = TxnError::ReplyPipeTimeout;
                warn!(service = self.service_name, "{err}");
                if let Err(send_err) = ctx.conn.send_packet(&Packet::nak(&err.nak_message())) {
                    warn!(%send_err, "cannot send NAK");
                }
                Action::Finish
            }
            TxnEvent::Packet(packet) => self.busy_packet(ctx, packet, Some(Packet::ack())),
            event => {
                debug!(?event, "event ignored while awaiting the reply");
                Action::Suspend
            }
        }
    }

    fn reply_collected(&mut self, ctx: &mut TxnCtx<'_>) -> Action {
        ctx.reactor.unwatch(tokens::child_stdout());
        ctx.reactor.disarm_timer(tokens::reply_timer());
        debug!(
            service = self.service_name,
            bytes = self.reply.len(),
            high_water = self.reply.high_water_mark(),
            "reply collected"
        );
        self.state = TxnState::ProcessingReply;
        Action::Continue
    }

    fn awaiting_ack(&mut self, ctx: &mut TxnCtx<'_>, event: TxnEvent) -> Action {
        match event {
            TxnEvent::Packet(packet) if packet.kind() == PacketKind::Ack => {
                ctx.reactor.disarm_timer(tokens::ack_timer());
                self.state = TxnState::OpeningStreams;
                Action::Continue
            }
            TxnEvent::Packet(packet) => {
                // A duplicated request means our reply was lost in transit;
                // answer it with a retransmission.
                if self.is_duplicate_request(&packet) {
                    debug!(
                        service = self.service_name,
                        "retransmitting reply for duplicate request"
                    );
                    self.state = TxnState::Sending;
                    self.enter_sending(ctx, false)
                } else {
                    self.busy_packet(ctx, packet, None)
                }
            }
            TxnEvent::AckTimeout => {
                if self.retries_left > 0 {
                    self.retries_left -= 1;
                    info!(
                        service = self.service_name,
                        remaining = self.retries_left,
                        "reply unacknowledged, retransmitting"
                    );
                    self.state = TxnState::Sending;
                    self.enter_sending(ctx, false)
                } else {
                    let err = TxnError::AckTimeoutExhausted;
                    warn!(service = self.service_name, "{err}");
                    Action::Finish
                }
            }
            TxnEvent::StderrReadable => {
                self.relay_stderr(ctx);
                Action::Suspend
            }
            event => {
                debug!(?event, "event ignored while awaiting the ack");
                Action::Suspend
            }
        }
    }

    /// Handles a packet that arrived while the transaction is busy: exact
    /// duplicates of the active request are re-answered with `response`
    /// when one applies, foreign requests are logged and ignored, anything
    /// else draws a `NAK`.
    fn busy_packet(
        &mut self,
        ctx: &mut TxnCtx<'_>,
        packet: Packet,
        response: Option<Packet>,
    ) -> Action {
        if self.is_duplicate_request(&packet) {
            match response {
                Some(response) => {
                    debug!(service = self.service_name, "re-answering duplicate request");
                    if let Err(err) = ctx.conn.send_packet(&response) {
                        warn!(%err, "cannot re-answer duplicate request");
                    }
                }
                None => {
                    debug!(service = self.service_name, "ignoring duplicate request");
                }
            }
            Action::Suspend
        } else if packet.kind() == PacketKind::Req {
            warn!(
                service = self.service_name,
                "ignoring new request while a transaction is active"
            );
            Action::Suspend
        } else {
            let err = TxnError::UnexpectedPacket {
                kind: packet.kind(),
            };
            Action::NakAndSuspend(err.nak_message())
        }
    }

    fn is_duplicate_request(&self, packet: &Packet) -> bool {
        packet.kind() == PacketKind::Req && packet.body() == self.request_body
    }

    fn process_reply(&mut self, ctx: &mut TxnCtx<'_>) {
        let text = self.reply.as_text().into_owned();
        let channels = &mut self.channels;
        let conn = &mut *ctx.conn;

        let rewritten = rewrite_connect_line(&text, |name, handle| {
            let slot = channels
                .iter_mut()
                .find(|chan| chan.name == name && chan.stream.is_none() && !chan.finished);
            match slot {
                Some(chan) => match conn.stream_listen() {
                    Ok(id) => {
                        debug!(channel = name, handle, id = id.0, "stream advertised");
                        chan.stream = Some(id);
                        id.as_handle()
                    }
                    Err(err) => {
                        warn!(channel = name, %err, "cannot allocate stream");
                        NO_STREAM
                    }
                },
                None => {
                    warn!(channel = name, handle, "unknown channel in CONNECT line");
                    NO_STREAM
                }
            }
        });

        self.reply_body = match rewritten {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "reply carries a malformed CONNECT line");
                let mut body = text;
                body.push_str(&format!("ERROR {err}\n"));
                body
            }
        };
    }

    fn enter_sending(&mut self, ctx: &mut TxnCtx<'_>, first_transmission: bool) -> Action {
        let reply = Packet::new(PacketKind::Rep, self.reply_body.clone());
        if let Err(err) = ctx.conn.send_packet(&reply) {
            warn!(%err, "cannot send reply");
            return Action::Finish;
        }
        if first_transmission {
            self.retries_left = ctx.config.req_tries();
        }
        ctx.reactor
            .arm_timer(ctx.config.ack_timeout(), tokens::ack_timer());
        self.state = TxnState::AwaitingAck;
        Action::Suspend
    }

    fn enter_opening_streams(&mut self, ctx: &mut TxnCtx<'_>) -> Action {
        for index in 0..self.channels.len() {
            let Some(id) = self.channels[index].stream else {
                // Channel not advertised: the service does not use it.
                self.channels[index].from_child = None;
                self.channels[index].to_child = None;
                continue;
            };

            match ctx.conn.stream_accept(id) {
                Ok(()) => {
                    let held = self.channels[index].ordering == DataOrdering::AfterControlHeader
                        && !self.sentinel.seen();
                    if held {
                        debug!(
                            channel = self.channels[index].name,
                            "holding subprocess relay until the control header completes"
                        );
                    } else {
                        self.watch_channel(ctx, index);
                    }
                }
                Err(source) => {
                    let err = TxnError::StreamVerification { source };
                    warn!(channel = self.channels[index].name, %err, "stream failed to open");
                    self.close_channel(ctx, index);
                }
            }
        }

        if self.open_channel_count() == 0 {
            debug!(service = self.service_name, "no data channels opened");
            Action::Finish
        } else {
            self.state = TxnState::RelayingStreams;
            Action::Suspend
        }
    }

    fn relaying(&mut self, ctx: &mut TxnCtx<'_>, event: TxnEvent) -> Action {
        match event {
            TxnEvent::ChannelChildReadable(index) => self.relay_child(ctx, index),
            TxnEvent::StreamData(id, bytes) => {
                let Some(index) = self.channel_index_of(id) else {
                    debug!(stream = id.0, "data for an unbound stream");
                    return Action::Suspend;
                };
                let result = match self.channels[index].to_child.as_mut() {
                    Some(pipe) => pipe.write_all(&bytes),
                    None => Ok(()),
                };
                if let Err(err) = result {
                    warn!(channel = self.channels[index].name, %err, "subprocess side closed");
                    self.close_channel(ctx, index);
                    return self.finish_when_drained();
                }
                Action::Suspend
            }
            TxnEvent::StreamEof(id) => {
                let Some(index) = self.channel_index_of(id) else {
                    return Action::Suspend;
                };
                self.close_channel(ctx, index);
                self.finish_when_drained()
            }
            TxnEvent::Packet(packet) => self.busy_packet(ctx, packet, None),
            TxnEvent::StderrReadable => {
                self.relay_stderr(ctx);
                Action::Suspend
            }
            event => {
                debug!(?event, "event ignored while relaying");
                Action::Suspend
            }
        }
    }

    fn relay_child(&mut self, ctx: &mut TxnCtx<'_>, index: usize) -> Action {
        let mut buf = [0u8; RELAY_READ_CHUNK];
        let (count, stream) = {
            let Some(chan) = self.channels.get_mut(index) else {
                return Action::Suspend;
            };
            if chan.finished {
                return Action::Suspend;
            }
            let Some(pipe) = chan.from_child.as_mut() else {
                return Action::Suspend;
            };
            match pipe.read(&mut buf) {
                Ok(n) => (n, chan.stream),
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    return Action::Suspend;
                }
                Err(err) => {
                    warn!(channel = chan.name, %err, "data channel read failed");
                    (0, chan.stream)
                }
            }
        };

        if count == 0 {
            self.close_channel(ctx, index);
            return self.finish_when_drained();
        }

        if index == CONTROL_CHANNEL
            && self.service_kind.holds_data_until_header()
            && self.sentinel.observe(&buf[..count])
        {
            self.release_primary_data(ctx);
        }

        if let Some(id) = stream {
            if let Err(err) = ctx.conn.stream_write(id, &buf[..count]) {
                let err = TxnError::StreamIo { source: err };
                warn!(channel = self.channels[index].name, %err, "stream write failed");
                self.close_channel(ctx, index);
                return self.finish_when_drained();
            }
        }
        Action::Suspend
    }

    fn release_primary_data(&mut self, ctx: &mut TxnCtx<'_>) {
        info!(
            service = self.service_name,
            "control header complete, starting primary data relay"
        );
        let Some(chan) = self.channels.get(PRIMARY_DATA_CHANNEL) else {
            return;
        };
        if chan.is_open() && chan.from_child.is_some() {
            self.watch_channel(ctx, PRIMARY_DATA_CHANNEL);
        }
    }

    fn watch_channel(&mut self, ctx: &mut TxnCtx<'_>, index: usize) {
        if let Some(pipe) = self.channels[index].from_child.as_ref() {
            use std::os::fd::AsRawFd;
            let _ = ctx
                .reactor
                .watch_readable(pipe.as_raw_fd(), tokens::channel(index));
        }
    }

    fn close_channel(&mut self, ctx: &mut TxnCtx<'_>, index: usize) {
        let chan = &mut self.channels[index];
        if chan.finished {
            return;
        }
        chan.finished = true;

        if let Some(pipe) = chan.from_child.take() {
            use std::os::fd::AsRawFd;
            ctx.reactor.unwatch_fd(pipe.as_raw_fd());
        }
        chan.to_child = None;
        if let Some(id) = chan.stream.take() {
            if let Err(err) = ctx.conn.stream_close(id) {
                debug!(channel = chan.name, %err, "stream close failed");
            }
        }
        debug!(channel = chan.name, "data channel finished");
    }

    fn finish_when_drained(&self) -> Action {
        if self.open_channel_count() == 0 {
            Action::Finish
        } else {
            Action::Suspend
        }
    }

    fn open_channel_count(&self) -> usize {
        self.channels.iter().filter(|chan| chan.is_open()).count()
    }

    fn channel_index_of(&self, id: StreamId) -> Option<usize> {
        self.channels
            .iter()
            .position(|chan| chan.stream == Some(id))
    }

    fn relay_stderr(&mut self, ctx: &mut TxnCtx<'_>) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        let mut buf = [0u8; 4096];
        match process.read_stderr_chunk(&mut buf) {
            Ok(0) => {
                ctx.reactor.unwatch(tokens::child_stderr());
                process.close_stderr();
            }
            Ok(n) => {
                for line in String::from_utf8_lossy(&buf[..n]).lines() {
                    warn!(service = self.service_name, line, "service stderr");
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(%err, "stderr read failed");
                ctx.reactor.unwatch(tokens::child_stderr());
                process.close_stderr();
            }
        }
    }

    /// Tears the transaction down: releases timers and watches, closes every
    /// channel, reclaims the subprocess, and signals end-of-transaction to
    /// backends that need it.
    pub fn finish(mut self, ctx: &mut TxnCtx<'_>, supervisor: &mut Supervisor) {
        self.state = TxnState::Finished;
        ctx.reactor.disarm_timer(tokens::reply_timer());
        ctx.reactor.disarm_timer(tokens::ack_timer());
        ctx.reactor.unwatch(tokens::child_stdout());
        ctx.reactor.unwatch(tokens::child_stderr());

        for index in 0..self.channels.len() {
            self.close_channel(ctx, index);
        }

        if let Some(process) = self.process.take() {
            if let Some(err) = supervisor.release(process) {
                warn!(service = self.service_name, %err, "service ended badly");
            }
        }

        if let Err(err) = ctx.conn.end_transaction() {
            warn!(%err, "end-of-transaction signalling failed");
        }
        info!(service = self.service_name, "transaction finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_reactor::{Token, Wake};
    use ark_test_support::{ScriptedConnection, ServiceScript, service_script};
    use std::os::fd::RawFd;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingReactor {
        watched: Vec<(RawFd, Token)>,
        timers: Vec<Token>,
    }

    impl RecordingReactor {
        fn watches(&self, token: Token) -> bool {
            self.watched.iter().any(|(_, t)| *t == token)
        }

        fn timer_armed(&self, token: Token) -> bool {
            self.timers.contains(&token)
        }
    }

    impl Reactor for RecordingReactor {
        fn watch_readable(&mut self, fd: RawFd, token: Token) -> io::Result<()> {
            self.watched.retain(|(_, t)| *t != token);
            self.watched.push((fd, token));
            Ok(())
        }

        fn unwatch(&mut self, token: Token) {
            self.watched.retain(|(_, t)| *t != token);
        }

        fn unwatch_fd(&mut self, fd: RawFd) {
            self.watched.retain(|(f, _)| *f != fd);
        }

        fn arm_timer(&mut self, _after: Duration, token: Token) {
            self.timers.retain(|t| *t != token);
            self.timers.push(token);
        }

        fn disarm_timer(&mut self, token: Token) {
            self.timers.retain(|t| *t != token);
        }

        fn wait(&mut self) -> io::Result<Wake> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "scripted"))
        }
    }

    struct Fixture {
        _script: ServiceScript,
        services: ServiceTable,
        config: Config,
        supervisor: Supervisor,
        conn: ScriptedConnection,
        reactor: RecordingReactor,
    }

    impl Fixture {
        fn new(service: &str, script_body: &str) -> Self {
            let script = service_script(service, script_body);
            let services = ServiceTable::standard(script.dir());
            Self {
                _script: script,
                services,
                config: Config::new(),
                supervisor: Supervisor::new(),
                conn: ScriptedConnection::new(1),
                reactor: RecordingReactor::default(),
            }
        }

        fn begin(&mut self, request_body: &str) -> Result<(ActiveTransaction, Flow), TxnError> {
            let packet = Packet::new(PacketKind::Req, request_body.to_owned());
            let Self {
                services,
                config,
                supervisor,
                conn,
                reactor,
                ..
            } = self;
            let mut ctx = TxnCtx {
                conn,
                reactor,
                config,
            };
            ActiveTransaction::begin(&mut ctx, services, supervisor, &packet)
        }

        fn feed(&mut self, txn: &mut ActiveTransaction, event: TxnEvent) -> Flow {
            let Self {
                config,
                conn,
                reactor,
                ..
            } = self;
            let mut ctx = TxnCtx {
                conn,
                reactor,
                config,
            };
            txn.on_event(&mut ctx, event)
        }

        fn finish(&mut self, txn: ActiveTransaction) {
            let Self {
                config,
                conn,
                reactor,
                supervisor,
                ..
            } = self;
            let mut ctx = TxnCtx {
                conn,
                reactor,
                config,
            };
            txn.finish(&mut ctx, supervisor);
        }

        fn collect_reply(&mut self, txn: &mut ActiveTransaction) -> Flow {
            let mut flow = Flow::Pending;
            while txn.state() == TxnState::AwaitingReply {
                flow = self.feed(txn, TxnEvent::ReplyReadable);
            }
            flow
        }
    }

    #[test]
    fn noop_transaction_acks_replies_and_finishes_without_channels() {
        let mut fx = Fixture::new("noop", "#!/bin/sh\nexit 0\n");
        let (mut txn, flow) = fx.begin("SERVICE noop \n").expect("transaction starts");
        assert_eq!(flow, Flow::Pending);
        assert_eq!(txn.state(), TxnState::AwaitingReply);
        assert_eq!(fx.conn.sent_kinds(), vec![PacketKind::Ack]);
        assert!(fx.reactor.timer_armed(tokens::reply_timer()));

        let flow = fx.collect_reply(&mut txn);
        assert_eq!(flow, Flow::Pending);
        assert_eq!(txn.state(), TxnState::AwaitingAck);
        assert_eq!(
            fx.conn.sent_kinds(),
            vec![PacketKind::Ack, PacketKind::Rep]
        );
        assert_eq!(fx.conn.sent[1].body(), "");
        assert!(!fx.reactor.timer_armed(tokens::reply_timer()));
        assert!(fx.reactor.timer_armed(tokens::ack_timer()));

        let flow = fx.feed(&mut txn, TxnEvent::Packet(Packet::ack()));
        assert_eq!(flow, Flow::Done);

        fx.finish(txn);
        assert_eq!(fx.conn.end_transactions, 1);
        assert!(!fx.supervisor.is_active());
    }

    #[test]
    fn unknown_service_never_starts_a_transaction() {
        let mut fx = Fixture::new("noop", "#!/bin/sh\nexit 0\n");
        let err = fx.begin("SERVICE mystery \n").unwrap_err();
        assert!(matches!(err, TxnError::UnknownService { .. }));
        assert!(fx.conn.sent.is_empty());
        assert!(!fx.supervisor.is_active());
    }

    #[test]
    fn disabled_service_never_starts_a_transaction() {
        let mut fx = Fixture::new("noop", "#!/bin/sh\nexit 0\n");
        fx.services.set_enabled("noop", false);
        let err = fx.begin("SERVICE noop \n").unwrap_err();
        assert!(matches!(err, TxnError::DisabledService { .. }));
        assert!(fx.conn.sent.is_empty());
    }

    #[test]
    fn malformed_request_is_rejected() {
        let mut fx = Fixture::new("noop", "#!/bin/sh\nexit 0\n");
        let err = fx.begin("GIMME noop\n").unwrap_err();
        assert!(matches!(err, TxnError::MalformedRequest { .. }));
    }

    #[test]
    fn non_request_packet_is_rejected_while_idle() {
        let mut fx = Fixture::new("noop", "#!/bin/sh\nexit 0\n");
        let packet = Packet::ack();
        let Fixture {
            services,
            config,
            supervisor,
            conn,
            reactor,
            ..
        } = &mut fx;
        let mut ctx = TxnCtx {
            conn,
            reactor,
            config,
        };
        let err = ActiveTransaction::begin(&mut ctx, services, supervisor, &packet).unwrap_err();
        assert!(matches!(
            err,
            TxnError::UnexpectedPacket {
                kind: PacketKind::Ack
            }
        ));
    }

    #[test]
    fn reply_timeout_naks_and_finishes() {
        let mut fx = Fixture::new("sendsize", "#!/bin/sh\nexec sleep 30\n");
        let (mut txn, _) = fx.begin("SERVICE sendsize \n").expect("transaction starts");

        let flow = fx.feed(&mut txn, TxnEvent::ReplyTimeout);
        assert_eq!(flow, Flow::Done);
        assert_eq!(
            fx.conn.sent_kinds(),
            vec![PacketKind::Ack, PacketKind::Nak]
        );
        assert_eq!(fx.conn.sent[1].body(), "ERROR timeout on reply pipe\n");

        // The hung child is left to the supervisor's soft teardown.
        fx.finish(txn);
        assert!(!fx.supervisor.is_active());
    }

    #[test]
    fn connect_handles_are_rewritten_to_stream_ids() {
        let mut fx = Fixture::new(
            "sendbackup",
            "#!/bin/sh\nprintf 'CONNECT DATA 4 MESG 5\\n'\n",
        );
        let (mut txn, _) = fx
            .begin("SERVICE sendbackup disk1 0\n")
            .expect("transaction starts");

        fx.collect_reply(&mut txn);
        assert_eq!(txn.state(), TxnState::AwaitingAck);
        assert_eq!(fx.conn.sent[1].body(), "CONNECT DATA 1 MESG 2\n");

        let flow = fx.feed(&mut txn, TxnEvent::Packet(Packet::ack()));
        assert_eq!(flow, Flow::Pending);
        assert_eq!(txn.state(), TxnState::RelayingStreams);
        assert_eq!(fx.conn.accepted_streams, vec![1, 2]);

        // The backup-type primary data relay is held until the control
        // header sentinel; only the control channel is being watched.
        assert!(!fx.reactor.watches(tokens::channel(PRIMARY_DATA_CHANNEL)));
        assert!(fx.reactor.watches(tokens::channel(CONTROL_CHANNEL)));

        let flow = fx.feed(&mut txn, TxnEvent::StreamEof(StreamId(1)));
        assert_eq!(flow, Flow::Pending);
        let flow = fx.feed(&mut txn, TxnEvent::StreamEof(StreamId(2)));
        assert_eq!(flow, Flow::Done);
        assert_eq!(fx.conn.closed_streams, vec![1, 2]);
    }

    #[test]
    fn sentinel_on_control_channel_releases_the_data_relay() {
        let mut fx = Fixture::new(
            "sendbackup",
            "#!/bin/sh\nprintf 'CONNECT DATA 4 MESG 5\\n'\n\
             printf 'header\\nsendbackup: info end\\n' >&53\n",
        );
        let (mut txn, _) = fx
            .begin("SERVICE sendbackup disk1 0\n")
            .expect("transaction starts");
        fx.collect_reply(&mut txn);
        fx.feed(&mut txn, TxnEvent::Packet(Packet::ack()));
        assert!(!fx.reactor.watches(tokens::channel(PRIMARY_DATA_CHANNEL)));

        // The control pipe holds the header already; one readable event
        // carries it through the sentinel scanner.
        let flow = fx.feed(&mut txn, TxnEvent::ChannelChildReadable(CONTROL_CHANNEL));
        assert_eq!(flow, Flow::Pending);
        assert!(fx.reactor.watches(tokens::channel(PRIMARY_DATA_CHANNEL)));
        assert_eq!(
            fx.conn.stream_bytes(2),
            b"header\nsendbackup: info end\n".to_vec()
        );
    }

    #[test]
    fn retry_bound_is_exact() {
        let mut fx = Fixture::new("noop", "#!/bin/sh\nprintf 'OPTIONS ;\\n'\n");
        fx.config.set("req-tries", "2");
        let (mut txn, _) = fx.begin("SERVICE noop \n").expect("transaction starts");
        fx.collect_reply(&mut txn);
        assert_eq!(txn.state(), TxnState::AwaitingAck);

        // Two configured retries: two retransmissions, then exhaustion.
        assert_eq!(fx.feed(&mut txn, TxnEvent::AckTimeout), Flow::Pending);
        assert_eq!(fx.feed(&mut txn, TxnEvent::AckTimeout), Flow::Pending);
        assert_eq!(fx.feed(&mut txn, TxnEvent::AckTimeout), Flow::Done);
        assert_eq!(
            fx.conn.sent_kinds(),
            vec![
                PacketKind::Ack,
                PacketKind::Rep,
                PacketKind::Rep,
                PacketKind::Rep,
            ]
        );
    }

    #[test]
    fn failed_stream_allocation_advertises_no_stream() {
        let mut fx = Fixture::new(
            "sendbackup",
            "#!/bin/sh\nprintf 'CONNECT DATA 4 MESG 5\\n'\n",
        );
        fx.conn.fail_listen_calls.insert(0);
        let (mut txn, _) = fx
            .begin("SERVICE sendbackup disk1 0\n")
            .expect("transaction starts");
        fx.collect_reply(&mut txn);

        // The failed channel is advertised as -1; the other opens normally.
        assert_eq!(fx.conn.sent[1].body(), "CONNECT DATA -1 MESG 1\n");

        fx.feed(&mut txn, TxnEvent::Packet(Packet::ack()));
        assert_eq!(txn.state(), TxnState::RelayingStreams);
        assert_eq!(fx.conn.accepted_streams, vec![1]);
    }

    #[test]
    fn duplicate_request_is_reacked_while_awaiting_the_reply() {
        let mut fx = Fixture::new("sendsize", "#!/bin/sh\nexec sleep 30\n");
        let (mut txn, _) = fx
            .begin("SERVICE sendsize disk1\n")
            .expect("transaction starts");
        assert_eq!(fx.conn.sent_kinds(), vec![PacketKind::Ack]);

        let duplicate = Packet::new(PacketKind::Req, "SERVICE sendsize disk1\n".to_owned());
        let flow = fx.feed(&mut txn, TxnEvent::Packet(duplicate));
        assert_eq!(flow, Flow::Pending);
        assert_eq!(
            fx.conn.sent_kinds(),
            vec![PacketKind::Ack, PacketKind::Ack]
        );

        // A request with different parameters is ignored outright.
        let foreign = Packet::new(PacketKind::Req, "SERVICE sendsize disk2\n".to_owned());
        fx.feed(&mut txn, TxnEvent::Packet(foreign));
        assert_eq!(fx.conn.sent.len(), 2);

        // Any other kind draws a NAK without tearing the subprocess down.
        fx.feed(&mut txn, TxnEvent::Packet(Packet::new(PacketKind::Rep, String::new())));
        assert_eq!(fx.conn.sent_kinds().last(), Some(&PacketKind::Nak));
        assert!(fx.supervisor.is_active());

        fx.feed(&mut txn, TxnEvent::ReplyTimeout);
        fx.finish(txn);
    }

    #[test]
    fn duplicate_request_retransmits_the_reply_while_awaiting_the_ack() {
        let mut fx = Fixture::new("noop", "#!/bin/sh\nprintf 'OPTIONS ;\\n'\n");
        let (mut txn, _) = fx.begin("SERVICE noop \n").expect("transaction starts");
        fx.collect_reply(&mut txn);
        assert_eq!(
            fx.conn.sent_kinds(),
            vec![PacketKind::Ack, PacketKind::Rep]
        );

        let duplicate = Packet::new(PacketKind::Req, "SERVICE noop \n".to_owned());
        let flow = fx.feed(&mut txn, TxnEvent::Packet(duplicate));
        assert_eq!(flow, Flow::Pending);
        assert_eq!(txn.state(), TxnState::AwaitingAck);
        assert_eq!(
            fx.conn.sent_kinds(),
            vec![PacketKind::Ack, PacketKind::Rep, PacketKind::Rep]
        );
    }

    #[test]
    fn launch_failure_is_folded_into_the_reply() {
        // Trip the supervisor's single-transaction guard so the launch in
        // `begin` fails after the request has been acknowledged.
        let mut fx = Fixture::new("noop", "#!/bin/sh\nexit 0\n");
        let script = fx._script.path().to_owned();
        let held = fx.supervisor.launch(&script, "peer").expect("first launch");

        let (txn, flow) = fx.begin("SERVICE noop \n").expect("transaction starts");
        assert_eq!(flow, Flow::Pending);
        assert_eq!(txn.state(), TxnState::AwaitingAck);
        assert_eq!(
            fx.conn.sent_kinds(),
            vec![PacketKind::Ack, PacketKind::Rep]
        );
        let body = fx.conn.sent[1].body().to_owned();
        assert!(body.starts_with("ERROR "), "reply body: {body:?}");

        fx.supervisor.release(held);
    }
}
