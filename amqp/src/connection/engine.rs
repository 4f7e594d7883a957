use super::events::{ConnectionEvents, Notification};
use super::options::ConnectionOptions;
use super::state::ConnectionState;
use crate::common::{Handle, Registry};
use crate::link::LinkRecord;
use crate::models::{
    AmqpErrorCondition, Close, Frame, Open, Performative, ProtocolId, conditions,
};
use crate::network::io::{self, IoConfig, IoEvent, Outbound, TransportSource};
use crate::session::SessionRecord;
use crate::{AmqpError, AmqpResult};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Records removed by [`ConnectionCore::reclaim`].
#[derive(Default)]
pub(crate) struct Reclaimed {
    links: Vec<LinkRecord>,
    sessions: Vec<SessionRecord>,
}

impl Reclaimed {
    fn is_empty(&self) -> bool {
        self.links.is_empty() && self.sessions.is_empty()
    }
}

/// All protocol state of one connection, its sessions and their links.
///
/// Sessions and links live in generation-checked registries owned here;
/// [`Session`](crate::session::Session) and [`Link`](crate::link::Link)
/// values are handles into these tables. The session and link frame handlers
/// are implemented next to their record types.
pub(crate) struct ConnectionCore {
    pub(crate) state: ConnectionState,
    pub(crate) options: ConnectionOptions,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) label: String,
    pub(crate) trace: bool,
    pub(crate) listening: bool,
    io_source: Option<TransportSource>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    events_tx: mpsc::UnboundedSender<IoEvent>,
    io_cancel: CancellationToken,
    pub(crate) remote_open: Option<Open>,
    pub(crate) idle_empty_frame_send_percentage: f64,
    pub(crate) sessions: Registry<SessionRecord>,
    pub(crate) links: Registry<LinkRecord>,
    pub(crate) local_channels: BTreeMap<u16, Handle>,
    pub(crate) remote_channels: HashMap<u16, Handle>,
    pub(crate) notifications: Vec<Notification>,
    pub(crate) events: ConnectionEvents,
}

impl ConnectionCore {
    pub(crate) fn new(
        host: String,
        port: u16,
        options: ConnectionOptions,
        source: TransportSource,
        events_tx: mpsc::UnboundedSender<IoEvent>,
        io_cancel: CancellationToken,
        events: ConnectionEvents,
    ) -> Self {
        let label = format!("connection[{}]", options.container_id);
        Self {
            state: ConnectionState::Start,
            trace: options.enable_trace,
            options,
            host,
            port,
            label,
            listening: false,
            io_source: Some(source),
            outbound: None,
            events_tx,
            io_cancel,
            remote_open: None,
            idle_empty_frame_send_percentage: 0.5,
            sessions: Registry::new(),
            links: Registry::new(),
            local_channels: BTreeMap::new(),
            remote_channels: HashMap::new(),
            notifications: Vec::new(),
            events,
        }
    }

    pub(crate) fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub(crate) fn set_state(&mut self, new: ConnectionState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        log::debug!("{}: state {old} -> {new}", self.label);
        self.notify(Notification::ConnectionState { old, new });
    }

    pub(crate) fn send_frame(&mut self, frame: Frame) {
        if self.trace {
            log::trace!("{}: queue {}", self.label, frame.describe());
        }
        match &self.outbound {
            Some(tx) => {
                if tx.send(Outbound::Frame(frame)).is_err() {
                    log::debug!("{}: dropping frame, I/O task has stopped", self.label);
                }
            }
            None => log::warn!(
                "{}: dropping {}, transport is not running",
                self.label,
                frame.describe()
            ),
        }
    }

    pub(crate) fn send_performative(&mut self, channel: u16, performative: Performative) {
        self.send_frame(Frame::amqp(channel, performative));
    }

    fn start_io(&mut self) -> AmqpResult<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AmqpError::invalid_state(
                "connection I/O requires a running tokio runtime",
            ));
        }
        let source = self
            .io_source
            .take()
            .ok_or_else(|| AmqpError::invalid_state("transport has already been started"))?;
        let config = IoConfig {
            max_frame_size: self.options.max_frame_size,
            idle_timeout: self.options.idle_timeout,
            sasl: self.options.sasl.clone(),
            sasl_validator: self.options.sasl_validator.clone(),
            trace: self.trace,
            label: self.label.clone(),
        };
        let outbound = io::spawn_io(source, config, self.events_tx.clone(), self.io_cancel.clone())?;
        self.outbound = Some(outbound);
        Ok(())
    }

    fn shutdown_io(&mut self) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Outbound::Shutdown);
        }
    }

    fn local_open(&self) -> Open {
        Open {
            container_id: self.options.container_id.clone(),
            hostname: (!self.listening).then(|| self.host.clone()),
            max_frame_size: self.options.max_frame_size,
            channel_max: self.options.max_channel_count,
            idle_timeout_ms: u32::try_from(self.options.idle_timeout.as_millis())
                .unwrap_or(u32::MAX),
            properties: self.options.properties.clone(),
        }
    }

    pub(crate) fn negotiated_channel_max(&self) -> u16 {
        let remote = self
            .remote_open
            .as_ref()
            .map(|open| open.channel_max)
            .unwrap_or(u16::MAX);
        self.options.max_channel_count.min(remote)
    }

    pub(crate) fn open(&mut self) -> AmqpResult<()> {
        match self.state {
            ConnectionState::Start if !self.listening => {
                self.start_io()?;
                self.send_frame(Frame::Header(ProtocolId::Amqp));
                self.set_state(ConnectionState::HeaderSent);
                let open = self.local_open();
                self.send_performative(0, Performative::Open(open));
                self.set_state(ConnectionState::OpenPipe);
                Ok(())
            }
            ConnectionState::Start => Err(AmqpError::invalid_state(
                "a listening connection is opened by its peer",
            )),
            state if state.is_terminal() => Err(AmqpError::ConnectionClosed(format!(
                "connection is in state {state}"
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn listen(&mut self) -> AmqpResult<()> {
        if self.state != ConnectionState::Start || self.listening {
            return Err(AmqpError::invalid_state(
                "listen requires a connection that has not been opened",
            ));
        }
        if !matches!(self.io_source, Some(TransportSource::Accepted(_))) {
            return Err(AmqpError::invalid_state(
                "only connections created from an accepted transport can listen",
            ));
        }
        self.listening = true;
        self.start_io()
    }

    /// Opens the connection on behalf of a session that wants to begin.
    pub(crate) fn ensure_opening(&mut self) -> AmqpResult<()> {
        match self.state {
            ConnectionState::Start if !self.listening => self.open(),
            state if state.is_terminal() || state.is_closing() => Err(
                AmqpError::ConnectionClosed(format!("connection is in state {state}")),
            ),
            _ => Ok(()),
        }
    }

    pub(crate) fn close(&mut self, error: Option<AmqpErrorCondition>) -> AmqpResult<()> {
        let discarding = error.is_some();
        match self.state {
            ConnectionState::Start => Err(AmqpError::invalid_state(
                "connection has not been opened",
            )),
            ConnectionState::Opened => {
                self.send_performative(0, Performative::Close(Close { error }));
                self.set_state(if discarding {
                    ConnectionState::Discarding
                } else {
                    ConnectionState::CloseSent
                });
                Ok(())
            }
            ConnectionState::OpenPipe => {
                self.send_performative(0, Performative::Close(Close { error }));
                self.set_state(ConnectionState::OcPipe);
                Ok(())
            }
            ConnectionState::OpenSent => {
                self.send_performative(0, Performative::Close(Close { error }));
                self.set_state(ConnectionState::ClosePipe);
                Ok(())
            }
            ConnectionState::HeaderReceived
            | ConnectionState::HeaderSent
            | ConnectionState::HeaderExchanged
            | ConnectionState::OpenReceived => {
                self.set_state(ConnectionState::End);
                self.terminate_children(&AmqpError::ConnectionClosed(
                    "connection closed before open completed".to_string(),
                ));
                self.shutdown_io();
                Ok(())
            }
            ConnectionState::OcPipe
            | ConnectionState::ClosePipe
            | ConnectionState::CloseSent
            | ConnectionState::CloseReceived
            | ConnectionState::Discarding
            | ConnectionState::End
            | ConnectionState::Error => Ok(()),
        }
    }

    pub(crate) fn set_idle_empty_frame_send_percentage(&mut self, ratio: f64) -> AmqpResult<()> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(AmqpError::InvalidArgument(format!(
                "idle empty frame send percentage must be in (0, 1], got {ratio}"
            )));
        }
        self.idle_empty_frame_send_percentage = ratio;
        if let Some(peer_idle) = self.remote_open.as_ref().map(|open| open.idle_timeout_ms) {
            self.start_heartbeat(peer_idle);
        }
        Ok(())
    }

    /// Largest frame either side accepts; the local limit until the peer's `open`.
    pub(crate) fn max_frame_size(&self) -> u32 {
        let local = self.options.max_frame_size;
        self.remote_open
            .as_ref()
            .map_or(local, |open| local.min(open.max_frame_size))
    }

    fn start_heartbeat(&mut self, peer_idle_ms: u32) {
        if peer_idle_ms == 0 {
            return;
        }
        let period =
            Duration::from_millis(u64::from(peer_idle_ms)).mul_f64(self.idle_empty_frame_send_percentage);
        if let Some(tx) = &self.outbound {
            let _ = tx.send(Outbound::Heartbeat(period));
        }
    }

    pub(crate) fn handle_io_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Frame(frame) => {
                if let Err(e) = self.handle_frame(frame) {
                    log::warn!("{}: closing after protocol violation: {e}", self.label);
                    if self.state == ConnectionState::Opened {
                        let error = AmqpErrorCondition::new(conditions::FRAMING_ERROR, e.to_string());
                        self.send_performative(0, Performative::Close(Close { error: Some(error) }));
                    }
                    self.fail(e);
                }
            }
            IoEvent::Failed(e) => self.fail(e),
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> AmqpResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        match frame {
            Frame::Header(ProtocolId::Amqp) => self.on_header(),
            Frame::Header(ProtocolId::Sasl) | Frame::Sasl(_) => Err(AmqpError::Protocol(
                "SASL frame received after negotiation".to_string(),
            )),
            Frame::Empty => Ok(()),
            Frame::Amqp {
                channel,
                performative,
                payload,
            } => match performative {
                Performative::Open(open) => self.on_open(open),
                Performative::Close(close) => {
                    self.on_close(close.error);
                    Ok(())
                }
                _ if self.state == ConnectionState::Discarding => Ok(()),
                other
                    if !matches!(
                        self.state,
                        ConnectionState::Opened | ConnectionState::CloseSent
                    ) =>
                {
                    Err(AmqpError::Protocol(format!(
                        "{} received in connection state {}",
                        other.name(),
                        self.state
                    )))
                }
                Performative::Begin(begin) => self.on_begin(channel, begin),
                Performative::End(end) => self.on_end(channel, end),
                Performative::Attach(attach) => self.on_attach(channel, attach),
                Performative::Flow(flow) => self.on_flow(channel, flow),
                Performative::Transfer(transfer) => self.on_transfer(channel, transfer, payload),
                Performative::Disposition(disposition) => {
                    self.on_disposition(channel, disposition)
                }
                Performative::Detach(detach) => self.on_detach(channel, detach),
            },
        }
    }

    fn on_header(&mut self) -> AmqpResult<()> {
        match self.state {
            ConnectionState::Start if self.listening => {
                self.set_state(ConnectionState::HeaderReceived);
                self.send_frame(Frame::Header(ProtocolId::Amqp));
                self.set_state(ConnectionState::HeaderExchanged);
            }
            ConnectionState::HeaderSent => self.set_state(ConnectionState::HeaderExchanged),
            ConnectionState::OpenPipe => self.set_state(ConnectionState::OpenSent),
            ConnectionState::OcPipe => self.set_state(ConnectionState::ClosePipe),
            state => {
                return Err(AmqpError::Protocol(format!(
                    "protocol header received in state {state}"
                )));
            }
        }
        Ok(())
    }

    fn on_open(&mut self, open: Open) -> AmqpResult<()> {
        let peer_idle_ms = open.idle_timeout_ms;
        match self.state {
            ConnectionState::HeaderExchanged => {
                self.remote_open = Some(open);
                self.set_state(ConnectionState::OpenReceived);
                let local = self.local_open();
                self.send_performative(0, Performative::Open(local));
                self.set_state(ConnectionState::Opened);
            }
            ConnectionState::OpenSent => {
                self.remote_open = Some(open);
                self.set_state(ConnectionState::Opened);
            }
            ConnectionState::ClosePipe => {
                self.remote_open = Some(open);
                self.set_state(ConnectionState::CloseSent);
                return Ok(());
            }
            state => {
                return Err(AmqpError::Protocol(format!(
                    "open received in state {state}"
                )));
            }
        }
        let max_frame_size = self.max_frame_size();
        if let Some(tx) = &self.outbound {
            let _ = tx.send(Outbound::FrameLimit(max_frame_size));
        }
        log::info!(
            "{}: opened with peer container '{}'",
            self.label,
            self.remote_open
                .as_ref()
                .map(|open| open.container_id.as_str())
                .unwrap_or_default()
        );
        self.start_heartbeat(peer_idle_ms);
        self.flush_pending_begins();
        Ok(())
    }

    fn on_close(&mut self, error: Option<AmqpErrorCondition>) {
        match &error {
            Some(error) => log::warn!("{}: peer closed the connection: {error}", self.label),
            None => log::debug!("{}: peer closed the connection", self.label),
        }
        if !self.state.is_closing() {
            self.set_state(ConnectionState::CloseReceived);
            self.send_performative(0, Performative::Close(Close { error: None }));
        }
        self.set_state(ConnectionState::End);
        let reason = AmqpError::ConnectionClosed(
            error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "connection closed".to_string()),
        );
        self.terminate_children(&reason);
        self.shutdown_io();
    }

    /// Moves the connection to `Error` and fails every session and link on it.
    pub(crate) fn fail(&mut self, error: AmqpError) {
        if self.state.is_terminal() {
            return;
        }
        log::error!("{}: connection failed: {error}", self.label);
        self.set_state(ConnectionState::Error);
        self.notify(Notification::IoError(error.clone()));
        self.terminate_children(&error);
        self.shutdown_io();
        self.io_cancel.cancel();
    }

    fn terminate_children(&mut self, error: &AmqpError) {
        for session in self.sessions.handles() {
            self.fail_session(session, error);
        }
        self.local_channels.clear();
        self.remote_channels.clear();
    }

    /// Removes detached links and ended sessions that no handle refers to.
    ///
    /// Nothing is removed while notifications are queued, since dispatching
    /// them hands out new handles. The removed records are returned so their
    /// callbacks are dropped after the connection lock is released.
    pub(crate) fn reclaim(&mut self) -> Reclaimed {
        let mut reclaimed = Reclaimed::default();
        if !self.notifications.is_empty() {
            return reclaimed;
        }
        for link in self.links.handles() {
            if !self.links.get(link).is_some_and(LinkRecord::is_reclaimable) {
                continue;
            }
            let Some(record) = self.links.remove(link) else {
                continue;
            };
            if let Some(session) = self.sessions.get_mut(record.session) {
                session.links.retain(|handle| *handle != link);
                session.output_handles.retain(|_, handle| *handle != link);
                session.input_handles.retain(|_, handle| *handle != link);
            }
            reclaimed.links.push(record);
        }
        for session in self.sessions.handles() {
            if !self
                .sessions
                .get(session)
                .is_some_and(SessionRecord::is_reclaimable)
            {
                continue;
            }
            let Some(record) = self.sessions.remove(session) else {
                continue;
            };
            self.local_channels.retain(|_, handle| *handle != session);
            self.remote_channels.retain(|_, handle| *handle != session);
            reclaimed.sessions.push(record);
        }
        if self.trace && !reclaimed.is_empty() {
            log::trace!(
                "{}: reclaimed {} link(s) and {} session(s)",
                self.label,
                reclaimed.links.len(),
                reclaimed.sessions.len()
            );
        }
        reclaimed
    }

    pub(crate) fn session_for_remote_channel(&self, channel: u16) -> AmqpResult<Handle> {
        self.remote_channels.get(&channel).copied().ok_or_else(|| {
            AmqpError::Protocol(format!("frame received on unmapped channel {channel}"))
        })
    }
}
