//! AMQP sessions.

use crate::common::{Handle, HandleRef, Liveness};
use crate::connection::engine::ConnectionCore;
use crate::connection::events::Notification;
use crate::connection::{Connection, ConnectionInner};
use crate::link::{Link, LinkEndpoint};
use crate::management::{ManagementClient, ManagementClientOptions};
use crate::message_receiver::{MessageReceiver, MessageReceiverEvents, MessageReceiverOptions};
use crate::message_sender::{MessageSender, MessageSenderEvents, MessageSenderOptions};
use crate::models::{
    AmqpErrorCondition, AmqpProperties, Begin, Detach, End, Flow, Performative, Role, conditions,
};
use crate::{AmqpError, AmqpResult};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

/// AMQP 1.0 session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unmapped,
    BeginSent,
    BeginReceived,
    Mapped,
    EndSent,
    EndReceived,
    Discarding,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub initial_incoming_window_size: u32,
    pub initial_outgoing_window_size: u32,
    pub maximum_link_count: u32,
    pub enable_trace: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            initial_incoming_window_size: 1,
            initial_outgoing_window_size: 1,
            maximum_link_count: u32::MAX,
            enable_trace: false,
        }
    }
}

pub type LinkAttachedFn = Arc<dyn Fn(&Session, LinkEndpoint) -> bool + Send + Sync>;
pub type SessionStateChangedFn = Arc<dyn Fn(&Session, SessionState, SessionState) + Send + Sync>;

/// Callbacks registered on a [`Session`].
#[derive(Clone, Default)]
pub struct SessionEvents {
    pub(crate) on_link_attached: Option<LinkAttachedFn>,
    pub(crate) on_state_changed: Option<SessionStateChangedFn>,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for each link the peer attaches first.
    ///
    /// Claim the endpoint with [`Link::from_endpoint`] (or one of the
    /// sender/receiver `from_endpoint` constructors) and attach it. Returning
    /// `false` detaches the offered link with `amqp:not-allowed`.
    pub fn on_link_attached<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Session, LinkEndpoint) -> bool + Send + Sync + 'static,
    {
        self.on_link_attached = Some(Arc::new(callback));
        self
    }

    /// Called with `(session, new_state, old_state)`.
    pub fn on_state_changed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Session, SessionState, SessionState) + Send + Sync + 'static,
    {
        self.on_state_changed = Some(Arc::new(callback));
        self
    }
}

/// A session the peer began on a listening connection, waiting to be claimed.
///
/// Dropping an unclaimed endpoint ends the offered session.
pub struct Endpoint {
    connection: Weak<ConnectionInner>,
    session: Handle,
    held: HandleRef,
    claimed: bool,
}

impl Endpoint {
    pub(crate) fn new(connection: Weak<ConnectionInner>, session: Handle, held: HandleRef) -> Self {
        Self {
            connection,
            session,
            held,
            claimed: false,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("session", &self.session)
            .field("claimed", &self.claimed)
            .finish()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        if let Some(inner) = self.connection.upgrade() {
            inner.core().refuse_session(self.session);
        }
    }
}

/// Handle to a session on a [`Connection`].
///
/// Clones refer to the same session. Operations fail with
/// [`AmqpError::ConnectionClosed`] once every connection handle is dropped.
#[derive(Clone)]
pub struct Session {
    connection: Weak<ConnectionInner>,
    handle: Handle,
    _held: HandleRef,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("state", &self.state().ok())
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.connection.ptr_eq(&other.connection)
    }
}

impl Session {
    /// Creates an unmapped session on `connection`.
    pub fn new(
        connection: &Connection,
        options: SessionOptions,
        events: SessionEvents,
    ) -> AmqpResult<Self> {
        let (handle, held) = connection.inner.core().create_session(&options, events)?;
        Ok(Self {
            connection: Arc::downgrade(&connection.inner),
            handle,
            _held: held,
        })
    }

    /// Claims a session offered by the peer. Call [`begin`](Self::begin) to
    /// answer the peer's `begin`.
    pub fn from_endpoint(
        mut endpoint: Endpoint,
        options: SessionOptions,
        events: SessionEvents,
    ) -> AmqpResult<Self> {
        let inner = endpoint
            .connection
            .upgrade()
            .ok_or_else(AmqpError::connection_dropped)?;
        inner.core().claim_session(endpoint.session, &options, events)?;
        endpoint.claimed = true;
        Ok(Self {
            connection: endpoint.connection.clone(),
            handle: endpoint.session,
            _held: endpoint.held.clone(),
        })
    }

    pub(crate) fn from_parts(
        connection: Weak<ConnectionInner>,
        handle: Handle,
        held: HandleRef,
    ) -> Self {
        Self {
            connection,
            handle,
            _held: held,
        }
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn with_core<R>(
        &self,
        f: impl FnOnce(&mut ConnectionCore) -> AmqpResult<R>,
    ) -> AmqpResult<R> {
        let inner = self
            .connection
            .upgrade()
            .ok_or_else(AmqpError::connection_dropped)?;
        let mut core = inner.core();
        f(&mut core)
    }

    fn with_record<R>(&self, f: impl FnOnce(&SessionRecord) -> R) -> AmqpResult<R> {
        self.with_core(|core| core.session(self.handle).map(f))
    }

    fn update_unbegun(&self, f: impl FnOnce(&mut SessionRecord)) -> AmqpResult<()> {
        self.with_core(|core| {
            let record = core.session_mut(self.handle)?;
            if record.begin_requested || record.state != SessionState::Unmapped {
                return Err(AmqpError::invalid_state(
                    "session settings can only change before begin",
                ));
            }
            f(record);
            Ok(())
        })
    }

    /// The owning connection.
    pub fn connection(&self) -> AmqpResult<Connection> {
        self.connection
            .upgrade()
            .map(|inner| Connection { inner })
            .ok_or_else(AmqpError::connection_dropped)
    }

    /// Sends `begin`, opening the connection first if it has not been opened.
    ///
    /// If the connection is still opening, `begin` is sent once it reaches
    /// `Opened`.
    pub fn begin(&self) -> AmqpResult<()> {
        self.with_core(|core| core.begin_session(self.handle))
    }

    /// Sends `end`. A non-empty `condition` ends the session with that error.
    pub fn end(&self, condition: &str, description: &str) -> AmqpResult<()> {
        let error = AmqpErrorCondition::from_parts(condition, description, AmqpProperties::new());
        self.with_core(|core| core.end_session(self.handle, error))
    }

    pub fn state(&self) -> AmqpResult<SessionState> {
        self.with_record(|record| record.state)
    }

    pub fn incoming_window(&self) -> AmqpResult<u32> {
        self.with_record(|record| record.incoming_window)
    }

    pub fn outgoing_window(&self) -> AmqpResult<u32> {
        self.with_record(|record| record.outgoing_window)
    }

    /// Highest link handle allowed; reflects the peer's limit once mapped.
    pub fn handle_max(&self) -> AmqpResult<u32> {
        self.with_record(|record| record.handle_max)
    }

    pub fn set_incoming_window(&self, window: u32) -> AmqpResult<()> {
        self.update_unbegun(|record| {
            record.incoming_window = window;
            record.remaining_incoming_window = window;
        })
    }

    pub fn set_outgoing_window(&self, window: u32) -> AmqpResult<()> {
        self.update_unbegun(|record| record.outgoing_window = window)
    }

    pub fn set_handle_max(&self, handle_max: u32) -> AmqpResult<()> {
        self.update_unbegun(|record| record.handle_max = handle_max)
    }

    /// Creates a sender link on this session.
    pub fn create_sender_link(&self, name: &str, source: &str, target: &str) -> AmqpResult<Link> {
        Link::new(self, name, Role::Sender, source, target)
    }

    /// Creates a receiver link on this session.
    pub fn create_receiver_link(&self, name: &str, source: &str, target: &str) -> AmqpResult<Link> {
        Link::new(self, name, Role::Receiver, source, target)
    }

    pub fn create_message_sender(
        &self,
        target: &str,
        options: MessageSenderOptions,
        events: MessageSenderEvents,
    ) -> AmqpResult<MessageSender> {
        MessageSender::new(self, target, options, events)
    }

    pub fn create_message_sender_from_endpoint(
        &self,
        endpoint: LinkEndpoint,
        options: MessageSenderOptions,
        events: MessageSenderEvents,
    ) -> AmqpResult<MessageSender> {
        MessageSender::from_endpoint(endpoint, options, events)
    }

    pub fn create_message_receiver(
        &self,
        source: &str,
        options: MessageReceiverOptions,
        events: MessageReceiverEvents,
    ) -> AmqpResult<MessageReceiver> {
        MessageReceiver::new(self, source, options, events)
    }

    pub fn create_message_receiver_from_endpoint(
        &self,
        endpoint: LinkEndpoint,
        options: MessageReceiverOptions,
        events: MessageReceiverEvents,
    ) -> AmqpResult<MessageReceiver> {
        MessageReceiver::from_endpoint(endpoint, options, events)
    }

    pub fn create_management_client(
        &self,
        node: &str,
        options: ManagementClientOptions,
    ) -> AmqpResult<ManagementClient> {
        ManagementClient::new(self, node, options)
    }

    /// Detaches an offered link without claiming it.
    pub fn send_detach(
        &self,
        endpoint: LinkEndpoint,
        closed: bool,
        condition: &str,
        description: &str,
    ) -> AmqpResult<()> {
        let (link, _held) = endpoint.claim();
        let error = AmqpErrorCondition::from_parts(condition, description, AmqpProperties::new());
        self.with_core(|core| core.reject_link(link, closed, error))
    }
}

/// Session state held by the connection.
pub(crate) struct SessionRecord {
    pub(crate) state: SessionState,
    pub(crate) incoming_window: u32,
    pub(crate) outgoing_window: u32,
    pub(crate) handle_max: u32,
    pub(crate) trace: bool,
    pub(crate) local_channel: Option<u16>,
    pub(crate) remote_channel: Option<u16>,
    pub(crate) begin_requested: bool,
    pub(crate) begin_pending: bool,
    pub(crate) offered: bool,
    pub(crate) claimed: bool,
    pub(crate) next_outgoing_id: u32,
    pub(crate) next_incoming_id: u32,
    pub(crate) remaining_incoming_window: u32,
    pub(crate) remote_incoming_window: u32,
    pub(crate) remote_outgoing_window: u32,
    pub(crate) output_handles: BTreeMap<u32, Handle>,
    pub(crate) input_handles: HashMap<u32, Handle>,
    pub(crate) links: Vec<Handle>,
    pub(crate) events: SessionEvents,
    pub(crate) liveness: Liveness,
}

impl SessionRecord {
    fn new(options: &SessionOptions, events: SessionEvents, trace: bool) -> Self {
        Self {
            state: SessionState::Unmapped,
            incoming_window: options.initial_incoming_window_size,
            outgoing_window: options.initial_outgoing_window_size,
            handle_max: options.maximum_link_count,
            trace: trace || options.enable_trace,
            local_channel: None,
            remote_channel: None,
            begin_requested: false,
            begin_pending: false,
            offered: false,
            claimed: false,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            remaining_incoming_window: options.initial_incoming_window_size,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            output_handles: BTreeMap::new(),
            input_handles: HashMap::new(),
            links: Vec::new(),
            events,
            liveness: Liveness::default(),
        }
    }

    fn offered(channel: u16, begin: &Begin, trace: bool) -> Self {
        let mut record = Self::new(&SessionOptions::default(), SessionEvents::default(), trace);
        record.offered = true;
        record.remote_channel = Some(channel);
        record.next_incoming_id = begin.next_outgoing_id;
        record.remote_incoming_window = begin.incoming_window;
        record.remote_outgoing_window = begin.outgoing_window;
        record.handle_max = begin.handle_max;
        record
    }

    /// True once the session has ended or failed, has no links left and no
    /// [`Session`] or [`Endpoint`] refers to it.
    pub(crate) fn is_reclaimable(&self) -> bool {
        if self.liveness.is_held() || !self.links.is_empty() {
            return false;
        }
        match self.state {
            SessionState::Error => true,
            SessionState::Unmapped => {
                !self.begin_pending && self.local_channel.is_none() && self.remote_channel.is_none()
            }
            _ => false,
        }
    }

    /// Session-level `flow` advertising the current windows.
    pub(crate) fn flow(&self) -> Flow {
        Flow {
            next_incoming_id: Some(self.next_incoming_id),
            incoming_window: self.remaining_incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            handle: None,
            delivery_count: None,
            link_credit: None,
            drain: false,
        }
    }
}

impl ConnectionCore {
    pub(crate) fn session(&self, handle: Handle) -> AmqpResult<&SessionRecord> {
        self.sessions
            .get(handle)
            .ok_or_else(|| AmqpError::invalid_state("session no longer exists"))
    }

    pub(crate) fn session_mut(&mut self, handle: Handle) -> AmqpResult<&mut SessionRecord> {
        self.sessions
            .get_mut(handle)
            .ok_or_else(|| AmqpError::invalid_state("session no longer exists"))
    }

    pub(crate) fn set_session_state(&mut self, session: Handle, new: SessionState) {
        let Some(record) = self.sessions.get_mut(session) else {
            return;
        };
        let old = record.state;
        if old == new {
            return;
        }
        record.state = new;
        log::debug!("{}: session {:?} {old} -> {new}", self.label, record.local_channel);
        self.notify(Notification::SessionState { session, old, new });
    }

    pub(crate) fn create_session(
        &mut self,
        options: &SessionOptions,
        events: SessionEvents,
    ) -> AmqpResult<(Handle, HandleRef)> {
        if self.state.is_terminal() {
            return Err(AmqpError::ConnectionClosed(format!(
                "cannot create a session on a connection in state {}",
                self.state
            )));
        }
        let mut record = SessionRecord::new(options, events, self.trace);
        let held = record.liveness.acquire();
        Ok((self.sessions.insert(record), held))
    }

    /// A [`HandleRef`] keeping `session` from being swept.
    pub(crate) fn hold_session(&mut self, session: Handle) -> AmqpResult<HandleRef> {
        Ok(self.session_mut(session)?.liveness.acquire())
    }

    pub(crate) fn claim_session(
        &mut self,
        session: Handle,
        options: &SessionOptions,
        events: SessionEvents,
    ) -> AmqpResult<()> {
        let record = self.session_mut(session)?;
        if !record.offered || record.claimed {
            return Err(AmqpError::invalid_state("session endpoint was already claimed"));
        }
        record.claimed = true;
        record.incoming_window = options.initial_incoming_window_size;
        record.remaining_incoming_window = options.initial_incoming_window_size;
        record.outgoing_window = options.initial_outgoing_window_size;
        record.handle_max = record.handle_max.min(options.maximum_link_count);
        record.trace |= options.enable_trace;
        record.events = events;
        Ok(())
    }

    pub(crate) fn begin_session(&mut self, session: Handle) -> AmqpResult<()> {
        if self.session(session)?.begin_requested {
            return Err(AmqpError::invalid_state("session has already begun"));
        }
        self.ensure_opening()?;
        let record = self.session_mut(session)?;
        record.begin_requested = true;
        record.begin_pending = true;
        if self.state == crate::connection::ConnectionState::Opened {
            self.send_begin(session)?;
        }
        Ok(())
    }

    pub(crate) fn flush_pending_begins(&mut self) {
        for session in self.sessions.handles() {
            let pending = self
                .sessions
                .get(session)
                .is_some_and(|record| record.begin_pending);
            if pending {
                if let Err(e) = self.send_begin(session) {
                    log::error!("{}: failed to begin session: {e}", self.label);
                    self.fail_session(session, &e);
                }
            }
        }
    }

    fn send_begin(&mut self, session: Handle) -> AmqpResult<()> {
        let channel_max = self.negotiated_channel_max();
        let channel = (0..=channel_max)
            .find(|channel| !self.local_channels.contains_key(channel))
            .ok_or(AmqpError::ChannelMaxExceeded(channel_max))?;

        let record = self.session_mut(session)?;
        record.begin_pending = false;
        record.local_channel = Some(channel);
        let begin = Begin {
            remote_channel: record.remote_channel,
            next_outgoing_id: record.next_outgoing_id,
            incoming_window: record.incoming_window,
            outgoing_window: record.outgoing_window,
            handle_max: record.handle_max,
        };
        let offered = record.offered;

        self.local_channels.insert(channel, session);
        self.send_performative(channel, Performative::Begin(begin));
        if offered {
            self.set_session_state(session, SessionState::Mapped);
            self.flush_pending_attaches(session);
        } else {
            self.set_session_state(session, SessionState::BeginSent);
        }
        Ok(())
    }

    pub(crate) fn on_begin(&mut self, channel: u16, begin: Begin) -> AmqpResult<()> {
        if self.remote_channels.contains_key(&channel) {
            return Err(AmqpError::Protocol(format!(
                "begin received on channel {channel} which is already mapped"
            )));
        }
        let Some(local_channel) = begin.remote_channel else {
            let session = self
                .sessions
                .insert(SessionRecord::offered(channel, &begin, self.trace));
            self.remote_channels.insert(channel, session);
            self.set_session_state(session, SessionState::BeginReceived);
            self.notify(Notification::NewEndpoint(session));
            return Ok(());
        };

        let session = self
            .local_channels
            .get(&local_channel)
            .copied()
            .ok_or_else(|| {
                AmqpError::Protocol(format!("begin answers unknown channel {local_channel}"))
            })?;
        let record = self.session_mut(session)?;
        record.remote_channel = Some(channel);
        record.next_incoming_id = begin.next_outgoing_id;
        record.remote_incoming_window = begin.incoming_window;
        record.remote_outgoing_window = begin.outgoing_window;
        record.handle_max = record.handle_max.min(begin.handle_max);
        let state = record.state;
        self.remote_channels.insert(channel, session);

        match state {
            SessionState::BeginSent => {
                self.set_session_state(session, SessionState::Mapped);
                self.flush_pending_attaches(session);
                Ok(())
            }
            SessionState::EndSent | SessionState::Discarding => Ok(()),
            state => Err(AmqpError::Protocol(format!(
                "begin received for session in state {state}"
            ))),
        }
    }

    pub(crate) fn end_session(
        &mut self,
        session: Handle,
        error: Option<AmqpErrorCondition>,
    ) -> AmqpResult<()> {
        let record = self.session_mut(session)?;
        let state = record.state;
        match state {
            SessionState::Unmapped if record.begin_pending => {
                record.begin_pending = false;
                Ok(())
            }
            SessionState::Unmapped | SessionState::BeginReceived | SessionState::Error => Err(
                AmqpError::invalid_state(format!("cannot end a session in state {state}")),
            ),
            SessionState::BeginSent | SessionState::Mapped => {
                let Some(channel) = record.local_channel else {
                    return Err(AmqpError::invalid_state("session has no channel"));
                };
                let discarding = error.is_some();
                self.send_performative(channel, Performative::End(End { error }));
                self.set_session_state(
                    session,
                    if discarding {
                        SessionState::Discarding
                    } else {
                        SessionState::EndSent
                    },
                );
                Ok(())
            }
            SessionState::EndSent | SessionState::EndReceived | SessionState::Discarding => Ok(()),
        }
    }

    pub(crate) fn on_end(&mut self, channel: u16, end: End) -> AmqpResult<()> {
        let session = self.session_for_remote_channel(channel)?;
        let record = self.session(session)?;
        let local_channel = record.local_channel;
        let state = record.state;
        match state {
            SessionState::EndSent | SessionState::Discarding => {}
            SessionState::Mapped | SessionState::BeginSent => {
                self.set_session_state(session, SessionState::EndReceived);
                if let Some(local_channel) = local_channel {
                    self.send_performative(local_channel, Performative::End(End { error: None }));
                }
            }
            state => {
                return Err(AmqpError::Protocol(format!(
                    "end received for session in state {state}"
                )));
            }
        }
        if let Some(error) = &end.error {
            log::warn!("{}: peer ended session with {error}", self.label);
        }
        self.finish_session(session, end.error);
        Ok(())
    }

    /// Releases the channels of an ended session and detaches its links.
    fn finish_session(&mut self, session: Handle, error: Option<AmqpErrorCondition>) {
        let Some(record) = self.sessions.get_mut(session) else {
            return;
        };
        let local = record.local_channel.take();
        let remote = record.remote_channel.take();
        let links = record.links.clone();
        record.output_handles.clear();
        record.input_handles.clear();
        if let Some(local) = local {
            self.local_channels.remove(&local);
        }
        if let Some(remote) = remote {
            self.remote_channels.remove(&remote);
        }
        for link in links {
            self.complete_detach(link, error.clone());
        }
        self.set_session_state(session, SessionState::Unmapped);
    }

    pub(crate) fn fail_session(&mut self, session: Handle, error: &AmqpError) {
        let Some(record) = self.sessions.get_mut(session) else {
            return;
        };
        record.begin_pending = false;
        let links = record.links.clone();
        for link in links {
            self.fail_link(link, error);
        }
        self.set_session_state(session, SessionState::Error);
    }

    /// Answers and ends an offered session that nobody claimed.
    pub(crate) fn refuse_session(&mut self, session: Handle) {
        let Some(record) = self.sessions.get_mut(session) else {
            return;
        };
        if !record.offered {
            return;
        }
        if !record.claimed {
            record.claimed = true;
            record.begin_requested = true;
            if let Err(e) = self.send_begin(session) {
                log::warn!("{}: failed to answer refused session: {e}", self.label);
                return;
            }
        }
        let error = AmqpErrorCondition::new(conditions::NOT_ALLOWED, "session refused");
        if let Err(e) = self.end_session(session, Some(error)) {
            log::debug!("{}: refused session already ending: {e}", self.label);
        }
    }

    /// Accounts an incoming transfer against the session window.
    pub(crate) fn record_incoming_transfer(&mut self, session: Handle, delivery_id: u32) {
        let Some(record) = self.sessions.get_mut(session) else {
            return;
        };
        record.next_incoming_id = delivery_id.wrapping_add(1);
        record.remaining_incoming_window = record.remaining_incoming_window.saturating_sub(1);
        if record.remaining_incoming_window > record.incoming_window / 2 {
            return;
        }
        record.remaining_incoming_window = record.incoming_window;
        let flow = record.flow();
        if let Some(channel) = record.local_channel {
            self.send_performative(channel, Performative::Flow(flow));
        }
    }

    pub(crate) fn on_flow(&mut self, channel: u16, flow: Flow) -> AmqpResult<()> {
        let session = self.session_for_remote_channel(channel)?;
        let record = self.session_mut(session)?;
        record.remote_outgoing_window = flow.outgoing_window;
        record.remote_incoming_window = match flow.next_incoming_id {
            Some(next_incoming_id) => next_incoming_id
                .wrapping_add(flow.incoming_window)
                .wrapping_sub(record.next_outgoing_id),
            None => flow.incoming_window,
        };
        if let Some(remote_handle) = flow.handle {
            let link = record
                .input_handles
                .get(&remote_handle)
                .copied()
                .ok_or_else(|| {
                    AmqpError::Protocol(format!("flow for unattached handle {remote_handle}"))
                })?;
            self.on_link_flow(link, &flow);
        }
        let links = self.session(session)?.links.clone();
        for link in links {
            self.flush_link(link);
        }
        Ok(())
    }

    pub(crate) fn flush_pending_attaches(&mut self, session: Handle) {
        let Some(record) = self.sessions.get(session) else {
            return;
        };
        for link in record.links.clone() {
            let pending = self
                .links
                .get(link)
                .is_some_and(|record| record.attach_pending);
            if pending {
                if let Err(e) = self.send_attach(link) {
                    log::error!("{}: failed to attach link: {e}", self.label);
                    self.fail_link(link, &e);
                }
            }
        }
    }

    /// Sends `detach` for an output handle on a session, if the session is mapped.
    pub(crate) fn send_detach_frame(&mut self, session: Handle, detach: Detach) {
        let channel = self.sessions.get(session).and_then(|record| record.local_channel);
        match channel {
            Some(channel) => self.send_performative(channel, Performative::Detach(detach)),
            None => log::debug!("{}: skipping detach on an unmapped session", self.label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionEvents, ConnectionOptions};

    fn connection() -> Connection {
        Connection::new("localhost:5672", ConnectionOptions::default(), ConnectionEvents::new())
            .unwrap()
    }

    #[test]
    fn test_session_defaults() {
        let connection = connection();
        let session = Session::new(&connection, SessionOptions::default(), SessionEvents::new())
            .unwrap();
        assert_eq!(session.state().unwrap(), SessionState::Unmapped);
        assert_eq!(session.incoming_window().unwrap(), 1);
        assert_eq!(session.outgoing_window().unwrap(), 1);
        assert_eq!(session.handle_max().unwrap(), u32::MAX);
    }

    #[test]
    fn test_setters_apply_before_begin() {
        let connection = connection();
        let session = Session::new(&connection, SessionOptions::default(), SessionEvents::new())
            .unwrap();
        session.set_incoming_window(100).unwrap();
        session.set_outgoing_window(200).unwrap();
        session.set_handle_max(16).unwrap();
        assert_eq!(session.incoming_window().unwrap(), 100);
        assert_eq!(session.outgoing_window().unwrap(), 200);
        assert_eq!(session.handle_max().unwrap(), 16);
    }

    #[test]
    fn test_end_before_begin_is_rejected() {
        let connection = connection();
        let session = Session::new(&connection, SessionOptions::default(), SessionEvents::new())
            .unwrap();
        assert!(matches!(
            session.end("", ""),
            Err(AmqpError::InvalidState(_))
        ));
    }

    #[test]
    fn test_session_outliving_connection_reports_closed() {
        let connection = connection();
        let session = Session::new(&connection, SessionOptions::default(), SessionEvents::new())
            .unwrap();
        drop(connection);
        assert!(matches!(
            session.state(),
            Err(AmqpError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn test_begin_without_runtime_fails() {
        let connection = connection();
        let session = Session::new(&connection, SessionOptions::default(), SessionEvents::new())
            .unwrap();
        assert!(session.begin().is_err());
        assert_eq!(session.state().unwrap(), SessionState::Unmapped);
    }
    #[test]
    fn test_session_is_reclaimed_after_its_links() {
        let connection = connection();
        let session = Session::new(&connection, SessionOptions::default(), SessionEvents::new())
            .unwrap();
        let link = session.create_sender_link("tx", "s", "t").unwrap();

        drop(session);
        connection.poll().unwrap();
        assert_eq!(connection.session_count(), 1);
        assert_eq!(link.session().unwrap().state().unwrap(), SessionState::Unmapped);

        drop(link);
        connection.poll().unwrap();
        assert_eq!(connection.link_count(), 0);
        assert_eq!(connection.session_count(), 0);
    }
}
