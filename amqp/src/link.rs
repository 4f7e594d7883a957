//! AMQP links.
//!
//! A [`Link`] is one direction of message flow on a [`Session`]. Links are
//! configured before [`Link::attach`]; after that only credit and callbacks
//! change. Links the peer attaches first arrive as a [`LinkEndpoint`] through
//! [`SessionEvents::on_link_attached`](crate::session::SessionEvents::on_link_attached).

use crate::common::{AsyncOperationQueue, Context, Handle, HandleRef, Liveness, Pollable};
use crate::connection::engine::ConnectionCore;
use crate::connection::events::Notification;
use crate::connection::{Connection, ConnectionInner};
use crate::models::{
    AmqpErrorCondition, AmqpMessage, AmqpProperties, Attach, DeliveryState, Detach, Disposition,
    Flow, Frame, Performative, ReceiverSettleMode, Role, SenderSettleMode, Transfer, conditions,
};
use crate::session::{Session, SessionState};
use crate::{AmqpError, AmqpResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Detached,
    Attaching,
    Attached,
    Detaching,
    Error,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub type LinkStateChangedFn = Arc<dyn Fn(&Link, LinkState, LinkState) + Send + Sync>;
pub type LinkTransferFn = Arc<dyn Fn(&Link, &AmqpMessage) -> DeliveryState + Send + Sync>;
pub type LinkDetachedFn = Arc<dyn Fn(&Link, Option<&AmqpErrorCondition>) + Send + Sync>;
pub type LinkFlowFn = Arc<dyn Fn(&Link) + Send + Sync>;
pub type DeliverySettledFn = Arc<dyn Fn(&Link, u32, Option<&DeliveryState>) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct LinkEvents {
    pub(crate) on_state_changed: Option<LinkStateChangedFn>,
    pub(crate) on_transfer: Option<LinkTransferFn>,
    pub(crate) on_detached: Option<LinkDetachedFn>,
    pub(crate) on_flow: Option<LinkFlowFn>,
    pub(crate) on_delivery_settled: Option<DeliverySettledFn>,
}

type DeliveryOutcome = Arc<AsyncOperationQueue<AmqpResult<DeliveryState>>>;

pub(crate) struct PendingTransfer {
    message: AmqpMessage,
    outcome: DeliveryOutcome,
}

/// Outcome of a message handed to [`Link::transfer`].
#[derive(Clone)]
pub struct PendingDelivery {
    outcome: DeliveryOutcome,
}

impl std::fmt::Debug for PendingDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDelivery").finish_non_exhaustive()
    }
}

impl PendingDelivery {
    /// Returns the outcome if the delivery has already settled.
    pub fn try_outcome(&self) -> Option<AmqpResult<DeliveryState>> {
        self.outcome.try_take()
    }

    /// Waits for the peer's disposition while pumping `pollables`.
    ///
    /// Returns `None` if `ctx` is cancelled first.
    pub async fn wait(
        &self,
        ctx: &Context,
        pollables: &[&dyn Pollable],
    ) -> Option<AmqpResult<DeliveryState>> {
        self.outcome.wait_for_polled_result(ctx, pollables).await
    }
}

/// A link the peer attached first, waiting to be claimed.
///
/// Dropping an unclaimed endpoint detaches the link with `amqp:not-allowed`.
pub struct LinkEndpoint {
    connection: Weak<ConnectionInner>,
    link: Handle,
    held: HandleRef,
    name: String,
    role: Role,
    source: String,
    target: String,
    properties: AmqpProperties,
    claimed: bool,
}

impl LinkEndpoint {
    pub(crate) fn new(connection: Weak<ConnectionInner>, link: Handle, record: &mut LinkRecord) -> Self {
        Self {
            connection,
            link,
            held: record.liveness.acquire(),
            name: record.name.clone(),
            role: record.role,
            source: record.source.clone(),
            target: record.target.clone(),
            properties: record.peer_properties.clone(),
            claimed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role the local side plays once the endpoint is claimed.
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Properties the peer sent in its `attach`.
    pub fn properties(&self) -> &AmqpProperties {
        &self.properties
    }

    pub(crate) fn claim(mut self) -> (Handle, HandleRef) {
        self.claimed = true;
        (self.link, self.held.clone())
    }
}

impl fmt::Debug for LinkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEndpoint")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("source", &self.source)
            .field("target", &self.target)
            .finish()
    }
}

impl Drop for LinkEndpoint {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        if let Some(inner) = self.connection.upgrade() {
            inner.core().refuse_link(self.link);
        }
    }
}

/// Handle to a link. Clones refer to the same link.
#[derive(Clone)]
pub struct Link {
    connection: Weak<ConnectionInner>,
    handle: Handle,
    _held: HandleRef,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("handle", &self.handle)
            .field("name", &self.name().ok())
            .field("state", &self.state().ok())
            .finish()
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.connection.ptr_eq(&other.connection)
    }
}

impl Link {
    /// Creates a detached link on `session`.
    pub fn new(
        session: &Session,
        name: &str,
        role: Role,
        source: &str,
        target: &str,
    ) -> AmqpResult<Self> {
        let owner = session.handle();
        let (handle, held) = session.with_core(|core| {
            core.create_link(owner, LinkRecord::new(owner, name, role, source, target, core.trace))
        })?;
        let connection = session.connection()?;
        Ok(Self {
            connection: Arc::downgrade(&connection.inner),
            handle,
            _held: held,
        })
    }

    /// Claims a link the peer attached. Configure it, then call
    /// [`attach`](Self::attach) to answer the peer's `attach`.
    pub fn from_endpoint(endpoint: LinkEndpoint) -> AmqpResult<Self> {
        let connection = endpoint.connection.clone();
        let inner = connection
            .upgrade()
            .ok_or_else(AmqpError::connection_dropped)?;
        inner.core().claim_link(endpoint.link)?;
        let (handle, held) = endpoint.claim();
        Ok(Self {
            connection,
            handle,
            _held: held,
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

    fn with_core<R>(&self, f: impl FnOnce(&mut ConnectionCore) -> AmqpResult<R>) -> AmqpResult<R> {
        let inner = self
            .connection
            .upgrade()
            .ok_or_else(AmqpError::connection_dropped)?;
        let mut core = inner.core();
        f(&mut core)
    }

    fn with_record<R>(&self, f: impl FnOnce(&LinkRecord) -> R) -> AmqpResult<R> {
        self.with_core(|core| core.link(self.handle).map(f))
    }

    fn with_record_mut<R>(&self, f: impl FnOnce(&mut LinkRecord) -> R) -> AmqpResult<R> {
        self.with_core(|core| core.link_mut(self.handle).map(f))
    }

    fn configure(&self, setting: &str, f: impl FnOnce(&mut LinkRecord)) -> AmqpResult<()> {
        self.with_core(|core| {
            let record = core.link_mut(self.handle)?;
            if record.attach_requested {
                return Err(AmqpError::invalid_state(format!(
                    "{setting} can only be set before attach"
                )));
            }
            f(record);
            Ok(())
        })
    }

    pub fn connection(&self) -> AmqpResult<Connection> {
        self.connection
            .upgrade()
            .map(|inner| Connection { inner })
            .ok_or_else(AmqpError::connection_dropped)
    }

    pub fn session(&self) -> AmqpResult<Session> {
        let (session, held) = self.with_core(|core| {
            let session = core.link(self.handle)?.session;
            Ok((session, core.hold_session(session)?))
        })?;
        Ok(Session::from_parts(self.connection.clone(), session, held))
    }

    /// Sends `attach`, beginning the session first if needed.
    ///
    /// The link is `Attaching` until the peer's `attach` is processed; links
    /// claimed from an endpoint become `Attached` as soon as the reply is sent.
    pub fn attach(&self) -> AmqpResult<()> {
        self.with_core(|core| core.attach_link(self.handle))
    }

    /// Sends `detach`. `close` asks the peer to destroy the link's terminus.
    pub fn detach(
        &self,
        close: bool,
        condition: &str,
        description: &str,
        info: AmqpProperties,
    ) -> AmqpResult<()> {
        let error = AmqpErrorCondition::from_parts(condition, description, info);
        self.with_core(|core| core.detach_link(self.handle, close, error))
    }

    /// Grants `credit` to the peer sender.
    pub fn flow(&self, credit: u32) -> AmqpResult<()> {
        self.with_core(|core| core.issue_credit(self.handle, credit))
    }

    /// Queues `message` for transfer once credit allows.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::MessageTooLarge`] if the message exceeds the peer's
    /// max message size and [`AmqpError::InvalidState`] on a receiver link or
    /// a link that is not attaching or attached.
    pub fn transfer(&self, message: AmqpMessage) -> AmqpResult<PendingDelivery> {
        let outcome = self.with_core(|core| core.transfer(self.handle, message))?;
        Ok(PendingDelivery { outcome })
    }

    pub fn name(&self) -> AmqpResult<String> {
        self.with_record(|record| record.name.clone())
    }

    /// Local handle number, assigned when `attach` is sent.
    pub fn handle(&self) -> AmqpResult<Option<u32>> {
        self.with_record(|record| record.output_handle)
    }

    pub fn role(&self) -> AmqpResult<Role> {
        self.with_record(|record| record.role)
    }

    pub fn source(&self) -> AmqpResult<String> {
        self.with_record(|record| record.source.clone())
    }

    pub fn target(&self) -> AmqpResult<String> {
        self.with_record(|record| record.target.clone())
    }

    pub fn state(&self) -> AmqpResult<LinkState> {
        self.with_record(|record| record.state)
    }

    pub fn sender_settle_mode(&self) -> AmqpResult<SenderSettleMode> {
        self.with_record(|record| record.snd_settle_mode)
    }

    pub fn receiver_settle_mode(&self) -> AmqpResult<ReceiverSettleMode> {
        self.with_record(|record| record.rcv_settle_mode)
    }

    pub fn initial_delivery_count(&self) -> AmqpResult<u32> {
        self.with_record(|record| record.initial_delivery_count)
    }

    pub fn delivery_count(&self) -> AmqpResult<u32> {
        self.with_record(|record| record.delivery_count)
    }

    pub fn link_credit(&self) -> AmqpResult<u32> {
        self.with_record(|record| record.link_credit)
    }

    pub fn max_message_size(&self) -> AmqpResult<u64> {
        self.with_record(|record| record.max_message_size)
    }

    /// Max message size from the peer's `attach`; zero means unlimited.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidState`] until the peer has attached.
    pub fn peer_max_message_size(&self) -> AmqpResult<u64> {
        self.with_record(|record| record.peer_max_message_size)?
            .ok_or_else(|| AmqpError::invalid_state("peer has not attached"))
    }

    pub fn max_link_credit(&self) -> AmqpResult<u32> {
        self.with_record(|record| record.max_link_credit)
    }

    /// Delivery id of the most recent transfer received on this link.
    pub fn received_message_id(&self) -> AmqpResult<u32> {
        self.with_record(|record| record.received_message_id)
    }

    pub fn attach_properties(&self) -> AmqpResult<AmqpProperties> {
        self.with_record(|record| record.attach_properties.clone())
    }

    pub fn peer_properties(&self) -> AmqpResult<AmqpProperties> {
        self.with_record(|record| record.peer_properties.clone())
    }

    pub fn set_sender_settle_mode(&self, mode: SenderSettleMode) -> AmqpResult<()> {
        self.configure("sender settle mode", |record| record.snd_settle_mode = mode)
    }

    pub fn set_receiver_settle_mode(&self, mode: ReceiverSettleMode) -> AmqpResult<()> {
        self.configure("receiver settle mode", |record| record.rcv_settle_mode = mode)
    }

    pub fn set_initial_delivery_count(&self, count: u32) -> AmqpResult<()> {
        self.configure("initial delivery count", |record| {
            record.initial_delivery_count = count;
        })
    }

    pub fn set_max_message_size(&self, size: u64) -> AmqpResult<()> {
        self.configure("max message size", |record| record.max_message_size = size)
    }

    pub fn set_attach_properties(&self, properties: AmqpProperties) -> AmqpResult<()> {
        self.configure("attach properties", |record| {
            record.attach_properties = properties;
        })
    }

    /// Credit a receiver keeps topped up. Zero disables automatic credit.
    pub fn set_max_link_credit(&self, credit: u32) -> AmqpResult<()> {
        self.with_record_mut(|record| record.max_link_credit = credit)
    }

    /// Called with `(link, new_state, old_state)`.
    pub fn on_state_changed<F>(&self, callback: F) -> AmqpResult<()>
    where
        F: Fn(&Link, LinkState, LinkState) + Send + Sync + 'static,
    {
        self.with_record_mut(|record| record.events.on_state_changed = Some(Arc::new(callback)))
    }

    /// Called for each message received; the returned state is sent as the disposition.
    pub fn on_transfer<F>(&self, callback: F) -> AmqpResult<()>
    where
        F: Fn(&Link, &AmqpMessage) -> DeliveryState + Send + Sync + 'static,
    {
        self.with_record_mut(|record| record.events.on_transfer = Some(Arc::new(callback)))
    }

    pub fn on_detached<F>(&self, callback: F) -> AmqpResult<()>
    where
        F: Fn(&Link, Option<&AmqpErrorCondition>) + Send + Sync + 'static,
    {
        self.with_record_mut(|record| record.events.on_detached = Some(Arc::new(callback)))
    }

    pub fn on_flow<F>(&self, callback: F) -> AmqpResult<()>
    where
        F: Fn(&Link) + Send + Sync + 'static,
    {
        self.with_record_mut(|record| record.events.on_flow = Some(Arc::new(callback)))
    }

    pub fn on_delivery_settled<F>(&self, callback: F) -> AmqpResult<()>
    where
        F: Fn(&Link, u32, Option<&DeliveryState>) + Send + Sync + 'static,
    {
        self.with_record_mut(|record| {
            record.events.on_delivery_settled = Some(Arc::new(callback));
        })
    }
}

/// Link state held by the connection.
pub(crate) struct LinkRecord {
    pub(crate) session: Handle,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) source: String,
    pub(crate) target: String,
    pub(crate) state: LinkState,
    pub(crate) snd_settle_mode: SenderSettleMode,
    pub(crate) rcv_settle_mode: ReceiverSettleMode,
    pub(crate) initial_delivery_count: u32,
    pub(crate) max_message_size: u64,
    pub(crate) peer_max_message_size: Option<u64>,
    pub(crate) max_link_credit: u32,
    pub(crate) attach_properties: AmqpProperties,
    pub(crate) peer_properties: AmqpProperties,
    pub(crate) output_handle: Option<u32>,
    pub(crate) input_handle: Option<u32>,
    pub(crate) attach_requested: bool,
    pub(crate) attach_pending: bool,
    pub(crate) offered: bool,
    pub(crate) claimed: bool,
    pub(crate) rejecting: bool,
    pub(crate) delivery_count: u32,
    pub(crate) link_credit: u32,
    pub(crate) received_message_id: u32,
    pub(crate) outgoing: VecDeque<PendingTransfer>,
    pub(crate) unsettled: HashMap<u32, DeliveryOutcome>,
    pub(crate) incoming_unsettled: HashSet<u32>,
    pub(crate) events: LinkEvents,
    pub(crate) trace: bool,
    pub(crate) liveness: Liveness,
}

impl LinkRecord {
    fn new(session: Handle, name: &str, role: Role, source: &str, target: &str, trace: bool) -> Self {
        Self {
            session,
            name: name.to_string(),
            role,
            source: source.to_string(),
            target: target.to_string(),
            state: LinkState::Detached,
            snd_settle_mode: SenderSettleMode::default(),
            rcv_settle_mode: ReceiverSettleMode::default(),
            initial_delivery_count: 0,
            max_message_size: 0,
            peer_max_message_size: None,
            max_link_credit: 0,
            attach_properties: AmqpProperties::new(),
            peer_properties: AmqpProperties::new(),
            output_handle: None,
            input_handle: None,
            attach_requested: false,
            attach_pending: false,
            offered: false,
            claimed: false,
            rejecting: false,
            delivery_count: 0,
            link_credit: 0,
            received_message_id: 0,
            outgoing: VecDeque::new(),
            unsettled: HashMap::new(),
            incoming_unsettled: HashSet::new(),
            events: LinkEvents::default(),
            trace,
            liveness: Liveness::default(),
        }
    }

    /// True once the link is detached or failed and no [`Link`] or
    /// [`LinkEndpoint`] refers to it. An offered link keeps its input handle
    /// until it is answered, so it is never reclaimed before that.
    pub(crate) fn is_reclaimable(&self) -> bool {
        if self.liveness.is_held() {
            return false;
        }
        match self.state {
            LinkState::Error => true,
            LinkState::Detached => self.output_handle.is_none() && self.input_handle.is_none(),
            _ => false,
        }
    }

    fn attach_frame(&self, handle: u32) -> Attach {
        // A refusing endpoint answers with no terminus on its own side.
        let omit_source = self.rejecting && self.role == Role::Sender;
        let omit_target = self.rejecting && self.role == Role::Receiver;
        Attach {
            name: self.name.clone(),
            handle,
            role: self.role,
            snd_settle_mode: self.snd_settle_mode,
            rcv_settle_mode: self.rcv_settle_mode,
            source: (!omit_source).then(|| self.source.clone()),
            target: (!omit_target).then(|| self.target.clone()),
            initial_delivery_count: (self.role == Role::Sender)
                .then_some(self.initial_delivery_count),
            max_message_size: self.max_message_size,
            properties: self.attach_properties.clone(),
        }
    }

    fn take_pending(&mut self) -> Vec<DeliveryOutcome> {
        let mut pending: Vec<DeliveryOutcome> =
            self.outgoing.drain(..).map(|transfer| transfer.outcome).collect();
        pending.extend(self.unsettled.drain().map(|(_, outcome)| outcome));
        self.incoming_unsettled.clear();
        pending
    }
}

impl ConnectionCore {
    pub(crate) fn link(&self, link: Handle) -> AmqpResult<&LinkRecord> {
        self.links
            .get(link)
            .ok_or_else(|| AmqpError::invalid_state("link no longer exists"))
    }

    pub(crate) fn link_mut(&mut self, link: Handle) -> AmqpResult<&mut LinkRecord> {
        self.links
            .get_mut(link)
            .ok_or_else(|| AmqpError::invalid_state("link no longer exists"))
    }

    pub(crate) fn set_link_state(&mut self, link: Handle, new: LinkState) {
        let Some(record) = self.links.get_mut(link) else {
            return;
        };
        let old = record.state;
        if old == new {
            return;
        }
        record.state = new;
        log::debug!("{}: link '{}' {old} -> {new}", self.label, record.name);
        self.notify(Notification::LinkState { link, old, new });
    }

    fn create_link(&mut self, session: Handle, mut record: LinkRecord) -> AmqpResult<(Handle, HandleRef)> {
        self.session(session)?;
        let held = record.liveness.acquire();
        let link = self.links.insert(record);
        self.session_mut(session)?.links.push(link);
        Ok((link, held))
    }

    fn claim_link(&mut self, link: Handle) -> AmqpResult<()> {
        let record = self.link_mut(link)?;
        if !record.offered || record.claimed {
            return Err(AmqpError::invalid_state("link endpoint was already claimed"));
        }
        record.claimed = true;
        Ok(())
    }

    fn attach_link(&mut self, link: Handle) -> AmqpResult<()> {
        let record = self.link(link)?;
        if record.attach_requested {
            return Err(AmqpError::invalid_state("link attach was already requested"));
        }
        let session = record.session;
        let session_record = self.session(session)?;
        let (session_state, begun) = (session_record.state, session_record.begin_requested);
        match session_state {
            SessionState::Unmapped if !begun => self.begin_session(session)?,
            SessionState::Unmapped
            | SessionState::EndSent
            | SessionState::EndReceived
            | SessionState::Discarding
            | SessionState::Error => {
                return Err(AmqpError::invalid_state(format!(
                    "cannot attach a link on a session in state {session_state}"
                )));
            }
            SessionState::BeginSent | SessionState::BeginReceived | SessionState::Mapped => {}
        }

        let record = self.link_mut(link)?;
        record.attach_requested = true;
        record.attach_pending = true;
        self.set_link_state(link, LinkState::Attaching);
        if self.session(session)?.state == SessionState::Mapped {
            if let Err(e) = self.send_attach(link) {
                self.fail_link(link, &e);
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn send_attach(&mut self, link: Handle) -> AmqpResult<()> {
        let session = self.link(link)?.session;
        let (channel, handle) = {
            let record = self.session(session)?;
            let channel = record
                .local_channel
                .ok_or_else(|| AmqpError::invalid_state("session is not mapped"))?;
            let limit = record.handle_max;
            let handle = (0..=limit)
                .find(|handle| !record.output_handles.contains_key(handle))
                .ok_or(AmqpError::HandleMaxExceeded(limit))?;
            (channel, handle)
        };

        let record = self.link_mut(link)?;
        record.attach_pending = false;
        record.output_handle = Some(handle);
        if record.role == Role::Sender {
            record.delivery_count = record.initial_delivery_count;
        }
        let attach = record.attach_frame(handle);
        let (offered, rejecting) = (record.offered, record.rejecting);

        self.session_mut(session)?.output_handles.insert(handle, link);
        self.send_performative(channel, Performative::Attach(attach));
        if offered {
            if rejecting {
                self.set_link_state(link, LinkState::Attached);
            } else {
                self.link_established(link);
            }
        }
        Ok(())
    }

    fn link_established(&mut self, link: Handle) {
        self.set_link_state(link, LinkState::Attached);
        let Some(record) = self.links.get(link) else {
            return;
        };
        if record.role == Role::Receiver && record.max_link_credit > 0 {
            let credit = record.max_link_credit;
            if let Err(e) = self.issue_credit(link, credit) {
                log::warn!("{}: failed to grant initial credit: {e}", self.label);
            }
        }
        self.flush_link(link);
    }

    pub(crate) fn on_attach(&mut self, channel: u16, attach: Attach) -> AmqpResult<()> {
        let session = self.session_for_remote_channel(channel)?;
        let session_record = self.session(session)?;
        if session_record.input_handles.contains_key(&attach.handle) {
            return Err(AmqpError::Protocol(format!(
                "attach on handle {} which is already in use",
                attach.handle
            )));
        }
        let local_role = attach.role.opposite();
        let existing = session_record.links.iter().copied().find(|link| {
            self.links.get(*link).is_some_and(|record| {
                record.name == attach.name
                    && record.role == local_role
                    && !record.offered
                    && record.attach_requested
                    && record.input_handle.is_none()
            })
        });

        let Some(link) = existing else {
            let mut record = LinkRecord::new(
                session,
                &attach.name,
                local_role,
                attach.source.as_deref().unwrap_or_default(),
                attach.target.as_deref().unwrap_or_default(),
                self.trace,
            );
            record.offered = true;
            record.input_handle = Some(attach.handle);
            record.snd_settle_mode = attach.snd_settle_mode;
            record.rcv_settle_mode = attach.rcv_settle_mode;
            record.peer_max_message_size = Some(attach.max_message_size);
            record.peer_properties = attach.properties;
            if local_role == Role::Receiver {
                record.delivery_count = attach.initial_delivery_count.unwrap_or(0);
            }
            let link = self.links.insert(record);
            let session_record = self.session_mut(session)?;
            session_record.links.push(link);
            session_record.input_handles.insert(attach.handle, link);
            self.notify(Notification::LinkAttached(link));
            return Ok(());
        };

        self.session_mut(session)?
            .input_handles
            .insert(attach.handle, link);
        let record = self
            .links
            .get_mut(link)
            .ok_or_else(|| AmqpError::invalid_state("link no longer exists"))?;
        record.input_handle = Some(attach.handle);
        record.peer_max_message_size = Some(attach.max_message_size);
        record.peer_properties = attach.properties;
        if record.role == Role::Receiver {
            record.delivery_count = attach.initial_delivery_count.unwrap_or(0);
        }
        // The peer refuses by attaching without a terminus and then detaching.
        let refused = match record.role {
            Role::Sender => attach.target.is_none(),
            Role::Receiver => attach.source.is_none(),
        };
        let state = record.state;
        if refused {
            log::debug!("{}: peer refused link '{}'", self.label, record.name);
        } else if state == LinkState::Attaching {
            self.link_established(link);
        }
        Ok(())
    }

    pub(crate) fn detach_link(
        &mut self,
        link: Handle,
        closed: bool,
        error: Option<AmqpErrorCondition>,
    ) -> AmqpResult<()> {
        let record = self.link(link)?;
        let (state, output_handle, session) = (record.state, record.output_handle, record.session);
        match (state, output_handle) {
            (LinkState::Attached | LinkState::Attaching, Some(handle)) => {
                self.send_detach_frame(
                    session,
                    Detach {
                        handle,
                        closed,
                        error,
                    },
                );
                self.set_link_state(link, LinkState::Detaching);
                Ok(())
            }
            (LinkState::Attaching, None) => {
                self.complete_detach(link, None);
                Ok(())
            }
            (LinkState::Detaching, _) => Ok(()),
            (state, _) => Err(AmqpError::invalid_state(format!(
                "cannot detach a link in state {state}"
            ))),
        }
    }

    /// Refuses an offered link that no handler accepted.
    pub(crate) fn refuse_link(&mut self, link: Handle) {
        let error = AmqpErrorCondition::new(conditions::NOT_ALLOWED, "link refused");
        if let Err(e) = self.reject_link(link, true, Some(error)) {
            log::debug!("{}: could not refuse link: {e}", self.label);
        }
    }

    pub(crate) fn reject_link(
        &mut self,
        link: Handle,
        closed: bool,
        error: Option<AmqpErrorCondition>,
    ) -> AmqpResult<()> {
        let record = self.link_mut(link)?;
        if record.offered && !record.attach_requested {
            record.claimed = true;
            record.attach_requested = true;
            record.rejecting = true;
            self.send_attach(link)?;
        }
        self.detach_link(link, closed, error)
    }

    pub(crate) fn on_detach(&mut self, channel: u16, detach: Detach) -> AmqpResult<()> {
        let session = self.session_for_remote_channel(channel)?;
        let link = self
            .session(session)?
            .input_handles
            .get(&detach.handle)
            .copied()
            .ok_or_else(|| {
                AmqpError::Protocol(format!("detach for unattached handle {}", detach.handle))
            })?;
        let record = self.link(link)?;
        if let Some(error) = &detach.error {
            log::warn!("{}: peer detached link '{}': {error}", self.label, record.name);
        }
        if record.state != LinkState::Detaching {
            if let Some(handle) = record.output_handle {
                self.send_detach_frame(
                    session,
                    Detach {
                        handle,
                        closed: detach.closed,
                        error: None,
                    },
                );
            }
        }
        self.complete_detach(link, detach.error);
        Ok(())
    }

    /// Releases the link's handles, fails outstanding deliveries and moves it to `Detached`.
    pub(crate) fn complete_detach(&mut self, link: Handle, error: Option<AmqpErrorCondition>) {
        let Some(record) = self.links.get_mut(link) else {
            return;
        };
        if matches!(record.state, LinkState::Detached | LinkState::Error) {
            return;
        }
        let session = record.session;
        let output = record.output_handle.take();
        let input = record.input_handle.take();
        record.attach_pending = false;
        record.link_credit = 0;
        if !record.offered {
            // A locally created link may be attached again.
            record.attach_requested = false;
            record.peer_max_message_size = None;
        }
        let pending = record.take_pending();
        if let Some(session_record) = self.sessions.get_mut(session) {
            if let Some(output) = output {
                session_record.output_handles.remove(&output);
            }
            if let Some(input) = input {
                session_record.input_handles.remove(&input);
            }
        }
        let failure = AmqpError::LinkDetached(error.clone());
        for outcome in pending {
            outcome.complete_operation(Err(failure.clone()));
        }
        self.set_link_state(link, LinkState::Detached);
        self.notify(Notification::Detached { link, error });
    }

    pub(crate) fn fail_link(&mut self, link: Handle, error: &AmqpError) {
        let Some(record) = self.links.get_mut(link) else {
            return;
        };
        record.attach_pending = false;
        for outcome in record.take_pending() {
            outcome.complete_operation(Err(error.clone()));
        }
        self.set_link_state(link, LinkState::Error);
    }

    pub(crate) fn issue_credit(&mut self, link: Handle, credit: u32) -> AmqpResult<()> {
        let record = self.link_mut(link)?;
        if record.role != Role::Receiver {
            return Err(AmqpError::invalid_state("only receiver links grant credit"));
        }
        if record.state != LinkState::Attached {
            return Err(AmqpError::invalid_state("link is not attached"));
        }
        let handle = record
            .output_handle
            .ok_or_else(|| AmqpError::invalid_state("link has no handle"))?;
        record.link_credit = credit;
        let (session, delivery_count) = (record.session, record.delivery_count);
        let session_record = self.session(session)?;
        let channel = session_record
            .local_channel
            .ok_or_else(|| AmqpError::invalid_state("session is not mapped"))?;
        let flow = Flow {
            handle: Some(handle),
            delivery_count: Some(delivery_count),
            link_credit: Some(credit),
            ..session_record.flow()
        };
        self.send_performative(channel, Performative::Flow(flow));
        Ok(())
    }

    pub(crate) fn on_link_flow(&mut self, link: Handle, flow: &Flow) {
        let Some(record) = self.links.get_mut(link) else {
            return;
        };
        if record.role == Role::Sender {
            let receiver_count = flow.delivery_count.unwrap_or(record.initial_delivery_count);
            let credit = flow.link_credit.unwrap_or(0);
            let available = i64::from(receiver_count) + i64::from(credit)
                - i64::from(record.delivery_count);
            record.link_credit = u32::try_from(available.max(0)).unwrap_or(u32::MAX);
        } else if let Some(delivery_count) = flow.delivery_count {
            record.delivery_count = delivery_count;
        }
        if record.trace {
            log::trace!(
                "{}: link '{}' credit now {}",
                self.label,
                record.name,
                record.link_credit
            );
        }
        self.notify(Notification::Flow(link));
    }

    fn transfer(&mut self, link: Handle, message: AmqpMessage) -> AmqpResult<DeliveryOutcome> {
        let record = self.link_mut(link)?;
        if record.role != Role::Sender {
            return Err(AmqpError::invalid_state("only sender links transfer messages"));
        }
        if !matches!(record.state, LinkState::Attached | LinkState::Attaching) {
            return Err(AmqpError::invalid_state(format!(
                "cannot transfer on a link in state {}",
                record.state
            )));
        }
        if let Some(max) = record.peer_max_message_size.filter(|max| *max > 0) {
            let size = message.encoded_size();
            if size > max {
                return Err(AmqpError::MessageTooLarge { size, max });
            }
        }
        let max = u64::from(self.max_frame_size());
        let size = transfer_frame_size(&message);
        if size > max {
            return Err(AmqpError::MessageTooLarge { size, max });
        }
        let record = self.link_mut(link)?;
        let outcome: DeliveryOutcome = Arc::new(AsyncOperationQueue::new());
        record.outgoing.push_back(PendingTransfer {
            message,
            outcome: outcome.clone(),
        });
        self.flush_link(link);
        Ok(outcome)
    }

    /// Sends queued transfers while link credit and the peer's session window allow.
    pub(crate) fn flush_link(&mut self, link: Handle) {
        loop {
            let Some(record) = self.links.get(link) else {
                return;
            };
            if record.state != LinkState::Attached
                || record.role != Role::Sender
                || record.link_credit == 0
                || record.outgoing.is_empty()
            {
                return;
            }
            let Some(handle) = record.output_handle else {
                return;
            };
            let session = record.session;

            let Some(session_record) = self.sessions.get_mut(session) else {
                return;
            };
            let Some(channel) = session_record.local_channel else {
                return;
            };
            if session_record.remote_incoming_window == 0 {
                return;
            }
            let delivery_id = session_record.next_outgoing_id;
            session_record.next_outgoing_id = delivery_id.wrapping_add(1);
            session_record.remote_incoming_window -= 1;

            let Some(record) = self.links.get_mut(link) else {
                return;
            };
            let Some(pending) = record.outgoing.pop_front() else {
                return;
            };
            record.link_credit -= 1;
            record.delivery_count = record.delivery_count.wrapping_add(1);
            let settled = record.snd_settle_mode == SenderSettleMode::Settled;
            if settled {
                pending
                    .outcome
                    .complete_operation(Ok(DeliveryState::Accepted));
            } else {
                record.unsettled.insert(delivery_id, pending.outcome);
            }

            self.send_frame(Frame::Amqp {
                channel,
                performative: Performative::Transfer(Transfer {
                    handle,
                    delivery_id,
                    delivery_tag: delivery_id.to_string(),
                    message_format: 0,
                    settled,
                }),
                payload: Some(pending.message),
            });
        }
    }

    pub(crate) fn on_transfer(
        &mut self,
        channel: u16,
        transfer: Transfer,
        payload: Option<AmqpMessage>,
    ) -> AmqpResult<()> {
        let session = self.session_for_remote_channel(channel)?;
        let link = self
            .session(session)?
            .input_handles
            .get(&transfer.handle)
            .copied()
            .ok_or_else(|| {
                AmqpError::Protocol(format!("transfer on unattached handle {}", transfer.handle))
            })?;
        self.record_incoming_transfer(session, transfer.delivery_id);

        let record = self
            .links
            .get_mut(link)
            .ok_or_else(|| AmqpError::invalid_state("link no longer exists"))?;
        if record.role != Role::Receiver {
            return Err(AmqpError::Protocol(format!(
                "transfer received on sender link '{}'",
                record.name
            )));
        }
        record.delivery_count = record.delivery_count.wrapping_add(1);
        record.link_credit = record.link_credit.saturating_sub(1);
        record.received_message_id = transfer.delivery_id;
        if !transfer.settled && record.rcv_settle_mode == ReceiverSettleMode::Second {
            record.incoming_unsettled.insert(transfer.delivery_id);
        }
        let credit = record.max_link_credit;
        let replenish = record.state == LinkState::Attached
            && credit > 0
            && record.link_credit <= credit / 2;
        if record.trace {
            log::trace!(
                "{}: link '{}' received delivery {}",
                self.label,
                record.name,
                transfer.delivery_id
            );
        }

        self.notify(Notification::Transfer {
            link,
            delivery_id: transfer.delivery_id,
            settled: transfer.settled,
            message: payload.unwrap_or_default(),
        });
        if replenish {
            self.issue_credit(link, credit)?;
        }
        Ok(())
    }

    /// Sends the receiver's disposition for an unsettled incoming delivery.
    pub(crate) fn settle_incoming(
        &mut self,
        link: Handle,
        delivery_id: u32,
        settled: bool,
        state: DeliveryState,
    ) -> AmqpResult<()> {
        if settled {
            return Ok(());
        }
        let record = self.link(link)?;
        if record.state != LinkState::Attached {
            return Ok(());
        }
        let settle = record.rcv_settle_mode == ReceiverSettleMode::First;
        let session = record.session;
        let channel = self
            .session(session)?
            .local_channel
            .ok_or_else(|| AmqpError::invalid_state("session is not mapped"))?;
        self.send_performative(
            channel,
            Performative::Disposition(Disposition {
                role: Role::Receiver,
                first: delivery_id,
                last: None,
                settled: settle,
                state: Some(state),
            }),
        );
        Ok(())
    }

    pub(crate) fn on_disposition(
        &mut self,
        channel: u16,
        disposition: Disposition,
    ) -> AmqpResult<()> {
        let session = self.session_for_remote_channel(channel)?;
        let links = self.session(session)?.links.clone();
        let local_role = disposition.role.opposite();
        let mut settled = Vec::new();

        for link in links {
            let Some(record) = self.links.get_mut(link) else {
                continue;
            };
            if record.role != local_role {
                continue;
            }
            match local_role {
                Role::Sender => {
                    let ids: Vec<u32> = record
                        .unsettled
                        .keys()
                        .copied()
                        .filter(|id| disposition.covers(*id))
                        .collect();
                    for id in ids {
                        if let Some(outcome) = record.unsettled.remove(&id) {
                            let state = disposition.state.clone().unwrap_or(DeliveryState::Accepted);
                            outcome.complete_operation(Ok(state));
                        }
                        settled.push((link, id));
                    }
                }
                Role::Receiver => {
                    if !disposition.settled {
                        continue;
                    }
                    let ids: Vec<u32> = record
                        .incoming_unsettled
                        .iter()
                        .copied()
                        .filter(|id| disposition.covers(*id))
                        .collect();
                    for id in ids {
                        record.incoming_unsettled.remove(&id);
                        settled.push((link, id));
                    }
                }
            }
        }

        if local_role == Role::Sender && !disposition.settled && !settled.is_empty() {
            if let Some(local_channel) = self.session(session)?.local_channel {
                self.send_performative(
                    local_channel,
                    Performative::Disposition(Disposition {
                        role: Role::Sender,
                        first: disposition.first,
                        last: disposition.last,
                        settled: true,
                        state: disposition.state.clone(),
                    }),
                );
            }
        }
        for (link, delivery_id) in settled {
            self.notify(Notification::DeliverySettled {
                link,
                delivery_id,
                state: disposition.state.clone(),
            });
        }
        Ok(())
    }
}

/// Encoded size of a transfer frame carrying `message`, taking the widest
/// channel, handle and delivery id.
fn transfer_frame_size(message: &AmqpMessage) -> u64 {
    const PAYLOAD_KEY: u64 = r#","payload":"#.len() as u64;
    let envelope = Frame::amqp(
        u16::MAX,
        Performative::Transfer(Transfer {
            handle: u32::MAX,
            delivery_id: u32::MAX,
            delivery_tag: u32::MAX.to_string(),
            message_format: 0,
            settled: false,
        }),
    );
    let envelope = serde_json::to_vec(&envelope).map_or(u64::MAX, |bytes| bytes.len() as u64);
    envelope
        .saturating_add(PAYLOAD_KEY)
        .saturating_add(message.encoded_size())
}
