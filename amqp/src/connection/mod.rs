//! AMQP connections.
//!
//! A [`Connection`] owns one transport. Socket reads and writes run on a
//! background task; protocol processing and event callbacks run whenever the
//! connection is polled, either explicitly through [`Connection::poll`] or as
//! a participant of an [`AsyncOperationQueue`](crate::common::AsyncOperationQueue)
//! wait.

pub(crate) mod engine;
pub mod events;
pub mod options;
pub mod state;

pub use events::{ConnectionEvents, ConnectionStateChangedFn, IoErrorFn, NewEndpointFn};
pub use options::{AMQP_PORT, AMQP_TLS_PORT, ConnectionOptions, MIN_MAX_FRAME_SIZE};
pub use state::ConnectionState;

use self::engine::ConnectionCore;
use self::events::Notification;
use self::options::parse_host;
use crate::common::{Handle, Pollable};
use crate::link::{Link, LinkEndpoint, LinkEvents};
use crate::models::{AmqpErrorCondition, AmqpProperties};
use crate::network::Transport;
use crate::network::io::{IoEvent, TransportSource};
use crate::session::{Endpoint, Session, SessionEvents, SessionOptions};
use crate::{AmqpError, AmqpResult};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Upper bound on transport events handled by one call to `poll`.
const MAX_EVENTS_PER_POLL: usize = 256;

pub(crate) struct ConnectionInner {
    core: Mutex<ConnectionCore>,
    poll_lock: Mutex<()>,
    inbound: Mutex<mpsc::UnboundedReceiver<IoEvent>>,
    io_cancel: CancellationToken,
}

impl ConnectionInner {
    pub(crate) fn core(&self) -> MutexGuard<'_, ConnectionCore> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_event(&self) -> Option<IoEvent> {
        self.inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .try_recv()
            .ok()
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.io_cancel.cancel();
    }
}

/// An AMQP connection.
///
/// Cloning yields another handle to the same connection. The transport is
/// torn down when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core();
        f.debug_struct("Connection")
            .field("container_id", &core.options.container_id)
            .field("host", &core.host)
            .field("port", &core.port)
            .field("state", &core.state)
            .finish()
    }
}

impl Connection {
    /// Creates a client connection to `host`, which may be a bare host name,
    /// `host:port` or an `amqp://` / `amqps://` URL.
    ///
    /// Nothing is sent until [`open`](Self::open) is called, or a session on
    /// this connection begins.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::Configuration`] if the options or the address are invalid.
    pub fn new(host: &str, options: ConnectionOptions, events: ConnectionEvents) -> AmqpResult<Self> {
        options.validate()?;
        let (host, port) = parse_host(host, options.port)?;
        let source = TransportSource::Dial {
            host: host.clone(),
            port,
        };
        Ok(Self::build(host, port, options, source, events))
    }

    /// Creates the server side of an accepted transport.
    ///
    /// Call [`listen`](Self::listen) to start processing the peer's frames.
    pub fn from_transport(
        transport: Transport,
        options: ConnectionOptions,
        events: ConnectionEvents,
    ) -> AmqpResult<Self> {
        options.validate()?;
        let (host, port) = transport
            .peer_addr()
            .map(|addr| (addr.ip().to_string(), addr.port()))
            .unwrap_or_default();
        Ok(Self::build(
            host,
            port,
            options,
            TransportSource::Accepted(transport),
            events,
        ))
    }

    fn build(
        host: String,
        port: u16,
        mut options: ConnectionOptions,
        source: TransportSource,
        events: ConnectionEvents,
    ) -> Self {
        if options.container_id.is_empty() {
            options.container_id = Uuid::new_v4().to_string();
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let io_cancel = CancellationToken::new();
        let core = ConnectionCore::new(
            host,
            port,
            options,
            source,
            events_tx,
            io_cancel.clone(),
            events,
        );
        Self {
            inner: Arc::new(ConnectionInner {
                core: Mutex::new(core),
                poll_lock: Mutex::new(()),
                inbound: Mutex::new(events_rx),
                io_cancel,
            }),
        }
    }

    /// Starts the transport and sends the protocol header and `open`.
    ///
    /// Returns once the frames are queued; the connection reaches
    /// [`ConnectionState::Opened`] when the peer's `open` is processed by a poll.
    pub fn open(&self) -> AmqpResult<()> {
        self.inner.core().open()
    }

    /// Starts processing an accepted transport, waiting for the peer to open.
    pub fn listen(&self) -> AmqpResult<()> {
        self.inner.core().listen()
    }

    /// Sends `close`. An empty `condition` closes cleanly; otherwise the
    /// connection discards further input until the peer's `close` arrives.
    pub fn close(&self, condition: &str, description: &str, info: AmqpProperties) -> AmqpResult<()> {
        let error = AmqpErrorCondition::from_parts(condition, description, info);
        self.inner.core().close(error)
    }

    /// Processes queued transport events and dispatches callbacks.
    ///
    /// Re-entrant calls, from a callback or a concurrent waiter, return
    /// immediately.
    pub fn poll(&self) -> AmqpResult<()> {
        let _guard = match self.inner.poll_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(()),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        self.dispatch_notifications();
        for _ in 0..MAX_EVENTS_PER_POLL {
            let Some(event) = self.inner.next_event() else {
                break;
            };
            self.inner.core().handle_io_event(event);
            self.dispatch_notifications();
        }
        // Dropped with the lock released; record callbacks may own handles.
        let reclaimed = self.inner.core().reclaim();
        drop(reclaimed);
        Ok(())
    }

    fn dispatch_notifications(&self) {
        loop {
            let pending = std::mem::take(&mut self.inner.core().notifications);
            if pending.is_empty() {
                return;
            }
            for notification in pending {
                self.dispatch(notification);
            }
        }
    }

    /// Looks up a link callback and pins the link record for the call.
    fn link_callback<T>(
        &self,
        link: Handle,
        select: impl FnOnce(&LinkEvents) -> Option<T>,
    ) -> Option<(Link, T)> {
        let mut core = self.inner.core();
        let record = core.links.get_mut(link)?;
        let callback = select(&record.events)?;
        let held = record.liveness.acquire();
        Some((Link::from_parts(Arc::downgrade(&self.inner), link, held), callback))
    }

    fn dispatch(&self, notification: Notification) {
        let weak = Arc::downgrade(&self.inner);
        match notification {
            Notification::ConnectionState { old, new } => {
                let callback = self.inner.core().events.on_state_changed.clone();
                if let Some(callback) = callback {
                    callback(self, old, new);
                }
            }
            Notification::IoError(error) => {
                let callback = self.inner.core().events.on_io_error.clone();
                if let Some(callback) = callback {
                    callback(self, &error);
                }
            }
            Notification::NewEndpoint(handle) => {
                let (callback, held) = {
                    let mut core = self.inner.core();
                    (core.events.on_new_endpoint.clone(), core.hold_session(handle))
                };
                let Ok(held) = held else {
                    return;
                };
                let accepted = match callback {
                    Some(callback) => callback(self, Endpoint::new(weak, handle, held)),
                    None => {
                        log::warn!("Refusing session offered by peer: no endpoint handler registered");
                        false
                    }
                };
                if !accepted {
                    self.inner.core().refuse_session(handle);
                }
            }
            Notification::SessionState { session, old, new } => {
                let pinned = {
                    let mut core = self.inner.core();
                    core.sessions.get_mut(session).and_then(|record| {
                        let callback = record.events.on_state_changed.clone()?;
                        Some((callback, record.liveness.acquire()))
                    })
                };
                if let Some((callback, held)) = pinned {
                    callback(&Session::from_parts(weak, session, held), new, old);
                }
            }
            Notification::LinkAttached(link) => {
                let (session, callback, endpoint) = {
                    let mut core = self.inner.core();
                    let Some(session) = core.links.get(link).map(|record| record.session) else {
                        return;
                    };
                    let Some(pinned) = core.sessions.get_mut(session).map(|record| {
                        (
                            record.events.on_link_attached.clone(),
                            record.liveness.acquire(),
                        )
                    }) else {
                        return;
                    };
                    let Some(record) = core.links.get_mut(link) else {
                        return;
                    };
                    let endpoint = LinkEndpoint::new(weak.clone(), link, record);
                    (Session::from_parts(weak, session, pinned.1), pinned.0, endpoint)
                };
                let accepted = match callback {
                    Some(callback) => callback(&session, endpoint),
                    None => {
                        log::warn!("Refusing link offered by peer: no link handler registered");
                        false
                    }
                };
                if !accepted {
                    self.inner.core().refuse_link(link);
                }
            }
            Notification::LinkState { link, old, new } => {
                if let Some((handle, callback)) =
                    self.link_callback(link, |events| events.on_state_changed.clone())
                {
                    callback(&handle, new, old);
                }
            }
            Notification::Transfer {
                link,
                delivery_id,
                settled,
                message,
            } => {
                let state = match self.link_callback(link, |events| events.on_transfer.clone()) {
                    Some((handle, callback)) => callback(&handle, &message),
                    None => crate::models::DeliveryState::Accepted,
                };
                if let Err(e) = self
                    .inner
                    .core()
                    .settle_incoming(link, delivery_id, settled, state)
                {
                    log::warn!("Failed to settle delivery {delivery_id}: {e}");
                }
            }
            Notification::Detached { link, error } => {
                if let Some((handle, callback)) =
                    self.link_callback(link, |events| events.on_detached.clone())
                {
                    callback(&handle, error.as_ref());
                }
            }
            Notification::Flow(link) => {
                if let Some((handle, callback)) =
                    self.link_callback(link, |events| events.on_flow.clone())
                {
                    callback(&handle);
                }
            }
            Notification::DeliverySettled {
                link,
                delivery_id,
                state,
            } => {
                if let Some((handle, callback)) =
                    self.link_callback(link, |events| events.on_delivery_settled.clone())
                {
                    callback(&handle, delivery_id, state.as_ref());
                }
            }
        }
    }

    /// Creates a session on this connection. See [`Session::new`].
    pub fn create_session(
        &self,
        options: SessionOptions,
        events: SessionEvents,
    ) -> AmqpResult<Session> {
        Session::new(self, options, events)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core().state
    }

    pub fn host(&self) -> String {
        self.inner.core().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.inner.core().port
    }

    pub fn container_id(&self) -> String {
        self.inner.core().options.container_id.clone()
    }

    pub fn max_frame_size(&self) -> u32 {
        self.inner.core().options.max_frame_size
    }

    /// Frame size limit in force: the smaller of ours and the peer's once the
    /// peer's `open` has been received.
    pub fn negotiated_max_frame_size(&self) -> u32 {
        self.inner.core().max_frame_size()
    }

    /// The peer's advertised max frame size.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidState`] until the peer's `open` has been received.
    pub fn remote_max_frame_size(&self) -> AmqpResult<u32> {
        self.inner
            .core()
            .remote_open
            .as_ref()
            .map(|open| open.max_frame_size)
            .ok_or_else(|| AmqpError::invalid_state("peer has not sent open"))
    }

    pub fn max_channel(&self) -> u16 {
        self.inner.core().options.max_channel_count
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.core().options.idle_timeout
    }

    pub fn properties(&self) -> AmqpProperties {
        self.inner.core().options.properties.clone()
    }

    /// Properties the peer sent in its `open`; empty until then.
    pub fn remote_properties(&self) -> AmqpProperties {
        self.inner
            .core()
            .remote_open
            .as_ref()
            .map(|open| open.properties.clone())
            .unwrap_or_default()
    }

    /// Fraction of the peer's idle timeout after which an empty frame is sent.
    pub fn set_idle_empty_frame_send_percentage(&self, ratio: f64) -> AmqpResult<()> {
        self.inner.core().set_idle_empty_frame_send_percentage(ratio)
    }

    /// Number of session records the connection still tracks.
    ///
    /// Sessions are forgotten once they have ended, their links are gone and
    /// no [`Session`] handle refers to them.
    pub fn session_count(&self) -> usize {
        self.inner.core().sessions.len()
    }

    /// Number of link records the connection still tracks.
    pub fn link_count(&self) -> usize {
        self.inner.core().links.len()
    }

    pub fn is_trace_enabled(&self) -> bool {
        self.inner.core().trace
    }

    /// Returns true if both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Pollable for Connection {
    fn poll(&self) -> AmqpResult<()> {
        Connection::poll(self)
    }
}
