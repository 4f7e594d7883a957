use super::state::ConnectionState;
use super::Connection;
use crate::common::Handle;
use crate::errors::AmqpError;
use crate::models::{AmqpErrorCondition, AmqpMessage, DeliveryState};
use crate::session::{Endpoint, SessionState};
use crate::link::LinkState;
use std::sync::Arc;

pub type ConnectionStateChangedFn =
    Arc<dyn Fn(&Connection, ConnectionState, ConnectionState) + Send + Sync>;
pub type IoErrorFn = Arc<dyn Fn(&Connection, &AmqpError) + Send + Sync>;
pub type NewEndpointFn = Arc<dyn Fn(&Connection, Endpoint) -> bool + Send + Sync>;

/// Callbacks registered on a [`Connection`].
///
/// Each event kind is registered separately. Callbacks run on the task that
/// polls the connection, never while connection state is locked, so they may
/// call back into the connection, its sessions and links.
#[derive(Clone, Default)]
pub struct ConnectionEvents {
    pub(crate) on_state_changed: Option<ConnectionStateChangedFn>,
    pub(crate) on_io_error: Option<IoErrorFn>,
    pub(crate) on_new_endpoint: Option<NewEndpointFn>,
}

impl ConnectionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `(connection, old_state, new_state)` on every transition.
    pub fn on_state_changed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection, ConnectionState, ConnectionState) + Send + Sync + 'static,
    {
        self.on_state_changed = Some(Arc::new(callback));
        self
    }

    /// Called once when the transport fails; the connection is unusable afterwards.
    pub fn on_io_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection, &AmqpError) + Send + Sync + 'static,
    {
        self.on_io_error = Some(Arc::new(callback));
        self
    }

    /// Called for each session the peer begins on a listening connection.
    ///
    /// The handler claims the endpoint with
    /// [`Session::from_endpoint`](crate::session::Session::from_endpoint) and
    /// calls `begin` before returning. Returning `false`, or dropping the
    /// endpoint unclaimed, ends the offered session with `amqp:not-allowed`.
    pub fn on_new_endpoint<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection, Endpoint) -> bool + Send + Sync + 'static,
    {
        self.on_new_endpoint = Some(Arc::new(callback));
        self
    }
}

/// Event recorded under the connection lock and dispatched after it is released.
#[derive(Debug)]
pub(crate) enum Notification {
    ConnectionState {
        old: ConnectionState,
        new: ConnectionState,
    },
    IoError(AmqpError),
    NewEndpoint(Handle),
    SessionState {
        session: Handle,
        old: SessionState,
        new: SessionState,
    },
    LinkAttached(Handle),
    LinkState {
        link: Handle,
        old: LinkState,
        new: LinkState,
    },
    Transfer {
        link: Handle,
        delivery_id: u32,
        settled: bool,
        message: AmqpMessage,
    },
    Detached {
        link: Handle,
        error: Option<AmqpErrorCondition>,
    },
    Flow(Handle),
    DeliverySettled {
        link: Handle,
        delivery_id: u32,
        state: Option<DeliveryState>,
    },
}
