use crate::common::{AsyncOperationQueue, Context, Pollable};
use crate::connection::Connection;
use crate::link::{Link, LinkState};
use crate::models::{AmqpErrorCondition, AmqpProperties};
use crate::{AmqpError, AmqpResult};
use std::fmt;
use std::sync::{Arc, Mutex};

/// States shared by senders and receivers, driven by their link.
pub(crate) trait EndpointState:
    Copy + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const IDLE: Self;
    const OPENING: Self;
    const OPEN: Self;
    const CLOSING: Self;
    const ERROR: Self;
}

pub(crate) type StateChangedFn<S> = Arc<dyn Fn(S, S) + Send + Sync>;
pub type DetachedFn = Arc<dyn Fn(Option<&AmqpErrorCondition>) + Send + Sync>;
pub(crate) type FailureHook = Arc<dyn Fn(AmqpError) + Send + Sync>;

/// Maps link events onto a sender or receiver state and completes the
/// queues that `open` and `close` wait on.
pub(crate) struct Lifecycle<S> {
    label: String,
    state: Mutex<S>,
    on_state_changed: Option<StateChangedFn<S>>,
    on_detached: Option<DetachedFn>,
    on_failure: Option<FailureHook>,
    opened: AsyncOperationQueue<AmqpResult<()>>,
    closed: AsyncOperationQueue<AmqpResult<()>>,
}

impl<S: EndpointState> Lifecycle<S> {
    pub(crate) fn new(
        label: String,
        on_state_changed: Option<StateChangedFn<S>>,
        on_detached: Option<DetachedFn>,
        on_failure: Option<FailureHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            label,
            state: Mutex::new(S::IDLE),
            on_state_changed,
            on_detached,
            on_failure,
            opened: AsyncOperationQueue::new(),
            closed: AsyncOperationQueue::new(),
        })
    }

    pub(crate) fn state(&self) -> S {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sets the state, returning the previous one.
    pub(crate) fn transition(&self, new: S) -> S {
        let old = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *state, new)
        };
        if old != new {
            log::debug!("{}: {old:?} -> {new:?}", self.label);
            if let Some(callback) = &self.on_state_changed {
                callback(new, old);
            }
        }
        old
    }

    /// Registers the link callbacks that drive this lifecycle.
    pub(crate) fn bind(self: &Arc<Self>, link: &Link) -> AmqpResult<()> {
        let weak = Arc::downgrade(self);
        link.on_state_changed(move |_, new, _| {
            if let Some(lifecycle) = weak.upgrade() {
                lifecycle.on_link_state(new);
            }
        })?;
        let weak = Arc::downgrade(self);
        link.on_detached(move |_, error| {
            if let Some(lifecycle) = weak.upgrade() {
                lifecycle.on_link_detached(error);
            }
        })
    }

    fn on_link_state(&self, new: LinkState) {
        match new {
            LinkState::Attached if self.state() == S::OPENING => {
                self.transition(S::OPEN);
                self.opened.complete_operation(Ok(()));
            }
            LinkState::Error => {
                let error = AmqpError::ConnectionClosed(format!(
                    "{}: link failed with its connection",
                    self.label
                ));
                let old = self.transition(S::ERROR);
                if old == S::OPENING {
                    self.opened.complete_operation(Err(error));
                } else if old == S::CLOSING {
                    self.closed.complete_operation(Err(error));
                } else if old == S::OPEN {
                    self.fail(error);
                }
            }
            _ => {}
        }
    }

    fn on_link_detached(&self, error: Option<&AmqpErrorCondition>) {
        if let Some(callback) = &self.on_detached {
            callback(error);
        }
        let old = self.state();
        if old == S::OPENING {
            self.transition(S::ERROR);
            let reason = error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "peer detached the link".to_string());
            self.opened
                .complete_operation(Err(AmqpError::AttachFailed(reason)));
        } else if old == S::CLOSING {
            self.transition(S::IDLE);
            self.closed.complete_operation(Ok(()));
        } else if old == S::OPEN {
            self.transition(if error.is_some() { S::ERROR } else { S::IDLE });
            self.fail(AmqpError::LinkDetached(error.cloned()));
        }
    }

    fn fail(&self, error: AmqpError) {
        if let Some(hook) = &self.on_failure {
            hook(error);
        }
    }

    /// Attaches `link` and waits, pumping `connection`, until the peer answers.
    pub(crate) async fn open(
        &self,
        link: &Link,
        connection: &Connection,
        ctx: &Context,
    ) -> AmqpResult<()> {
        let state = self.state();
        if state != S::IDLE {
            return Err(AmqpError::invalid_state(format!(
                "{}: cannot open from state {state:?}",
                self.label
            )));
        }
        self.opened.clear();
        self.transition(S::OPENING);
        if let Err(e) = link.attach() {
            self.transition(S::ERROR);
            return Err(e);
        }
        match self.opened.wait_for_polled_result(ctx, &[connection as &dyn Pollable]).await {
            Some(result) => result,
            None => {
                self.withdraw(link);
                Err(ctx.cancellation_error("open"))
            }
        }
    }

    /// Abandons an attach the caller stopped waiting for.
    ///
    /// The link is detached so the endpoint settles back to `IDLE` and can be
    /// opened again; an answer that already arrived is detached the same way.
    fn withdraw(&self, link: &Link) {
        let state = self.state();
        if state != S::OPENING && state != S::OPEN {
            return;
        }
        self.closed.clear();
        self.transition(S::CLOSING);
        if let Err(e) = link.detach(true, "", "", AmqpProperties::new()) {
            log::debug!("{}: detach after abandoned open failed: {e}", self.label);
            self.transition(S::IDLE);
        }
    }

    /// Detaches `link` and waits for the peer's detach.
    pub(crate) async fn close(
        &self,
        link: &Link,
        connection: &Connection,
        ctx: &Context,
    ) -> AmqpResult<()> {
        let state = self.state();
        if state == S::IDLE || state == S::ERROR {
            return Ok(());
        }
        if state != S::CLOSING {
            self.closed.clear();
            self.transition(S::CLOSING);
            if let Err(e) = link.detach(true, "", "", AmqpProperties::new()) {
                self.transition(S::ERROR);
                return Err(e);
            }
        }
        match self.closed.wait_for_polled_result(ctx, &[connection as &dyn Pollable]).await {
            Some(result) => result,
            None => Err(ctx.cancellation_error("close")),
        }
    }

    /// Sends a detach without waiting; used when the owner is dropped.
    pub(crate) fn abandon(&self, link: &Link) {
        let state = self.state();
        if state != S::OPEN && state != S::OPENING {
            return;
        }
        self.transition(S::CLOSING);
        if let Err(e) = link.detach(true, "", "", AmqpProperties::new()) {
            log::debug!("{}: detach on drop failed: {e}", self.label);
        }
    }
}
