use super::transport::Transport;
use crate::common::Pollable;
use crate::{AmqpError, AmqpResult};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type AcceptedFn = Arc<dyn Fn(Transport) + Send + Sync>;

/// Pause after a failed accept, such as when file descriptors run out.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct ListenerInner {
    port: u16,
    max_frame_size: u32,
    on_accepted: Mutex<Option<AcceptedFn>>,
    accepted_tx: mpsc::UnboundedSender<Transport>,
    accepted_rx: Mutex<mpsc::UnboundedReceiver<Transport>>,
    local_port: Mutex<Option<u16>>,
    cancel: CancellationToken,
}

/// TCP listener that hands accepted sockets to a callback.
///
/// Sockets are accepted on a background task but the callback runs on
/// whichever task polls the listener, either directly or as one of the
/// pollables of a wait.
#[derive(Clone)]
pub struct SocketListener {
    inner: Arc<ListenerInner>,
}

impl SocketListener {
    /// Creates a listener for `port`; port 0 picks a free port at start.
    pub fn new(port: u16) -> Self {
        Self::with_max_frame_size(port, u32::MAX)
    }

    pub fn with_max_frame_size(port: u16, max_frame_size: u32) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ListenerInner {
                port,
                max_frame_size,
                on_accepted: Mutex::new(None),
                accepted_tx,
                accepted_rx: Mutex::new(accepted_rx),
                local_port: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Registers the callback that receives each accepted transport.
    pub fn on_socket_accepted<F>(&self, callback: F)
    where
        F: Fn(Transport) + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .on_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Arc::new(callback));
    }

    /// Binds the socket and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::InvalidState`] if already started and
    /// [`AmqpError::Io`] if the port cannot be bound.
    pub async fn start(&self) -> AmqpResult<()> {
        if self.local_port().is_some() {
            return Err(AmqpError::invalid_state("listener already started"));
        }
        let listener = TcpListener::bind(("0.0.0.0", self.inner.port)).await?;
        let bound = listener.local_addr()?.port();
        *self
            .inner
            .local_port
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(bound);
        log::info!("Listening for AMQP connections on port {bound}");

        let tx = self.inner.accepted_tx.clone();
        let cancel = self.inner.cancel.clone();
        let max_frame_size = self.inner.max_frame_size;
        tokio::spawn(async move {
            let listener = &listener;
            accept_loop(
                move || listener.accept(),
                |stream: TcpStream, _| {
                    let _ = stream.set_nodelay(true);
                    tx.send(Transport::from_stream(stream, max_frame_size)).is_ok()
                },
                cancel,
            )
            .await;
            log::debug!("Listener on port {bound} stopped");
        });
        Ok(())
    }

    /// Port actually bound, once started.
    pub fn local_port(&self) -> Option<u16> {
        *self
            .inner
            .local_port
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stops accepting new sockets.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}

/// Hands accepted sockets to `deliver` until cancelled or `deliver` returns
/// false. Failed accepts are retried after [`ACCEPT_RETRY_DELAY`].
async fn accept_loop<S, A, Fut>(
    mut accept: A,
    mut deliver: impl FnMut(S, SocketAddr) -> bool,
    cancel: CancellationToken,
) where
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, SocketAddr)>>,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("Accepted socket from {peer}");
                    if !deliver(stream, peer) {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Accept failed, retrying in {ACCEPT_RETRY_DELAY:?}: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Pollable for SocketListener {
    fn poll(&self) -> AmqpResult<()> {
        loop {
            let accepted = {
                let mut rx = self
                    .inner
                    .accepted_rx
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                rx.try_recv().ok()
            };
            let Some(transport) = accepted else {
                return Ok(());
            };
            let callback = self
                .inner
                .on_accepted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            match callback {
                Some(callback) => callback(transport),
                None => log::warn!("Dropping accepted socket: no accept handler registered"),
            }
        }
    }
}
