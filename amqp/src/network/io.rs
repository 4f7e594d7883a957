use super::sasl::{self, SaslMechanism, SaslValidator};
use super::transport::Transport;
use crate::models::Frame;
use crate::{AmqpError, AmqpResult};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Events the I/O task hands to the owning connection.
#[derive(Debug)]
pub(crate) enum IoEvent {
    Frame(Frame),
    Failed(AmqpError),
}

/// Commands the owning connection hands to the I/O task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    /// Start sending empty frames at this period.
    Heartbeat(Duration),
    /// Frame size limit agreed with the peer.
    FrameLimit(u32),
    /// Flush what is queued and close the socket.
    Shutdown,
}

pub(crate) enum TransportSource {
    Dial { host: String, port: u16 },
    Accepted(Transport),
}

pub(crate) struct IoConfig {
    pub max_frame_size: u32,
    pub idle_timeout: Duration,
    pub sasl: Option<SaslMechanism>,
    pub sasl_validator: Option<SaslValidator>,
    pub trace: bool,
    pub label: String,
}

/// Spawns the socket task on the current tokio runtime.
///
/// Returns the sender used to queue outbound frames. Frames queued before the
/// socket is ready are written once the dial and SASL exchange complete.
pub(crate) fn spawn_io(
    source: TransportSource,
    config: IoConfig,
    events: mpsc::UnboundedSender<IoEvent>,
    cancel: CancellationToken,
) -> AmqpResult<mpsc::UnboundedSender<Outbound>> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
        AmqpError::invalid_state(format!("Connection I/O requires a tokio runtime: {e}"))
    })?;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    runtime.spawn(run_io(source, config, events, outbound_rx, cancel));
    Ok(outbound_tx)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn establish(source: TransportSource, config: &IoConfig) -> AmqpResult<(Transport, Option<Frame>)> {
    match source {
        TransportSource::Dial { host, port } => {
            let mut transport = Transport::connect(&host, port, config.max_frame_size).await?;
            if let Some(mechanism) = &config.sasl {
                sasl::negotiate_client(&mut transport, mechanism).await?;
            }
            Ok((transport, None))
        }
        TransportSource::Accepted(mut transport) => {
            let first = sasl::accept_server(&mut transport, config.sasl_validator.as_ref()).await?;
            Ok((transport, first))
        }
    }
}

async fn run_io(
    source: TransportSource,
    config: IoConfig,
    events: mpsc::UnboundedSender<IoEvent>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    let established = tokio::select! {
        _ = cancel.cancelled() => return,
        result = establish(source, &config) => result,
    };
    let (transport, first) = match established {
        Ok(established) => established,
        Err(e) => {
            log::warn!("{}: transport setup failed: {e}", config.label);
            let _ = events.send(IoEvent::Failed(e));
            return;
        }
    };
    if let Some(frame) = first {
        let _ = events.send(IoEvent::Frame(frame));
    }

    let mut framed = transport.into_framed();
    let mut heartbeat: Option<Duration> = None;
    let mut last_read = Instant::now();
    let mut last_write = Instant::now();

    loop {
        let heartbeat_at = heartbeat.map(|period| last_write + period);
        let idle_at = (!config.idle_timeout.is_zero()).then(|| last_read + config.idle_timeout);

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = framed.close().await;
                break;
            }
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if config.trace {
                        log::trace!("{}: -> {}", config.label, frame.describe());
                    }
                    if let Err(e) = framed.send(frame).await {
                        let _ = events.send(IoEvent::Failed(e));
                        break;
                    }
                    last_write = Instant::now();
                }
                Some(Outbound::FrameLimit(max_frame_size)) => {
                    log::debug!("{}: max frame size now {max_frame_size}", config.label);
                    framed.codec_mut().set_max_frame_size(max_frame_size);
                }
                Some(Outbound::Heartbeat(period)) => {
                    log::debug!("{}: sending heartbeats every {period:?}", config.label);
                    heartbeat = (!period.is_zero()).then_some(period);
                }
                Some(Outbound::Shutdown) | None => {
                    let _ = framed.close().await;
                    break;
                }
            },
            frame = framed.next() => match frame {
                Some(Ok(Frame::Empty)) => {
                    last_read = Instant::now();
                }
                Some(Ok(frame)) => {
                    last_read = Instant::now();
                    if config.trace {
                        log::trace!("{}: <- {}", config.label, frame.describe());
                    }
                    if events.send(IoEvent::Frame(frame)).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = events.send(IoEvent::Failed(e));
                    break;
                }
                None => {
                    let _ = events.send(IoEvent::Failed(AmqpError::ConnectionClosed(
                        "peer closed the socket".to_string(),
                    )));
                    break;
                }
            },
            _ = sleep_until_opt(heartbeat_at) => {
                if let Err(e) = framed.send(Frame::Empty).await {
                    let _ = events.send(IoEvent::Failed(e));
                    break;
                }
                last_write = Instant::now();
            }
            _ = sleep_until_opt(idle_at) => {
                let _ = events.send(IoEvent::Failed(AmqpError::OperationTimeout(format!(
                    "no frame received within the idle timeout of {:?}",
                    config.idle_timeout
                ))));
                break;
            }
        }
    }
    log::debug!("{}: I/O task finished", config.label);
}
