use super::codec::FrameCodec;
use crate::models::Frame;
use crate::{AmqpError, AmqpResult};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// A framed byte stream carrying [`Frame`] values.
#[derive(Debug)]
pub struct Transport {
    framed: Framed<TcpStream, FrameCodec>,
    peer: Option<SocketAddr>,
}

impl Transport {
    /// Dials `host:port` and wraps the socket.
    ///
    /// # Errors
    ///
    /// Returns [`AmqpError::ConnectionFailed`] when the socket cannot be opened.
    pub async fn connect(host: &str, port: u16, max_frame_size: u32) -> AmqpResult<Self> {
        log::debug!("Dialing {host}:{port}");
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            AmqpError::ConnectionFailed(format!("Failed to connect to {host}:{port}: {e}"))
        })?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, max_frame_size))
    }

    /// Wraps an already connected socket, e.g. one produced by a listener.
    pub fn from_stream(stream: TcpStream, max_frame_size: u32) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            framed: Framed::new(stream, FrameCodec::new(max_frame_size)),
            peer,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send(&mut self, frame: Frame) -> AmqpResult<()> {
        self.framed.send(frame).await
    }

    /// Reads the next frame; `None` means the peer closed the socket.
    pub async fn next_frame(&mut self) -> Option<AmqpResult<Frame>> {
        self.framed.next().await
    }

    pub(crate) fn into_framed(self) -> Framed<TcpStream, FrameCodec> {
        self.framed
    }
}
