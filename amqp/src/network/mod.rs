pub mod codec;
pub(crate) mod io;
pub mod sasl;
pub mod socket_listener;
pub mod transport;

pub use codec::FrameCodec;
pub use sasl::{SaslMechanism, SaslValidator};
pub use socket_listener::SocketListener;
pub use transport::Transport;
