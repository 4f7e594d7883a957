use std::fmt;

/// AMQP 1.0 connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Start,
    HeaderReceived,
    HeaderSent,
    HeaderExchanged,
    OpenPipe,
    OcPipe,
    OpenReceived,
    OpenSent,
    ClosePipe,
    Opened,
    CloseReceived,
    CloseSent,
    Discarding,
    End,
    Error,
}

impl ConnectionState {
    /// `End` and `Error` admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::End | ConnectionState::Error)
    }

    /// States in which a local `close` has already been sent.
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConnectionState::OcPipe
                | ConnectionState::ClosePipe
                | ConnectionState::CloseSent
                | ConnectionState::Discarding
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Start => "Start",
            ConnectionState::HeaderReceived => "HeaderReceived",
            ConnectionState::HeaderSent => "HeaderSent",
            ConnectionState::HeaderExchanged => "HeaderExchanged",
            ConnectionState::OpenPipe => "OpenPipe",
            ConnectionState::OcPipe => "OcPipe",
            ConnectionState::OpenReceived => "OpenReceived",
            ConnectionState::OpenSent => "OpenSent",
            ConnectionState::ClosePipe => "ClosePipe",
            ConnectionState::Opened => "Opened",
            ConnectionState::CloseReceived => "CloseReceived",
            ConnectionState::CloseSent => "CloseSent",
            ConnectionState::Discarding => "Discarding",
            ConnectionState::End => "End",
            ConnectionState::Error => "Error",
        };
        f.write_str(name)
    }
}
