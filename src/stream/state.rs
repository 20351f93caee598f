use serde::Serialize;

/// Per-camera connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Backoff,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Enable,
    ConnectOk,
    ConnectFailed,
    ReadError,
    Stall,
    EndOfStream,
    BackoffElapsed,
    Disable,
}

impl ConnectionEvent {
    pub fn reason(self) -> &'static str {
        match self {
            ConnectionEvent::Enable => "enabled",
            ConnectionEvent::ConnectOk => "connected",
            ConnectionEvent::ConnectFailed => "connect failed",
            ConnectionEvent::ReadError => "read error",
            ConnectionEvent::Stall => "stalled",
            ConnectionEvent::EndOfStream => "end of stream",
            ConnectionEvent::BackoffElapsed => "backoff elapsed",
            ConnectionEvent::Disable => "disabled",
        }
    }
}

impl ConnectionState {
    /// The state `event` leads to, or `None` if the event does not apply here.
    pub fn on(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match self {
            S::Disconnected => match event {
                E::Enable => Some(S::Connecting),
                E::Disable => Some(S::Disconnected),
                E::ConnectOk
                | E::ConnectFailed
                | E::ReadError
                | E::Stall
                | E::EndOfStream
                | E::BackoffElapsed => None,
            },
            S::Connecting => match event {
                E::ConnectOk => Some(S::Streaming),
                E::ConnectFailed => Some(S::Backoff),
                E::Disable => Some(S::Disconnected),
                E::Enable | E::ReadError | E::Stall | E::EndOfStream | E::BackoffElapsed => None,
            },
            S::Streaming => match event {
                E::ReadError | E::Stall | E::EndOfStream => Some(S::Backoff),
                E::Disable => Some(S::Disconnected),
                E::Enable | E::ConnectOk | E::ConnectFailed | E::BackoffElapsed => None,
            },
            S::Backoff => match event {
                E::BackoffElapsed => Some(S::Connecting),
                E::Disable => Some(S::Disconnected),
                E::Enable
                | E::ConnectOk
                | E::ConnectFailed
                | E::ReadError
                | E::Stall
                | E::EndOfStream => None,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Backoff => "backoff",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    #[test]
    fn happy_path_and_reconnect() {
        let mut state = S::Disconnected;
        for (event, expected) in [
            (E::Enable, S::Connecting),
            (E::ConnectOk, S::Streaming),
            (E::Stall, S::Backoff),
            (E::BackoffElapsed, S::Connecting),
            (E::ConnectFailed, S::Backoff),
            (E::BackoffElapsed, S::Connecting),
            (E::ConnectOk, S::Streaming),
            (E::EndOfStream, S::Backoff),
        ] {
            state = state.on(event).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn disable_always_disconnects() {
        for state in [S::Disconnected, S::Connecting, S::Streaming, S::Backoff] {
            assert_eq!(state.on(E::Disable), Some(S::Disconnected));
        }
    }

    #[test]
    fn streaming_cannot_skip_backoff() {
        assert_eq!(S::Streaming.on(E::BackoffElapsed), None);
        assert_eq!(S::Backoff.on(E::ConnectOk), None);
        assert_eq!(S::Disconnected.on(E::ConnectOk), None);
    }
}
