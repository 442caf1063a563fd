use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Channel not ready")]
    ChannelNotReady,
    #[error("Could not connect to signaling server: {0}")]
    Connect(String),
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("Unrecognized envelope type: {0}")]
    UnrecognizedType(String),
    #[error("Local media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("Negotiation rejected by server: {0}")]
    NegotiationRejected(String),
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Signaling channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
