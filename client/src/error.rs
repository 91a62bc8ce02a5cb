use thiserror::Error;

/// Failures of the realtime channel. Only budget exhaustion is fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Gave up after {attempts} consecutive connection failures")]
    ReconnectExhausted { attempts: u32 },

    #[error("Channel was closed")]
    Closed,
}

/// Failure of a whole `load` call. Per-attempt failures are absorbed by the
/// fallback chain and never show up here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaLoadError {
    #[error("Another load is already in flight for this session")]
    InFlight,

    #[error("Proxy is disabled on the server")]
    ProxyDisabled,

    #[error("Video could not be loaded after {attempts} attempt(s): {reason}")]
    Exhausted { attempts: u8, reason: String },
}

/// An inbound frame that could not be turned into a message
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Message has no type tag")]
    MissingType,

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}
