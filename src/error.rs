use thiserror::Error;

/// Unified error type for the datapath crate.
///
/// Most of the drop paths described in the component contracts (malformed
/// packet, unknown source, out-of-subnet destination) are represented as
/// `Ok(None)` rather than an `Err` variant here — they are expected outcomes
/// of the hot path, not failures. `NetError` covers everything that is
/// actually exceptional: I/O, configuration, and control-plane timeouts.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("control channel error: {0}")]
    ControlChannel(String),

    #[error("resolver timed out waiting for table entries")]
    ResolverTimeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("service exposure error: {0}")]
    Exposure(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;
