use thiserror::Error;

/// Errors a Bus Agent operation can report to its caller (the bridge, C7).
///
/// Variant names track the wire error taxonomy of SPEC_FULL.md §7.1 so the
/// bridge can map them onto `ERROR` frames without a second enum.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("handle id is not known to this owner")]
    InvalidHandle,
    #[error("owner has no such connection")]
    NotConnected,
    #[error("bus error: {0}")]
    BusError(String),
    #[error("operation timed out")]
    Timeout,
    #[error("operation was cancelled")]
    Cancelled,
}

impl AgentError {
    /// Wire error code from the `INVALID_DATA=1 .. CANCELLED=6` taxonomy.
    pub fn wire_code(&self) -> u8 {
        match self {
            AgentError::InvalidHandle => 2,
            AgentError::NotConnected => 3,
            AgentError::BusError(_) => 4,
            AgentError::Timeout => 5,
            AgentError::Cancelled => 6,
        }
    }
}

impl From<zbus::Error> for AgentError {
    fn from(err: zbus::Error) -> Self {
        AgentError::BusError(err.to_string())
    }
}
