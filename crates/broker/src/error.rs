use linewatch_core::error::PipelineError;

/// Failures reported by a broker connection or channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker channel is closed")]
    ChannelClosed,

    #[error("{kind} '{name}' is not declared")]
    NotFound { kind: &'static str, name: String },

    #[error("Publish rejected: {0}")]
    Publish(String),
}

impl BrokerError {
    /// Whether the cached channel must be discarded and re-established.
    pub fn invalidates_channel(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ChannelClosed)
    }
}

impl From<BrokerError> for PipelineError {
    fn from(err: BrokerError) -> Self {
        PipelineError::Transient(err.to_string())
    }
}
