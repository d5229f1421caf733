use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: String, reason: String },

    #[error("invalid sample on {channel}: {reason}")]
    InvalidSample { channel: String, reason: String },

    #[error("unknown channel {0}")]
    UnknownChannel(String),

    #[error("invalid cycle table: {0}")]
    InvalidCycleTable(String),

    #[error("failed to persist {kind} snapshot: {reason}")]
    PersistenceFailure { kind: String, reason: String },

    #[error("engine stopped")]
    EngineStopped,
}

impl EngineError {
    pub fn invalid_sample(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSample {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn source_unavailable(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
