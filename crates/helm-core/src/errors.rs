/// Failures surfaced by an [`AgentGateway`](crate::agent::AgentGateway) or
/// its run control handle.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to start agent: {0}")]
    Spawn(String),
    #[error("agent stream failed: {0}")]
    Stream(String),
    #[error("agent reported error: {0}")]
    Reported(String),
    #[error("malformed agent output: {0}")]
    Protocol(String),
    #[error("cancel failed: {0}")]
    Cancel(String),
    #[error("not supported by this agent: {0}")]
    Unsupported(&'static str),
}

impl AgentError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn",
            Self::Stream(_) => "stream",
            Self::Reported(_) => "reported",
            Self::Protocol(_) => "protocol",
            Self::Cancel(_) => "cancel",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

/// Failures from a [`Persistence`](crate::persistence::Persistence) backend.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl PersistenceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_kinds() {
        assert_eq!(AgentError::Spawn("x".into()).error_kind(), "spawn");
        assert_eq!(AgentError::Unsupported("respond").error_kind(), "unsupported");
    }

    #[test]
    fn display_includes_detail() {
        let e = AgentError::Reported("rate limited".into());
        assert_eq!(e.to_string(), "agent reported error: rate limited");
        assert!(PersistenceError::NotFound("session s".into()).is_not_found());
        assert!(!PersistenceError::Storage("disk".into()).is_not_found());
    }
}
