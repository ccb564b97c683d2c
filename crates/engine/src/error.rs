use waymark_storage::StorageError;

/// Why a command was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum DecideError {
    #[error("unknown command '{command_type}' for entity type '{entity_type}'")]
    UnknownCommand {
        entity_type: String,
        command_type: String,
    },

    #[error("'{command_type}' is not allowed for '{entity_id}': {reason}")]
    InvalidTransition {
        entity_id: String,
        command_type: String,
        reason: String,
    },

    #[error("'{requester}' lacks capability '{capability}'")]
    Unauthorized {
        requester: String,
        capability: String,
    },

    #[error("invalid '{command_type}' command: {reason}")]
    InvalidCommand {
        command_type: String,
        reason: String,
    },

    #[error("entity '{entity_id}' is busy")]
    Busy { entity_id: String },

    #[error("entity '{entity_id}' was modified concurrently")]
    Conflict { entity_id: String },

    #[error("projection invariant violated for '{entity_id}': {detail}")]
    ProjectionInvariantViolation { entity_id: String, detail: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DecideError {
    /// Stable machine-readable name of the rejection kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DecideError::UnknownCommand { .. } => "unknown_command",
            DecideError::InvalidTransition { .. } => "invalid_transition",
            DecideError::Unauthorized { .. } => "unauthorized",
            DecideError::InvalidCommand { .. } => "invalid_command",
            DecideError::Busy { .. } => "busy",
            DecideError::Conflict { .. } => "conflict",
            DecideError::ProjectionInvariantViolation { .. } => "projection_invariant_violation",
            DecideError::Storage(_) => "storage",
        }
    }

    /// Whether the caller may resubmit the same command.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DecideError::Busy { .. } | DecideError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_busy_and_conflict_are_retryable() {
        let busy = DecideError::Busy {
            entity_id: "f1".to_string(),
        };
        let denied = DecideError::Unauthorized {
            requester: "bob".to_string(),
            capability: "file:delete".to_string(),
        };
        assert!(busy.is_retryable());
        assert!(!denied.is_retryable());
        assert_eq!(denied.kind(), "unauthorized");
        assert_eq!(denied.to_string(), "'bob' lacks capability 'file:delete'");
    }

    #[test]
    fn storage_errors_convert() {
        let err: DecideError = StorageError::Backend("disk full".to_string()).into();
        assert_eq!(err.kind(), "storage");
        assert!(err.to_string().contains("disk full"));
    }
}
