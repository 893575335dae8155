//! Error types for FlowCron.

/// Errors raised across the FlowCron crates.
///
/// Halting business failures (a tool answering `success=false`) are not
/// errors; they travel as `ToolExecutionResult` values.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API key missing for provider: {0}")]
    ApiKeyMissing(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid trigger expression: {0}")]
    InvalidTrigger(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Retry limit exceeded: attempt {attempt} > max {max}")]
    RetryLimitExceeded { attempt: u32, max: u32 },

    #[error("Schedule is not active: {0}")]
    ScheduleInactive(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Configuration failures are surfaced at dispatch and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FlowError::Config(_)
                | FlowError::WorkflowNotFound(_)
                | FlowError::ModelNotFound(_)
                | FlowError::InvalidTrigger(_)
                | FlowError::ApiKeyMissing(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(FlowError::WorkflowNotFound("wf".into()).is_configuration());
        assert!(FlowError::InvalidTrigger("bad".into()).is_configuration());
        assert!(!FlowError::Http("reset".into()).is_configuration());
        assert!(!FlowError::Timeout(5).is_configuration());
    }

    #[test]
    fn test_retry_limit_message() {
        let e = FlowError::RetryLimitExceeded { attempt: 4, max: 3 };
        assert_eq!(e.to_string(), "Retry limit exceeded: attempt 4 > max 3");
    }
}
