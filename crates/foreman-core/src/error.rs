use thiserror::Error;

/// Result alias used across the Foreman crates.
pub type ForemanResult<T> = Result<T, ForemanError>;

/// Error taxonomy shared by the coordinator and its building blocks.
#[derive(Error, Debug)]
pub enum ForemanError {
    /// A collaborator call failed in a way that may succeed on retry.
    #[error("Transient service error: {0}")]
    TransientService(String),

    /// A collaborator call failed permanently.
    #[error("Service error: {0}")]
    Service(String),

    /// A rate-limit wait ran past its deadline.
    #[error("Rate limit timeout on '{key}' after {waited_ms}ms")]
    RateLimitTimeout { key: String, waited_ms: u64 },

    /// Not enough capacity left for the requested window.
    #[error("Insufficient {resource_type}: requested {requested}, available {available}")]
    InsufficientResource {
        resource_type: String,
        requested: u64,
        available: u64,
    },

    /// The ledger has no pool for this resource type.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// An upstream task failed, so this one cannot run.
    #[error("Dependency failed: {0}")]
    DependencyFailed(String),

    /// Every retry attempt failed; wraps the last cause.
    #[error("Retry exhausted after {attempts} attempts: {last_cause}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_cause: Box<ForemanError>,
    },

    /// A status change outside the transition table.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    /// The task was no longer in the expected status (lost a concurrent update).
    #[error("Stale status for task {task_id}: expected {expected}, found {actual}")]
    StaleStatus {
        task_id: String,
        expected: String,
        actual: String,
    },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForemanError {
    /// Default retry predicate: transient service failures and limiter timeouts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ForemanError::TransientService(_) | ForemanError::RateLimitTimeout { .. }
        )
    }

    /// The innermost cause, looking through `RetryExhausted` wrappers.
    pub fn root_cause(&self) -> &ForemanError {
        match self {
            ForemanError::RetryExhausted { last_cause, .. } => last_cause.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn transient_classification() {
        assert!(ForemanError::TransientService("503".into()).is_transient());
        assert!(ForemanError::RateLimitTimeout {
            key: "search".into(),
            waited_ms: 100
        }
        .is_transient());
        assert!(!ForemanError::Service("bad prompt".into()).is_transient());
        assert!(!ForemanError::Cancelled("workflow".into()).is_transient());
    }

    #[test]
    fn retry_exhausted_exposes_source() {
        let err = ForemanError::RetryExhausted {
            attempts: 3,
            last_cause: Box::new(ForemanError::TransientService("timeout".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("timeout"));
        assert!(err.source().is_some());
        assert!(matches!(err.root_cause(), ForemanError::TransientService(_)));
    }
}
