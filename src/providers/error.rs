use crate::InstanceId;

/// Storage failure with a retry classification.
///
/// **Retryable**: database busy or locked, connection timeouts, transient
/// resource exhaustion. The runtime retries these with backoff at the
/// activation or task level and never surfaces them to workflow code.
///
/// **Permanent**: corrupt or undecodable records, unknown lock tokens,
/// constraint violations that indicate a bug.
///
/// ```rust
/// use duraflow::providers::ProviderError;
///
/// let busy = ProviderError::retryable("append_with_tasks", "database is locked");
/// assert!(busy.is_retryable());
/// let lost = ProviderError::permanent("ack", "unknown lock token");
/// assert!(!lost.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g. "append_with_tasks", "dequeue")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Untyped errors are treated as transient.
impl From<String> for ProviderError {
    fn from(s: String) -> Self {
        Self {
            operation: "unknown".to_string(),
            message: s,
            retryable: true,
        }
    }
}

impl From<&str> for ProviderError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

/// Outcome of a rejected compare-and-append.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    /// `expected_last_seq` was stale: another writer appended first.
    /// Never retried by the store; the caller lost authority over the instance.
    #[error("append conflict: expected last seq {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Failure to create a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    /// A run of the same workflow id is still open and the request did not
    /// match it by idempotency key.
    #[error("workflow already running: {0}")]
    AlreadyRunning(InstanceId),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_and_display() {
        let retryable = ProviderError::retryable("dequeue", "Database is busy");
        assert!(retryable.is_retryable());
        assert_eq!(retryable.operation, "dequeue");

        let permanent = ProviderError::permanent("ack", "unknown lock token");
        assert!(!permanent.is_retryable());
        let display = format!("{permanent}");
        assert!(display.contains("ack"));
        assert!(display.contains("unknown lock token"));

        let _err: Box<dyn std::error::Error> = Box::new(permanent);
    }

    #[test]
    fn strings_convert_to_retryable_errors() {
        let from_str: ProviderError = "boom".into();
        assert!(from_str.is_retryable());
        assert_eq!(from_str.operation, "unknown");
        assert_eq!(from_str.message, "boom");
    }

    #[test]
    fn infrastructure_details_keep_the_classification() {
        match ProviderError::permanent("write", "Data corruption").to_infrastructure_error() {
            crate::ErrorDetails::Infrastructure {
                operation,
                message,
                retryable,
            } => {
                assert_eq!(operation, "write");
                assert!(message.contains("corruption"));
                assert!(!retryable);
            }
            other => panic!("expected Infrastructure error, got {other:?}"),
        }
    }

    #[test]
    fn conflict_message_names_both_sequences() {
        let e = AppendError::Conflict { expected: 3, actual: 5 };
        assert_eq!(e.to_string(), "append conflict: expected last seq 3, found 5");
        let wrapped: AppendError = ProviderError::retryable("append", "locked").into();
        assert!(matches!(wrapped, AppendError::Provider(p) if p.is_retryable()));
    }
}
