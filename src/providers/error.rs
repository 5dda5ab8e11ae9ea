/// Provider-specific error with retry classification
///
/// The runtime uses `is_retryable()` to decide whether a failed store call is
/// worth repeating.
///
/// **Retryable**: database busy/locked, connection timeouts, temporary resource
/// exhaustion.
///
/// **Non-retryable**: sequence conflicts, appends to a closed history, corrupted
/// rows, invalid continuation tokens.
///
/// ```rust,no_run
/// use durable_pizza::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("append", "Database is busy"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g., "append", "list_instances")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error
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
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        let retryable = ProviderError::retryable("read", "Database is busy");
        assert!(retryable.is_retryable());
        assert_eq!(retryable.operation, "read");

        let permanent = ProviderError::permanent("append", "sequence conflict");
        assert!(!permanent.is_retryable());

        let display = format!("{permanent}");
        assert_eq!(display, "append: sequence conflict");

        let _err: Box<dyn std::error::Error> = Box::new(permanent);
    }

    #[test]
    fn test_provider_error_equality() {
        let err1 = ProviderError::retryable("op", "msg");
        let err2 = ProviderError::retryable("op", "msg");
        let err3 = ProviderError::permanent("op", "msg");

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
