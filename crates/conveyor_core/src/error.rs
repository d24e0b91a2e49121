//! Core error types for Conveyor.

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation {
        /// Offending field
        field: String,
        /// Why the value was rejected
        reason: String,
    },
}

impl CoreError {
    /// Shorthand for a [`CoreError::Validation`]
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::validation("failure policy", "expected 'isolate' or 'halt', got 'retry'");
        assert_eq!(
            format!("{}", err),
            "Validation failed for failure policy: expected 'isolate' or 'halt', got 'retry'"
        );
    }
}
