use thiserror::Error;

/// The engine's error taxonomy. Request-level variants are folded into a
/// failed `ExecutionResult` by the caller; infrastructure variants additionally
/// drive pool destroy-and-replenish bookkeeping before being folded the same
/// way. See `Executor::execute`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("no healthy vm available for {language}")]
    VmUnavailable { language: String },

    #[error("hypervisor control socket never became ready")]
    HypervisorUnavailable,

    #[error("hypervisor {op} failed: {detail}")]
    HypervisorError { op: String, detail: String },

    #[error("guest transport timed out after {seconds}s")]
    TransportTimeout { seconds: u32 },

    #[error("guest transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("guest command failed: {stderr}")]
    GuestCommandFailed { stderr: String },

    #[error("Execution timed out after {seconds} seconds")]
    ExecutionTimeout { seconds: u32 },

    #[error("compilation failed: {stderr}")]
    CompilationFailure { stderr: String },

    #[error("internal resource error: {0}")]
    InternalResourceError(String),
}

impl EngineError {
    /// Infrastructure errors kill the affected VM and trigger replenishment;
    /// request-level errors never touch a healthy VM.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            EngineError::HypervisorUnavailable
                | EngineError::HypervisorError { .. }
                | EngineError::TransportTimeout { .. }
                | EngineError::TransportUnavailable(_)
                | EngineError::InternalResourceError(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_variants_are_flagged_for_destroy_and_replenish() {
        let infra = [
            EngineError::HypervisorUnavailable,
            EngineError::HypervisorError {
                op: "boot_source".to_string(),
                detail: "boom".to_string(),
            },
            EngineError::TransportTimeout { seconds: 5 },
            EngineError::TransportUnavailable("unreachable".to_string()),
            EngineError::InternalResourceError("reflink failed".to_string()),
        ];
        for error in infra {
            assert!(error.is_infrastructure(), "{error} should be infrastructure");
        }
    }

    #[test]
    fn request_level_variants_are_never_flagged_as_infrastructure() {
        let request_level = [
            EngineError::UnsupportedLanguage("cobol".to_string()),
            EngineError::VmUnavailable {
                language: "python".to_string(),
            },
            EngineError::GuestCommandFailed {
                stderr: "boom".to_string(),
            },
            EngineError::ExecutionTimeout { seconds: 2 },
            EngineError::CompilationFailure {
                stderr: "error[E0308]".to_string(),
            },
        ];
        for error in request_level {
            assert!(!error.is_infrastructure(), "{error} should not be infrastructure");
        }
    }

    #[test]
    fn execution_timeout_message_matches_the_contracted_prefix() {
        let error = EngineError::ExecutionTimeout { seconds: 2 };
        assert!(error.to_string().starts_with("Execution timed out after 2 seconds"));
    }
}
