//! Isolated, directly-testable policy for turning a guest exec result into
//! a success/failure/timeout verdict.

use engine_types::Language;

use crate::transport::GuestExecResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOutcome {
    Success,
    Failure,
    TimedOut,
}

const RUST_COMPILE_ERROR_MARKERS: [&str; 3] = ["error:", "error[E", "could not compile"];

/// `return_code == -1` is the guest agent's sentinel for "killed on
/// timeout"; everything else is judged on `success`/`return_code`, with an
/// extra compiler-error substring check for Rust.
pub fn classify_guest_result(language: Language, result: &GuestExecResult) -> GuestOutcome {
    if result.return_code == engine_types::TIMEOUT_RETURN_CODE {
        return GuestOutcome::TimedOut;
    }

    if !result.success {
        return GuestOutcome::Failure;
    }

    if language == Language::Rust && has_rust_compile_error(&result.stderr) {
        return GuestOutcome::Failure;
    }

    GuestOutcome::Success
}

fn has_rust_compile_error(stderr: &str) -> bool {
    RUST_COMPILE_ERROR_MARKERS.iter().any(|marker| stderr.contains(marker))
}
