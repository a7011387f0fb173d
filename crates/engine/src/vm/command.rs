//! Language -> guest execution command, resolved by the VM instance.

use engine_types::Language;

/// A pre-built Rust project with dependencies already compiled must exist
/// in the base image at this path; the template's `target/` is reused so
/// `cargo run` only recompiles the user's `main.rs`.
const RUST_TEMPLATE_DIR: &str = "/opt/rust-template";

pub fn build_execute_command(language: Language, guest_path: &str, timeout_seconds: u32) -> String {
    match language {
        Language::Python => format!("timeout {timeout_seconds} python3 {guest_path} 2>&1"),
        Language::TypeScript => format!("tsx {guest_path} < /dev/null 2>&1"),
        Language::Rust => format!(
            "cp {guest_path} {RUST_TEMPLATE_DIR}/src/main.rs && cd {RUST_TEMPLATE_DIR} && timeout {timeout_seconds} cargo run --release 2>&1"
        ),
    }
}

/// Marker a health-check program must print to stdout.
pub const HEALTH_CHECK_MARKER: &str = "health_check";

/// Source of a trivial program that prints [`HEALTH_CHECK_MARKER`], to be
/// written to `guest_path` before running `build_execute_command` against
/// the same path.
pub fn health_check_program_source(language: Language) -> String {
    match language {
        Language::Python => format!("print(\"{HEALTH_CHECK_MARKER}\")"),
        Language::TypeScript => format!("console.log(\"{HEALTH_CHECK_MARKER}\")"),
        Language::Rust => format!("fn main() {{ println!(\"{HEALTH_CHECK_MARKER}\"); }}"),
    }
}

pub fn echo_ready_command() -> &'static str {
    "echo ready"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_command_uses_shell_timeout_and_redirects_stderr() {
        let cmd = build_execute_command(Language::Python, "/tmp/user_code_0.py", 10);
        assert_eq!(cmd, "timeout 10 python3 /tmp/user_code_0.py 2>&1");
    }

    #[test]
    fn typescript_command_runs_under_tsx_with_closed_stdin() {
        let cmd = build_execute_command(Language::TypeScript, "/tmp/user_code_1.ts", 10);
        assert_eq!(cmd, "tsx /tmp/user_code_1.ts < /dev/null 2>&1");
    }

    #[test]
    fn typescript_command_has_no_shell_level_timeout() {
        let cmd = build_execute_command(Language::TypeScript, "/tmp/user_code_1.ts", 2);
        assert!(!cmd.contains("timeout 2"), "guest agent enforces TS timeout, not the shell");
    }

    #[test]
    fn rust_command_copies_into_the_prebuilt_template_and_reuses_its_target_dir() {
        let cmd = build_execute_command(Language::Rust, "/tmp/user_code_2.rs", 10);
        assert_eq!(
            cmd,
            "cp /tmp/user_code_2.rs /opt/rust-template/src/main.rs && cd /opt/rust-template && timeout 10 cargo run --release 2>&1"
        );
    }

    #[test]
    fn health_check_sources_all_print_the_marker() {
        for language in [Language::Python, Language::TypeScript, Language::Rust] {
            let source = health_check_program_source(language);
            assert!(source.contains(HEALTH_CHECK_MARKER));
        }
    }

    #[test]
    fn echo_ready_is_a_plain_shell_echo() {
        assert_eq!(echo_ready_command(), "echo ready");
    }
}
