//! Shared data model for the microVM execution engine: the types that
//! cross the host<->guest wire and the request/result shapes an external
//! front-end exchanges with the executor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A supported guest language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Rust,
    TypeScript,
}

impl Language {
    /// Source file extension used for the guest-side scratch file.
    pub fn file_extension(self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Rust => "rs",
            Language::TypeScript => "ts",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Rust => "rust",
            Language::TypeScript => "typescript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = UnsupportedLanguageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Language::Python),
            "rust" => Ok(Language::Rust),
            "typescript" => Ok(Language::TypeScript),
            other => Err(UnsupportedLanguageError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnsupportedLanguageError(pub String);

impl fmt::Display for UnsupportedLanguageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported language: {}", self.0)
    }
}

impl std::error::Error for UnsupportedLanguageError {}

/// A reference to an externally-resolved resource policy. The catalog that
/// produces one is an external collaborator; the engine only consumes the
/// clamped numbers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicyRef {
    pub max_timeout_seconds: u32,
    pub max_memory_mib: u32,
    pub network_enabled: bool,
    pub pool_size_hint: usize,
}

impl Default for PolicyRef {
    fn default() -> Self {
        PolicyRef {
            max_timeout_seconds: 30,
            max_memory_mib: 256,
            network_enabled: false,
            pool_size_hint: 3,
        }
    }
}

/// Configuration for one microVM, immutable once the VM starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub vcpus: u32,
    pub memory_mib: u32,
    pub timeout_seconds: u32,
    pub network_enabled: bool,
    pub policy_tag: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            vcpus: 1,
            memory_mib: 64,
            timeout_seconds: 10,
            network_enabled: false,
            policy_tag: "default".to_string(),
        }
    }
}

impl VmConfig {
    /// Narrows this config's timeout/memory to a policy's ceilings, as
    /// the executor does before dispatching a request.
    pub fn clamp_to(&mut self, policy: &PolicyRef) {
        self.timeout_seconds = self.timeout_seconds.min(policy.max_timeout_seconds);
        self.memory_mib = self.memory_mib.min(policy.max_memory_mib);
        self.network_enabled = self.network_enabled && policy.network_enabled;
    }
}

/// Outcome of one `Executor::execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub execution_time_seconds: f64,
    pub vm_id: String,
}

impl ExecutionResult {
    pub fn failure(vm_id: impl Into<String>, error: impl Into<String>, elapsed: f64) -> Self {
        ExecutionResult {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            execution_time_seconds: elapsed,
            vm_id: vm_id.into(),
        }
    }
}

/// Encoding for `WriteFile` request content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    Utf8,
    Base64,
}

/// A request sent from the host to a guest agent over either transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestRequest {
    Execute {
        request_id: String,
        command: String,
        timeout: u32,
    },
    WriteFile {
        request_id: String,
        file_path: String,
        content: String,
        encoding: ContentEncoding,
    },
    Health {
        request_id: String,
    },
}

impl GuestRequest {
    pub fn request_id(&self) -> &str {
        match self {
            GuestRequest::Execute { request_id, .. } => request_id,
            GuestRequest::WriteFile { request_id, .. } => request_id,
            GuestRequest::Health { request_id } => request_id,
        }
    }
}

/// A response from a guest agent, mirroring the request's tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
}

/// Guest-agent heartbeat/status file content (T-FS).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestStatus {
    pub agent_id: String,
    pub status: String,
    pub timestamp: f64,
    pub uptime_seconds: f64,
    pub shared_dir: String,
}

/// The sentinel return code the guest agent reports for a timed-out command.
pub const TIMEOUT_RETURN_CODE: i32 = -1;

/// Per-language pool statistics, owned exclusively by the pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub created: u64,
    pub destroyed: u64,
    pub executions: u64,
    pub hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn language_round_trips_through_its_str_form() {
        for language in [Language::Python, Language::Rust, Language::TypeScript] {
            assert_eq!(Language::from_str(language.as_str()).unwrap(), language);
        }
    }

    #[test]
    fn unknown_language_tag_is_rejected() {
        assert!(Language::from_str("cobol").is_err());
    }

    #[test]
    fn file_extensions_match_their_language() {
        assert_eq!(Language::Python.file_extension(), "py");
        assert_eq!(Language::Rust.file_extension(), "rs");
        assert_eq!(Language::TypeScript.file_extension(), "ts");
    }

    #[test]
    fn clamp_to_narrows_timeout_and_memory_down_to_policy_ceilings() {
        let mut config = VmConfig {
            timeout_seconds: 60,
            memory_mib: 512,
            network_enabled: true,
            ..VmConfig::default()
        };
        let policy = PolicyRef {
            max_timeout_seconds: 10,
            max_memory_mib: 128,
            network_enabled: false,
            pool_size_hint: 3,
        };
        config.clamp_to(&policy);
        assert_eq!(config.timeout_seconds, 10);
        assert_eq!(config.memory_mib, 128);
        assert!(!config.network_enabled);
    }

    #[test]
    fn clamp_to_never_raises_a_request_below_its_own_value() {
        let mut config = VmConfig {
            timeout_seconds: 5,
            memory_mib: 64,
            ..VmConfig::default()
        };
        let policy = PolicyRef::default();
        config.clamp_to(&policy);
        assert_eq!(config.timeout_seconds, 5);
        assert_eq!(config.memory_mib, 64);
    }

    #[test]
    fn failure_constructor_always_carries_elapsed_time_and_no_output() {
        let result = ExecutionResult::failure("vm-1", "boom", 1.5);
        assert!(!result.success);
        assert_eq!(result.output, "");
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.execution_time_seconds, 1.5);
    }

    #[test]
    fn guest_request_id_is_extracted_for_every_variant() {
        let execute = GuestRequest::Execute {
            request_id: "r1".to_string(),
            command: "echo hi".to_string(),
            timeout: 5,
        };
        let write = GuestRequest::WriteFile {
            request_id: "r2".to_string(),
            file_path: "/tmp/a".to_string(),
            content: "x".to_string(),
            encoding: ContentEncoding::Utf8,
        };
        let health = GuestRequest::Health {
            request_id: "r3".to_string(),
        };
        assert_eq!(execute.request_id(), "r1");
        assert_eq!(write.request_id(), "r2");
        assert_eq!(health.request_id(), "r3");
    }

    #[test]
    fn guest_request_execute_serializes_with_a_type_tag() {
        let execute = GuestRequest::Execute {
            request_id: "r1".to_string(),
            command: "echo hi".to_string(),
            timeout: 5,
        };
        let value = serde_json::to_value(&execute).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["command"], "echo hi");
    }
}
