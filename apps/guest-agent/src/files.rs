//! `write_file` request handling: path restriction, atomic write, chmod.

use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::{engine::general_purpose, Engine as _};
use engine_types::ContentEncoding;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct WriteFileOutcome {
    pub success: bool,
    pub error: Option<String>,
}

/// Writes `content` to `file_path`, rejecting anything outside `/tmp/`.
pub async fn write_file(file_path: &str, content: &str, encoding: ContentEncoding) -> WriteFileOutcome {
    if !file_path.starts_with("/tmp/") {
        return WriteFileOutcome {
            success: false,
            error: Some(format!("path must be under /tmp/: {file_path}")),
        };
    }

    let bytes = match encoding {
        ContentEncoding::Utf8 => content.as_bytes().to_vec(),
        ContentEncoding::Base64 => match general_purpose::STANDARD.decode(content) {
            Ok(b) => b,
            Err(e) => {
                return WriteFileOutcome {
                    success: false,
                    error: Some(format!("invalid base64 content: {e}")),
                }
            }
        },
    };

    if let Some(parent) = std::path::Path::new(file_path).parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return WriteFileOutcome {
                success: false,
                error: Some(e.to_string()),
            };
        }
    }

    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = format!("{file_path}.{}.{seq}.tmp", std::process::id());

    let result = async {
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o644)).await?;
        tokio::fs::rename(&tmp_path, file_path).await?;
        std::io::Result::Ok(())
    }
    .await;

    if let Err(e) = &result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return WriteFileOutcome {
            success: false,
            error: Some(e.to_string()),
        };
    }

    WriteFileOutcome {
        success: true,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_path_outside_tmp() {
        let outcome = write_file("/etc/passwd", "x", ContentEncoding::Utf8).await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn writes_utf8_content_atomically() {
        let path = format!("/tmp/engine-test-{}.txt", std::process::id());
        let outcome = write_file(&path, "hello world", ContentEncoding::Utf8).await;
        assert!(outcome.success);
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "hello world");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn decodes_base64_content_before_writing() {
        let path = format!("/tmp/engine-test-b64-{}.bin", std::process::id());
        let encoded = general_purpose::STANDARD.encode(b"binary\x00payload");
        let outcome = write_file(&path, &encoded, ContentEncoding::Base64).await;
        assert!(outcome.success);
        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content, b"binary\x00payload");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn invalid_base64_content_is_rejected() {
        let path = format!("/tmp/engine-test-bad-b64-{}.bin", std::process::id());
        let outcome = write_file(&path, "not valid base64!!", ContentEncoding::Base64).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn no_temp_file_is_left_behind_after_a_write() {
        let pid = std::process::id();
        let path = format!("/tmp/engine-test-tmp-check-{pid}.txt");
        write_file(&path, "x", ContentEncoding::Utf8).await;
        let mut entries = tokio::fs::read_dir("/tmp").await.unwrap();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            assert!(
                !name.contains(&format!("engine-test-tmp-check-{pid}.txt.{pid}.")),
                "leftover temp file: {name}"
            );
        }
        let _ = tokio::fs::remove_file(&path).await;
    }
}
