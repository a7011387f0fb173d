//! Runs one untrusted command to completion or kills its whole process
//! group on timeout.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Sentinel return code reported for a command killed on timeout.
pub const TIMEOUT_RETURN_CODE: i32 = -1;

/// Bound on captured stdout/stderr; beyond this a truncation marker is
/// appended and further bytes are discarded (but still drained so the
/// child is never blocked on a full pipe).
const CAPTURE_CAP_BYTES: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n...[output truncated]...\n";

pub struct ExecOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

/// Spawns `/bin/sh -c command` in a new process group with a restricted
/// environment, and enforces `timeout_secs` by killing the whole group.
pub async fn run(command: &str, timeout_secs: u32) -> ExecOutcome {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir("/tmp")
        .env_clear()
        .env("PATH", "/usr/local/bin:/usr/bin:/bin")
        .env("HOME", "/tmp")
        .env("USER", "nobody")
        .env("TMPDIR", "/tmp")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // New session + process group, so a timeout kill reaches every
    // descendant the command spawned, not just the shell.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return ExecOutcome {
                success: false,
                stdout: String::new(),
                stderr: format!("failed to spawn command: {e}"),
                return_code: TIMEOUT_RETURN_CODE,
            }
        }
    };

    let pid = child.id().map(|p| p as i32);
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let stdout_task = tokio::spawn(async move {
        match &mut stdout_pipe {
            Some(r) => capture_bounded(r).await,
            None => (String::new(), false),
        }
    });
    let stderr_task = tokio::spawn(async move {
        match &mut stderr_pipe {
            Some(r) => capture_bounded(r).await,
            None => (String::new(), false),
        }
    });

    let timed_out = tokio::select! {
        _ = child.wait() => false,
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs as u64)) => true,
    };

    if timed_out {
        if let Some(pid) = pid {
            // Negative pid targets the whole process group.
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
        let _ = child.wait().await;
    }

    let (mut stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
    let (mut stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();
    if stdout_truncated {
        stdout.push_str(TRUNCATION_MARKER);
    }
    if stderr_truncated {
        stderr.push_str(TRUNCATION_MARKER);
    }

    if timed_out {
        let mut stderr = format!("timeout: command exceeded {timeout_secs}s") + &stderr;
        if stderr.len() > CAPTURE_CAP_BYTES {
            stderr.truncate(CAPTURE_CAP_BYTES);
        }
        return ExecOutcome {
            success: false,
            stdout,
            stderr,
            return_code: TIMEOUT_RETURN_CODE,
        };
    }

    let return_code = child
        .wait()
        .await
        .ok()
        .and_then(|status| status.code())
        .unwrap_or(TIMEOUT_RETURN_CODE);

    ExecOutcome {
        success: return_code == 0,
        stdout,
        stderr,
        return_code,
    }
}

/// Reads from `reader` up to the capture cap, discarding (but still
/// draining) anything beyond it so the writer never blocks on a full pipe.
async fn capture_bounded(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> (String, bool) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut out = Vec::with_capacity(CAPTURE_CAP_BYTES.min(64 * 1024));
    let mut truncated = false;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if out.len() < CAPTURE_CAP_BYTES {
            let room = CAPTURE_CAP_BYTES - out.len();
            let take = room.min(n);
            out.extend_from_slice(&buf[..take]);
            if take < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }

    (String::from_utf8_lossy(&out).into_owned(), truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_simple_command() {
        let outcome = run("echo hello", 5).await;
        assert!(outcome.success);
        assert_eq!(outcome.stdout.trim(), "hello");
        assert_eq!(outcome.return_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let outcome = run("exit 3", 5).await;
        assert!(!outcome.success);
        assert_eq!(outcome.return_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group() {
        let outcome = run("sleep 30", 1).await;
        assert!(!outcome.success);
        assert_eq!(outcome.return_code, TIMEOUT_RETURN_CODE);
        assert!(outcome.stderr.starts_with("timeout"));
    }

    #[tokio::test]
    async fn stdout_past_the_capture_cap_is_truncated_with_a_marker() {
        let outcome = run("yes | head -c 2000000", 10).await;
        assert!(outcome.success);
        assert!(outcome.stdout.len() <= CAPTURE_CAP_BYTES + TRUNCATION_MARKER.len());
        assert!(outcome.stdout.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn restricted_environment_has_no_inherited_variables() {
        let outcome = run("echo $HOME $USER", 5).await;
        assert_eq!(outcome.stdout.trim(), "/tmp nobody");
    }
}
