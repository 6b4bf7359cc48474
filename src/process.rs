//! Child process helpers shared by the toolchain, builder and ADB wrappers

use std::ffi::OsStr;
use tokio::process::Command;
use tracing::debug;

/// Result of an external command execution
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn from_output(output: &std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        }
    }

    /// stdout and stderr joined, for messages that want the whole transcript
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.trim().to_string(),
            (true, false) => self.stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
        }
    }
}

/// Run `program args..` to completion and capture its output.
///
/// Only a failure to spawn is an error; a non-zero exit is reported through
/// [`ExecResult::success`].
pub async fn run<I, S>(program: impl AsRef<OsStr>, args: I) -> std::io::Result<ExecResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let mut cmd = Command::new(program);
    cmd.args(args);
    debug!("exec: {:?}", cmd.as_std());

    let output = cmd.output().await?;
    Ok(ExecResult::from_output(&output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_output() {
        let mut result = ExecResult {
            success: true,
            stdout: "out\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(result.combined(), "out");

        result.stderr = "err\n".to_string();
        assert_eq!(result.combined(), "out\nerr");

        result.stdout.clear();
        assert_eq!(result.combined(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_exit_code() {
        let result = run("sh", ["-c", "echo hi; echo oops >&2; exit 3"]).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "hi");
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let err = run("definitely-not-a-real-program-zxic", ["--version"]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
