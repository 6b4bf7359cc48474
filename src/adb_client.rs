//! ADB CLI wrapper for the direct-push deployment path
//!
//! Wraps the `adb` CLI for device discovery, file push and remote shell.
//! A push never falls back to TFTP: a missing device is reported as
//! [`AdbError::NoDevice`].

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::process::ExecResult;

/// Writable flash region on zxic routers
pub const DEFAULT_REMOTE_DIR: &str = "/etc_rw";

/// ADB device info from `adb devices`
#[derive(Debug, Clone, PartialEq)]
pub struct AdbDevice {
    pub serial: String,
    pub state: String,
}

impl AdbDevice {
    /// `offline` and `unauthorized` devices are listed but unusable
    pub fn is_connected(&self) -> bool {
        self.state == "device"
    }
}

/// An `adb` executable plus optional `-s <serial>` selection
#[derive(Debug, Clone)]
pub struct Adb {
    pub program: PathBuf,
    pub serial: Option<String>,
}

impl Default for Adb {
    fn default() -> Self {
        Self {
            program: PathBuf::from("adb"),
            serial: None,
        }
    }
}

impl Adb {
    pub fn new(program: impl Into<PathBuf>, serial: Option<String>) -> Self {
        Self {
            program: program.into(),
            serial,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(s) = &self.serial {
            cmd.arg("-s").arg(s);
        }
        cmd
    }
}

/// Parse `adb devices` output
pub fn parse_devices(stdout: &str) -> Vec<AdbDevice> {
    stdout
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1) // skip "List of devices attached" header
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 && !line.starts_with('*') {
                Some(AdbDevice {
                    serial: parts[0].to_string(),
                    state: parts[1].to_string(),
                })
            } else {
                None
            }
        })
        .collect()
}

/// Pick the device a command will run against.
///
/// With a serial, that device must be connected; without one, exactly the
/// first connected device is used (adb itself refuses when several are
/// attached, so that case is reported as an error too).
pub fn require_device<'a>(devices: &'a [AdbDevice], serial: Option<&str>) -> Result<&'a AdbDevice, AdbError> {
    let connected: Vec<&AdbDevice> = devices.iter().filter(|d| d.is_connected()).collect();

    match serial {
        Some(serial) => connected
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| AdbError::NoDevice(format!("device '{}' not connected", serial))),
        None => match connected.as_slice() {
            [] => Err(AdbError::NoDevice("no devices/emulators found".to_string())),
            [only] => Ok(only),
            many => Err(AdbError::CommandFailed(format!(
                "{} devices connected; pass a serial",
                many.len()
            ))),
        },
    }
}

/// Map adb's stderr to a connection-not-found condition when it is one
fn classify_failure(stderr: &str) -> Option<AdbError> {
    let lower = stderr.to_lowercase();
    let no_device = ["no devices", "device not found", "device offline", "no emulators"]
        .iter()
        .any(|needle| lower.contains(needle));
    no_device.then(|| AdbError::NoDevice(stderr.trim().to_string()))
}

/// List attached ADB devices
pub async fn adb_devices(adb: &Adb) -> Result<Vec<AdbDevice>, AdbError> {
    debug!("adb devices");

    let output = Command::new(&adb.program)
        .arg("devices")
        .output()
        .await
        .map_err(|e| AdbError::Unavailable(format!("{}: {}", adb.program.display(), e)))?;

    if !output.status.success() {
        return Err(AdbError::CommandFailed(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
}

/// Run a shell command on the device
pub async fn adb_shell(adb: &Adb, command: &str) -> Result<ExecResult, AdbError> {
    info!("adb shell: {}", command);

    let output = adb
        .command()
        .arg("shell")
        .arg(command)
        .output()
        .await
        .map_err(|e| AdbError::Unavailable(format!("{}: {}", adb.program.display(), e)))?;

    let result = ExecResult::from_output(&output);
    if !result.success {
        if let Some(err) = classify_failure(&result.stderr) {
            return Err(err);
        }
    }
    Ok(result)
}

/// Push a file to the device.
///
/// Requires a connected device up front so an absent bridge session fails
/// with [`AdbError::NoDevice`] instead of waiting on adb.
pub async fn adb_push(adb: &Adb, file_path: &Path, remote_path: &str) -> Result<String, AdbError> {
    if !file_path.is_file() {
        return Err(AdbError::FileNotFound(file_path.to_path_buf()));
    }

    let devices = adb_devices(adb).await?;
    let device = require_device(&devices, adb.serial.as_deref())?;
    info!("adb push {} -> {}:{}", file_path.display(), device.serial, remote_path);

    let output = adb
        .command()
        .arg("push")
        .arg(file_path)
        .arg(remote_path)
        .output()
        .await
        .map_err(|e| AdbError::Unavailable(format!("{}: {}", adb.program.display(), e)))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(&stderr).unwrap_or_else(|| AdbError::PushFailed(stderr.trim().to_string())))
    }
}

/// Remote path the artifact lands at: `<remote_dir>/<file name>`
pub fn remote_path_for(file_path: &Path, remote_dir: &str) -> Result<String, AdbError> {
    let name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AdbError::FileNotFound(file_path.to_path_buf()))?;
    Ok(format!("{}/{}", remote_dir.trim_end_matches('/'), name))
}

/// Push the artifact into `remote_dir` and mark it executable
pub async fn deploy_push(adb: &Adb, file_path: &Path, remote_dir: &str) -> Result<String, AdbError> {
    let remote = remote_path_for(file_path, remote_dir)?;
    let transcript = adb_push(adb, file_path, &remote).await?;

    let chmod = adb_shell(adb, &format!("chmod 755 {}", remote)).await?;
    if !chmod.success {
        warn!("chmod on {} failed: {}", remote, chmod.combined());
        return Err(AdbError::CommandFailed(format!(
            "pushed but chmod failed: {}",
            chmod.combined()
        )));
    }

    Ok(format!("{}\n{} is executable", transcript, remote))
}

#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("ADB device not connected: {0}")]
    NoDevice(String),

    #[error("ADB unavailable: {0}")]
    Unavailable(String),

    #[error("ADB command failed: {0}")]
    CommandFailed(String),

    #[error("ADB push failed: {0}")]
    PushFailed(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES_OUTPUT: &str = "* daemon not running; starting now at tcp:5037\n\
                                  * daemon started successfully\n\
                                  List of devices attached\n\
                                  0123456789ABCDEF\tdevice\n\
                                  zx297520v3\toffline\n\n";

    #[test]
    fn test_parse_devices() {
        let devices = parse_devices(DEVICES_OUTPUT);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial, "0123456789ABCDEF");
        assert!(devices[0].is_connected());
        assert!(!devices[1].is_connected());
    }

    #[test]
    fn test_parse_no_devices() {
        assert!(parse_devices("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_require_device_none_connected() {
        let devices = vec![AdbDevice { serial: "zx".to_string(), state: "offline".to_string() }];
        assert!(matches!(require_device(&devices, None), Err(AdbError::NoDevice(_))));
        assert!(matches!(require_device(&[], None), Err(AdbError::NoDevice(_))));
    }

    #[test]
    fn test_require_device_by_serial() {
        let devices = parse_devices(DEVICES_OUTPUT);
        assert_eq!(
            require_device(&devices, Some("0123456789ABCDEF")).unwrap().serial,
            "0123456789ABCDEF"
        );
        assert!(matches!(
            require_device(&devices, Some("zx297520v3")),
            Err(AdbError::NoDevice(_))
        ));
    }

    #[test]
    fn test_require_device_ambiguous() {
        let devices = vec![
            AdbDevice { serial: "a".to_string(), state: "device".to_string() },
            AdbDevice { serial: "b".to_string(), state: "device".to_string() },
        ];
        assert!(matches!(require_device(&devices, None), Err(AdbError::CommandFailed(_))));
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("adb: error: failed to get feature set: no devices/emulators found"),
            Some(AdbError::NoDevice(_))
        ));
        assert!(matches!(
            classify_failure("error: device 'abc' not found"),
            Some(AdbError::NoDevice(_))
        ));
        assert!(classify_failure("remote couldn't create file: Read-only file system").is_none());
    }

    #[test]
    fn test_remote_path_for() {
        assert_eq!(
            remote_path_for(Path::new("target/armv7-unknown-linux-musleabi/release/zxic_ping"), "/etc_rw/").unwrap(),
            "/etc_rw/zxic_ping"
        );
    }

    #[tokio::test]
    async fn test_push_missing_file() {
        let err = adb_push(&Adb::default(), Path::new("/nonexistent/zxic_ping"), "/etc_rw/zxic_ping")
            .await
            .unwrap_err();
        assert!(matches!(err, AdbError::FileNotFound(_)));
    }

    #[test]
    fn test_adb_error_display() {
        let err = AdbError::NoDevice("no devices/emulators found".to_string());
        assert!(err.to_string().contains("not connected"));

        let err = AdbError::PushFailed("read-only".to_string());
        assert!(err.to_string().contains("ADB push failed"));
    }
}
