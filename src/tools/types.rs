//! Type definitions for zxic-deploy MCP tools

use serde::Deserialize;
use schemars::JsonSchema;

fn default_true() -> bool {
    true
}

fn default_profile() -> String {
    "release".to_string()
}

fn default_signal() -> String {
    "ping".to_string()
}

// ============================================================================
// provision_toolchain
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProvisionToolchainArgs {
    /// Project directory (default: from config)
    #[serde(default)]
    pub project_dir: Option<String>,
    /// Toolchain channel override (default: rust-toolchain.toml)
    #[serde(default)]
    pub toolchain: Option<String>,
    /// Run `rustup target add` when the target std is missing
    #[serde(default)]
    pub install_target: bool,
}

// ============================================================================
// build
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BuildArgs {
    /// Project directory (default: from config)
    #[serde(default)]
    pub project_dir: Option<String>,
    /// "release" or "debug" (default: release)
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Binary to build (default: from Cargo.toml)
    #[serde(default)]
    pub bin: Option<String>,
    /// Rebuild from an empty target dir and require an identical checksum
    #[serde(default)]
    pub check_reproducible: bool,
}

// ============================================================================
// inspect_artifact
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InspectArtifactArgs {
    /// Binary path (default: the release artifact)
    #[serde(default)]
    pub path: Option<String>,
    /// Fail unless the binary is statically linked for 32-bit ARM
    #[serde(default = "default_true")]
    pub require_static: bool,
}

// ============================================================================
// adb_devices
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AdbDevicesArgs {}

// ============================================================================
// adb_push
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AdbPushArgs {
    /// Local file (default: the release artifact)
    #[serde(default)]
    pub path: Option<String>,
    /// Remote directory (default: from config, /etc_rw)
    #[serde(default)]
    pub remote_dir: Option<String>,
    /// Device serial (default: from config)
    #[serde(default)]
    pub serial: Option<String>,
    /// Skip the static ARM check
    #[serde(default)]
    pub allow_dynamic: bool,
}

// ============================================================================
// adb_shell
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AdbShellArgs {
    /// Shell command to run on the device
    pub command: String,
    /// Device serial (default: from config)
    #[serde(default)]
    pub serial: Option<String>,
}

// ============================================================================
// tftp_start / tftp_stop / tftp_status
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TftpStartArgs {
    /// Directory to serve read-only (default: the release artifact directory)
    #[serde(default)]
    pub root: Option<String>,
    /// Bind address (default: from config, 0.0.0.0:69)
    #[serde(default)]
    pub bind: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TftpStopArgs {
    /// Server ID returned by tftp_start
    pub server_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TftpStatusArgs {
    /// Server ID (omit to list all servers)
    #[serde(default)]
    pub server_id: Option<String>,
}

// ============================================================================
// tftp_fetch
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TftpFetchArgs {
    /// Server address, host:port
    pub server: String,
    /// File to request
    pub filename: String,
    /// Local destination path
    pub output: String,
    /// Block size to negotiate (8-65464)
    #[serde(default)]
    pub blksize: Option<usize>,
}

// ============================================================================
// launch
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LaunchArgs {
    /// Reachability target passed to the binary, host:port (default: the
    /// device's TARGET_IP, else 127.0.0.1:80)
    #[serde(default)]
    pub target: Option<String>,
    /// Daemonize on the device
    #[serde(default)]
    pub background: bool,
    /// Quiet production mode (--isprod)
    #[serde(default)]
    pub prod: bool,
    /// Binary path on the device (default: <remote_dir>/<binary>)
    #[serde(default)]
    pub remote_path: Option<String>,
    /// Device serial (default: from config)
    #[serde(default)]
    pub serial: Option<String>,
}

// ============================================================================
// device_signal
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeviceSignalArgs {
    /// Device address, host or host:port (port defaults to 1300)
    pub device: String,
    /// ping, restart-adbd, kill-adbd or restart-server
    #[serde(default = "default_signal")]
    pub signal: String,
    /// Reply timeout per attempt in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}
