//! Configuration for zxic-deploy

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::debug;

use crate::adb_client::{Adb, DEFAULT_REMOTE_DIR};
use crate::builder::{self, BuildRequest, Profile, DEFAULT_BINARY};
use crate::toolchain::{TargetTriple, ToolchainSpec, DEFAULT_TARGET};

pub const DEFAULT_TFTP_BIND: &str = "0.0.0.0:69";

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "zxic-deploy")]
#[command(about = "Cross-build zxic_ping for ARMv7/musl and deploy it over ADB or TFTP")]
#[command(version)]
pub struct Args {
    /// Project directory containing Cargo.toml
    #[arg(long, global = true, env = "ZXIC_PROJECT_DIR", default_value = ".")]
    pub project_dir: PathBuf,

    /// Target triple
    #[arg(long, global = true, env = "ZXIC_TARGET", default_value = DEFAULT_TARGET)]
    pub target: TargetTriple,

    /// Pinned toolchain channel (default: the project's rust-toolchain.toml)
    #[arg(long, global = true, env = "ZXIC_TOOLCHAIN")]
    pub toolchain: Option<String>,

    /// Cross-linker executable (default: searched on PATH)
    #[arg(long, global = true, env = "ZXIC_LINKER")]
    pub linker: Option<PathBuf>,

    /// CA certificate bundle exported to the build
    #[arg(long, global = true, env = "ZXIC_CERT_BUNDLE")]
    pub cert_bundle: Option<PathBuf>,

    /// Cargo target directory (default: <project>/target)
    #[arg(long, global = true, env = "CARGO_TARGET_DIR")]
    pub target_dir: Option<PathBuf>,

    /// adb executable
    #[arg(long, global = true, env = "ZXIC_ADB", default_value = "adb")]
    pub adb: PathBuf,

    /// Device serial when several are attached
    #[arg(long, global = true, env = "ANDROID_SERIAL")]
    pub adb_serial: Option<String>,

    /// Directory on the device the binary is pushed to
    #[arg(long, global = true, env = "ZXIC_REMOTE_DIR", default_value = DEFAULT_REMOTE_DIR)]
    pub remote_dir: String,

    /// TFTP server bind address
    #[arg(long, global = true, env = "ZXIC_TFTP_BIND", default_value = DEFAULT_TFTP_BIND)]
    pub tftp_bind: SocketAddr,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "ZXIC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log file path (defaults to stderr)
    #[arg(long, global = true, env = "ZXIC_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check the pinned toolchain, target std and cross-linker
    Provision {
        /// Install the target std with rustup when missing
        #[arg(long)]
        install_target: bool,
        /// Print the environment as shell exports
        #[arg(long)]
        exports: bool,
    },

    /// Provision, then build the static binary
    Build {
        #[arg(long)]
        debug: bool,
        /// Binary to build (default: from Cargo.toml)
        #[arg(long)]
        bin: Option<String>,
        /// Rebuild from an empty target dir and compare checksums
        #[arg(long)]
        check_reproducible: bool,
    },

    /// Report checksum and linkage of a built binary
    Inspect {
        /// Binary path (default: the release artifact)
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// List attached ADB devices
    Devices,

    /// Push the binary to the device and mark it executable
    Push {
        /// Binary path (default: the release artifact)
        path: Option<PathBuf>,
        /// Skip the static-linkage check
        #[arg(long)]
        allow_dynamic: bool,
    },

    /// Serve a directory read-only over TFTP until Ctrl-C
    ServeTftp {
        /// Directory to serve (default: the release artifact directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Pull a file from a TFTP server, as the device would
    Fetch {
        server: SocketAddr,
        filename: String,
        /// Local destination (default: ./<filename>)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Negotiate a block size (RFC 2348)
        #[arg(long)]
        blksize: Option<usize>,
    },

    /// Start the deployed binary on the device
    Launch {
        /// Reachability target, host:port (default: the device's TARGET_IP, else 127.0.0.1:80)
        #[arg(id = "launch_target", value_name = "TARGET")]
        target: Option<String>,
        /// Daemonize on the device
        #[arg(long)]
        background: bool,
        /// Quiet production mode
        #[arg(long)]
        prod: bool,
        /// Binary on the device (default: <remote-dir>/<binary>)
        #[arg(long)]
        remote_path: Option<String>,
    },

    /// Send a control signal to the running binary's UDP port and wait for OK
    Signal {
        /// Device address, host or host:port (port defaults to 1300)
        device: String,
        /// ping, restart-adbd, kill-adbd or restart-server
        #[arg(long, default_value = "ping")]
        signal: String,
        /// Reply timeout per attempt in milliseconds
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },

    /// Serve the MCP tools over stdio (default)
    Mcp,
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub target: TargetTriple,
    pub toolchain: Option<String>,
    pub linker: Option<PathBuf>,
    pub cert_bundle: Option<PathBuf>,
    pub target_dir: Option<PathBuf>,
    pub adb_program: PathBuf,
    pub adb_serial: Option<String>,
    pub remote_dir: String,
    pub tftp_bind: SocketAddr,
}

impl Config {
    pub fn from_args(args: &Args) -> Self {
        Self {
            project_dir: args.project_dir.clone(),
            target: args.target.clone(),
            toolchain: args.toolchain.clone(),
            linker: args.linker.clone(),
            cert_bundle: args.cert_bundle.clone(),
            target_dir: args.target_dir.clone(),
            adb_program: args.adb.clone(),
            adb_serial: args.adb_serial.clone(),
            remote_dir: args.remote_dir.clone(),
            tftp_bind: args.tftp_bind,
        }
    }

    pub fn toolchain_spec(&self, install_target: bool) -> ToolchainSpec {
        ToolchainSpec {
            channel: self.toolchain.clone(),
            target: self.target.clone(),
            linker: self.linker.clone(),
            cert_bundle: self.cert_bundle.clone(),
            install_target,
        }
    }

    pub fn build_request(&self, profile: Profile, binary_name: Option<String>) -> BuildRequest {
        BuildRequest {
            project_dir: self.project_dir.clone(),
            target_dir: self.target_dir.clone(),
            binary_name,
            profile,
        }
    }

    pub fn adb(&self) -> Adb {
        Adb::new(self.adb_program.clone(), self.adb_serial.clone())
    }

    /// Binary name from the project manifest, or `zxic_ping` when unreadable
    pub fn binary_name(&self) -> String {
        builder::binary_name(&self.project_dir).unwrap_or_else(|_| DEFAULT_BINARY.to_string())
    }

    /// Where the release build of the project binary lands.
    ///
    /// Asks `cargo metadata` for the target directory and falls back to
    /// `<project>/target` when cargo cannot answer.
    pub async fn release_artifact(&self) -> PathBuf {
        let request = self.build_request(Profile::Release, None);
        let output_root = match builder::resolve_output_root(Path::new("cargo"), self.toolchain.as_deref(), &request).await {
            Ok(root) => root,
            Err(e) => {
                debug!("Falling back to {}: {}", request.output_root().display(), e);
                request.output_root()
            }
        };
        builder::artifact_path(&output_root, &self.target, Profile::Release, &self.binary_name())
    }

    /// Default device-side path of the pushed binary
    pub fn remote_binary(&self) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), self.binary_name())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            target: TargetTriple::default(),
            toolchain: None,
            linker: None,
            cert_bundle: None,
            target_dir: None,
            adb_program: PathBuf::from("adb"),
            adb_serial: None,
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
            tftp_bind: SocketAddr::from(([0, 0, 0, 0], 69)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_artifact_layout() {
        let config = Config {
            project_dir: PathBuf::from("/nonexistent/zxic"),
            ..Config::default()
        };
        assert_eq!(
            config.release_artifact().await,
            PathBuf::from("/nonexistent/zxic/target/armv7-unknown-linux-musleabi/release/zxic_ping")
        );
        assert_eq!(config.remote_binary(), "/etc_rw/zxic_ping");
    }

    #[tokio::test]
    async fn test_release_artifact_explicit_target_dir() {
        let config = Config {
            project_dir: PathBuf::from("/nonexistent/zxic"),
            target_dir: Some(PathBuf::from("/nonexistent/ws/target")),
            ..Config::default()
        };
        assert_eq!(
            config.release_artifact().await,
            PathBuf::from("/nonexistent/ws/target/armv7-unknown-linux-musleabi/release/zxic_ping")
        );
    }

    #[test]
    fn test_toolchain_spec_from_config() {
        let config = Config {
            toolchain: Some("1.75.0".to_string()),
            ..Config::default()
        };
        let spec = config.toolchain_spec(true);
        assert_eq!(spec.channel.as_deref(), Some("1.75.0"));
        assert_eq!(spec.target.as_str(), DEFAULT_TARGET);
        assert!(spec.install_target);
    }
}
