//! RMCP 0.3.2 implementation for zxic-deploy MCP tools
//!
//! Provides 12 tools covering toolchain provisioning, the static build,
//! artifact inspection, ADB deployment, the TFTP server lifecycle,
//! launching the deployed binary and its UDP control port.

use rmcp::{
    tool, tool_router, tool_handler, ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::*,
    ErrorData as McpError,
    service::RequestContext,
    RoleServer,
};
use tracing::info;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::types::*;
use crate::adb_client;
use crate::artifact;
use crate::builder::{self, Profile};
use crate::config::Config;
use crate::launch::{self, LaunchOptions, PingTarget};
use crate::signal::{self, DeviceSignal, SignalOptions};
use crate::tftp::{self, FetchOptions, ServerConfig, TftpHandle, TftpServer};
use crate::toolchain;

// =========================================================================
// Tool handler
// =========================================================================

/// zxic-deploy tool handler
#[derive(Clone)]
pub struct ZxicDeployToolHandler {
    #[allow(dead_code)]
    tool_router: ToolRouter<ZxicDeployToolHandler>,
    config: Config,
    tftp_servers: Arc<RwLock<HashMap<String, TftpHandle>>>,
}

impl ZxicDeployToolHandler {
    pub fn new(config: Config) -> Self {
        Self {
            tool_router: Self::tool_router(),
            config,
            tftp_servers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn config_for(&self, project_dir: Option<String>) -> Config {
        match project_dir {
            Some(dir) => Config {
                project_dir: PathBuf::from(dir),
                ..self.config.clone()
            },
            None => self.config.clone(),
        }
    }

    fn adb_for(&self, serial: Option<String>) -> adb_client::Adb {
        let mut adb = self.config.adb();
        if serial.is_some() {
            adb.serial = serial;
        }
        adb
    }
}

impl Default for ZxicDeployToolHandler {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

fn make_error(msg: impl Into<String>) -> McpError {
    McpError::internal_error(msg.into(), None)
}

fn format_uptime(secs: u64) -> String {
    format!("{}m {}s", secs / 60, secs % 60)
}

fn describe_server(id: &str, handle: &TftpHandle) -> String {
    let stats = handle.stats();
    format!(
        "Server ID: {}\n\
         Address: {}\n\
         Root: {}\n\
         Running: {}\n\
         Uptime: {}\n\
         Requests: {} ({} completed, {} failed)\n\
         Bytes sent: {}",
        id,
        handle.local_addr(),
        handle.root().display(),
        handle.is_running(),
        format_uptime(handle.uptime().as_secs()),
        stats.requests,
        stats.completed,
        stats.failed,
        stats.bytes_sent,
    )
}

#[tool_router]
impl ZxicDeployToolHandler {
    // =========================================================================
    // Toolchain and build (3 tools)
    // =========================================================================

    #[tool(description = "Resolve the pinned Rust toolchain, check the ARMv7/musl target and locate the cross-linker. Returns the isolated build environment.")]
    async fn provision_toolchain(&self, Parameters(args): Parameters<ProvisionToolchainArgs>) -> Result<CallToolResult, McpError> {
        let mut config = self.config_for(args.project_dir);
        if args.toolchain.is_some() {
            config.toolchain = args.toolchain;
        }

        let env = toolchain::provision(&config.toolchain_spec(args.install_target), &config.project_dir)
            .await
            .map_err(|e| make_error(e.to_string()))?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Toolchain provisioned\n\
             Channel: {}\n\
             Target: {}\n\
             Linker: {}\n\n\
             Environment:\n{}",
            env.channel,
            env.target,
            env.linker.display(),
            env.to_shell_exports()
        ))]))
    }

    #[tool(description = "Provision the toolchain, then build the project as a static binary for the target. Compiler errors are returned verbatim.")]
    async fn build(&self, Parameters(args): Parameters<BuildArgs>) -> Result<CallToolResult, McpError> {
        let profile = match args.profile.as_str() {
            "release" => Profile::Release,
            "debug" => Profile::Debug,
            other => return Err(McpError::invalid_params(
                format!("Unknown profile '{}'. Use 'release' or 'debug'.", other),
                None,
            )),
        };

        let config = self.config_for(args.project_dir);
        if !config.project_dir.join("Cargo.toml").is_file() {
            return Err(McpError::invalid_params(
                format!("No Cargo.toml in {}", config.project_dir.display()),
                None,
            ));
        }

        let env = toolchain::provision(&config.toolchain_spec(false), &config.project_dir)
            .await
            .map_err(|e| make_error(e.to_string()))?;
        let request = config.build_request(profile, args.bin);

        let output = if args.check_reproducible {
            builder::check_reproducible(Path::new("cargo"), &env, &request).await
        } else {
            builder::build(&env, &request).await
        }
        .map_err(|e| make_error(e.to_string()))?;

        let report = artifact::inspect(&output.artifact).map_err(|e| make_error(e.to_string()))?;
        artifact::ensure_static(&report).map_err(|e| make_error(e.to_string()))?;

        let mut message = format!(
            "Build complete\n\
             Artifact: {}\n\
             SHA-256: {}\n\
             Duration: {:.1}s\n\n{}",
            output.artifact.display(),
            output.sha256,
            output.duration.as_secs_f64(),
            report.summary()
        );
        if args.check_reproducible {
            message.push_str("\nReproducible: yes (clean rebuild, identical checksum)");
        }

        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    #[tool(description = "Report size, SHA-256, machine and linkage of a built binary. By default fails unless it is a static 32-bit ARM ELF.")]
    async fn inspect_artifact(&self, Parameters(args): Parameters<InspectArtifactArgs>) -> Result<CallToolResult, McpError> {
        let path = match args.path {
            Some(path) => PathBuf::from(path),
            None => self.config.release_artifact().await,
        };

        if !path.is_file() {
            return Err(McpError::invalid_params(
                format!("File not found: {}", path.display()),
                None,
            ));
        }

        let report = artifact::inspect(&path).map_err(|e| make_error(e.to_string()))?;
        if args.require_static {
            artifact::ensure_arm(&report).map_err(|e| make_error(e.to_string()))?;
            artifact::ensure_static(&report).map_err(|e| make_error(e.to_string()))?;
        }

        Ok(CallToolResult::success(vec![Content::text(report.summary())]))
    }

    // =========================================================================
    // ADB (3 tools)
    // =========================================================================

    #[tool(description = "List devices visible to adb and whether they are usable")]
    async fn adb_devices(&self, Parameters(_args): Parameters<AdbDevicesArgs>) -> Result<CallToolResult, McpError> {
        let devices = adb_client::adb_devices(&self.config.adb())
            .await
            .map_err(|e| make_error(e.to_string()))?;

        if devices.is_empty() {
            return Ok(CallToolResult::success(vec![Content::text(
                "No ADB devices attached".to_string()
            )]));
        }

        let mut lines = vec!["ADB devices:".to_string()];
        for device in &devices {
            lines.push(format!("  {}\t{}", device.serial, device.state));
        }
        Ok(CallToolResult::success(vec![Content::text(lines.join("\n"))]))
    }

    #[tool(description = "Push the binary to the device over ADB and mark it executable. Refuses anything but a static 32-bit ARM ELF unless allow_dynamic is set. Fails if no device is connected; never falls back to TFTP.")]
    async fn adb_push(&self, Parameters(args): Parameters<AdbPushArgs>) -> Result<CallToolResult, McpError> {
        let path = match args.path {
            Some(path) => PathBuf::from(path),
            None => self.config.release_artifact().await,
        };

        if !path.is_file() {
            return Err(McpError::invalid_params(
                format!("File not found: {}", path.display()),
                None,
            ));
        }

        if !args.allow_dynamic {
            artifact::check_deployable(&path).map_err(|e| make_error(e.to_string()))?;
        }

        let remote_dir = args.remote_dir.unwrap_or_else(|| self.config.remote_dir.clone());
        let adb = self.adb_for(args.serial);

        let output = adb_client::deploy_push(&adb, &path, &remote_dir)
            .await
            .map_err(|e| make_error(e.to_string()))?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "ADB push {} -> {}\n{}", path.display(), remote_dir, output
        ))]))
    }

    #[tool(description = "Run a shell command on the device via ADB")]
    async fn adb_shell(&self, Parameters(args): Parameters<AdbShellArgs>) -> Result<CallToolResult, McpError> {
        if args.command.trim().is_empty() {
            return Err(McpError::invalid_params(
                "Command cannot be empty".to_string(),
                None,
            ));
        }

        let adb = self.adb_for(args.serial);
        let result = adb_client::adb_shell(&adb, &args.command)
            .await
            .map_err(|e| make_error(e.to_string()))?;

        let mut message = format!(
            "ADB shell: {}\nExit code: {}\n",
            args.command, result.exit_code
        );
        if !result.stdout.is_empty() {
            message.push_str(&format!("\nOutput:\n{}", result.stdout));
        }
        if !result.stderr.is_empty() {
            message.push_str(&format!("\nErrors:\n{}", result.stderr));
        }

        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    // =========================================================================
    // TFTP (4 tools)
    // =========================================================================

    #[tool(description = "Start a read-only TFTP server for the device to pull the binary from. Returns server_id for tftp_status/tftp_stop. The server is unauthenticated until stopped.")]
    async fn tftp_start(&self, Parameters(args): Parameters<TftpStartArgs>) -> Result<CallToolResult, McpError> {
        let bind: SocketAddr = match args.bind {
            Some(addr) => addr.parse().map_err(|_| McpError::invalid_params(
                format!("Invalid bind address '{}'", addr),
                None,
            ))?,
            None => self.config.tftp_bind,
        };

        let root = match args.root {
            Some(root) => PathBuf::from(root),
            None => self
                .config
                .release_artifact()
                .await
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.config.project_dir.clone()),
        };

        if !root.is_dir() {
            return Err(McpError::invalid_params(
                format!("Directory not found: {}", root.display()),
                None,
            ));
        }

        let server = TftpServer::bind(ServerConfig::new(bind, &root))
            .await
            .map_err(|e| make_error(e.to_string()))?;
        let handle = server.spawn().map_err(|e| make_error(e.to_string()))?;

        let server_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let addr = handle.local_addr();
        info!("TFTP server {} registered on {}", server_id, addr);
        self.tftp_servers.write().await.insert(server_id.clone(), handle);

        Ok(CallToolResult::success(vec![Content::text(format!(
            "TFTP server started\n\
             Server ID: {}\n\
             Address: {}\n\
             Root: {}\n\
             On the device: tftp -g -r <file> <host-ip>{}",
            server_id,
            addr,
            root.display(),
            if addr.port() == tftp::DEFAULT_PORT { String::new() } else { format!(" {}", addr.port()) },
        ))]))
    }

    #[tool(description = "Stop a TFTP server started with tftp_start and release its port")]
    async fn tftp_stop(&self, Parameters(args): Parameters<TftpStopArgs>) -> Result<CallToolResult, McpError> {
        let handle = self.tftp_servers.write().await.remove(&args.server_id).ok_or_else(|| {
            McpError::invalid_params(
                format!("Server ID '{}' not found", args.server_id),
                None,
            )
        })?;

        let addr = handle.local_addr();
        let stats = handle.stop().await.map_err(|e| make_error(e.to_string()))?;
        info!("TFTP server {} on {} stopped", args.server_id, addr);

        Ok(CallToolResult::success(vec![Content::text(format!(
            "TFTP server '{}' stopped\n\
             Transfers: {} completed, {} failed\n\
             Bytes sent: {}",
            args.server_id, stats.completed, stats.failed, stats.bytes_sent
        ))]))
    }

    #[tool(description = "Check TFTP server status. If server_id is omitted, lists all servers.")]
    async fn tftp_status(&self, Parameters(args): Parameters<TftpStatusArgs>) -> Result<CallToolResult, McpError> {
        let servers = self.tftp_servers.read().await;

        if let Some(server_id) = &args.server_id {
            let handle = servers.get(server_id).ok_or_else(|| {
                McpError::invalid_params(
                    format!("Server ID '{}' not found", server_id),
                    None,
                )
            })?;
            return Ok(CallToolResult::success(vec![Content::text(describe_server(server_id, handle))]));
        }

        if servers.is_empty() {
            return Ok(CallToolResult::success(vec![Content::text(
                "No TFTP servers running".to_string()
            )]));
        }

        let mut lines = vec!["TFTP servers:".to_string()];
        for (id, handle) in servers.iter() {
            lines.push(format!(
                "  {}: {} serving {} (up {})",
                id,
                handle.local_addr(),
                handle.root().display(),
                format_uptime(handle.uptime().as_secs())
            ));
        }
        Ok(CallToolResult::success(vec![Content::text(lines.join("\n"))]))
    }

    #[tool(description = "Fetch a file from a TFTP server the way the device would, to verify a running server")]
    async fn tftp_fetch(&self, Parameters(args): Parameters<TftpFetchArgs>) -> Result<CallToolResult, McpError> {
        let server: SocketAddr = args.server.parse().map_err(|_| McpError::invalid_params(
            format!("Invalid server address '{}'", args.server),
            None,
        ))?;

        let opts = FetchOptions {
            blksize: args.blksize,
            ..FetchOptions::default()
        };
        let dest = PathBuf::from(&args.output);
        let outcome = tftp::fetch(server, &args.filename, &dest, &opts)
            .await
            .map_err(|e| make_error(e.to_string()))?;
        let sha256 = artifact::sha256_file(&dest).map_err(|e| make_error(e.to_string()))?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Fetched {} -> {}\n\
             Bytes: {}\n\
             Blocks: {} (blksize {})\n\
             SHA-256: {}",
            args.filename,
            dest.display(),
            outcome.bytes,
            outcome.blocks,
            outcome.blksize,
            sha256
        ))]))
    }

    // =========================================================================
    // Launch and control (2 tools)
    // =========================================================================

    #[tool(description = "Start the deployed binary on the device. Without a host:port target the device uses its TARGET_IP, else 127.0.0.1:80.")]
    async fn launch(&self, Parameters(args): Parameters<LaunchArgs>) -> Result<CallToolResult, McpError> {
        let target = args
            .target
            .as_deref()
            .map(PingTarget::parse)
            .transpose()
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        let opts = LaunchOptions {
            remote_path: args.remote_path.unwrap_or_else(|| self.config.remote_binary()),
            target,
            background: args.background,
            prod: args.prod,
        };
        let adb = self.adb_for(args.serial);

        let result = launch::launch(&adb, &opts)
            .await
            .map_err(|e| make_error(e.to_string()))?;

        let mut message = format!(
            "Launched: {}\nExit code: {}\n",
            launch::launch_command(&opts),
            result.exit_code
        );
        if !result.stdout.is_empty() {
            message.push_str(&format!("\nOutput:\n{}", result.stdout));
        }
        if !result.stderr.is_empty() {
            message.push_str(&format!("\nErrors:\n{}", result.stderr));
        }

        Ok(CallToolResult::success(vec![Content::text(message)]))
    }

    #[tool(description = "Send ping, restart-adbd, kill-adbd or restart-server to the running binary's UDP control port (default 1300) and wait for its OK")]
    async fn device_signal(&self, Parameters(args): Parameters<DeviceSignalArgs>) -> Result<CallToolResult, McpError> {
        let kind: DeviceSignal = args
            .signal
            .parse()
            .map_err(|e: signal::SignalError| McpError::invalid_params(e.to_string(), None))?;
        let addr = signal::resolve_device(&args.device)
            .await
            .map_err(|e| McpError::invalid_params(e.to_string(), None))?;

        let mut opts = SignalOptions::default();
        if let Some(ms) = args.timeout_ms {
            opts.timeout = Duration::from_millis(ms);
        }

        let rtt = signal::send_signal(addr, kind, &opts)
            .await
            .map_err(|e| make_error(e.to_string()))?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Signal {} acknowledged by {}\nRound trip: {:.1}ms",
            kind,
            addr,
            rtt.as_secs_f64() * 1000.0
        ))]))
    }
}

const TOOL_COUNT: usize = 12;

#[tool_handler]
impl ServerHandler for ZxicDeployToolHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(format!(
                "zxic-deploy MCP Server - static ARMv7/musl builds of zxic_ping and \
                 deployment to zxic routers over ADB push or TFTP pull. \
                 {} tools available: provision_toolchain, build, inspect_artifact, \
                 adb_devices, adb_push, adb_shell, tftp_start, tftp_stop, tftp_status, \
                 tftp_fetch, launch, device_signal.",
                TOOL_COUNT,
            )),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        info!("zxic-deploy MCP server initialized with {} tools", TOOL_COUNT);
        Ok(self.get_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::handler::server::tool::Parameters;

    /// Extract text from a CallToolResult's first content element
    fn extract_text(result: &CallToolResult) -> &str {
        result.content[0].as_text().expect("expected text content").text.as_str()
    }

    #[test]
    fn test_handler_construction() {
        let handler = ZxicDeployToolHandler::default();
        assert_eq!(handler.config.remote_dir, "/etc_rw");
        assert_eq!(handler.config.target.as_str(), "armv7-unknown-linux-musleabi");
        assert!(handler.config.adb_serial.is_none());
    }

    #[test]
    fn test_server_info() {
        let handler = ZxicDeployToolHandler::default();
        let info = handler.get_info();
        let instructions = info.instructions.unwrap();
        assert!(instructions.contains("12 tools"));
        assert!(instructions.contains("device_signal"));
        assert!(instructions.contains("tftp_start"));
        assert!(instructions.contains("adb_push"));
        assert!(instructions.contains("launch"));
    }

    #[test]
    fn test_make_error() {
        let err = make_error("test error message");
        assert!(err.to_string().contains("test error message"));
    }

    #[tokio::test]
    async fn test_build_unknown_profile() {
        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .build(Parameters(BuildArgs {
                project_dir: None,
                profile: "fast".to_string(),
                bin: None,
                check_reproducible: false,
            }))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Unknown profile"));
    }

    #[tokio::test]
    async fn test_build_missing_project() {
        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .build(Parameters(BuildArgs {
                project_dir: Some("/nonexistent/zxic".to_string()),
                profile: "release".to_string(),
                bin: None,
                check_reproducible: false,
            }))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("No Cargo.toml"));
    }

    #[tokio::test]
    async fn test_inspect_missing_file() {
        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .inspect_artifact(Parameters(InspectArtifactArgs {
                path: Some("/nonexistent/zxic_ping".to_string()),
                require_static: true,
            }))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[tokio::test]
    async fn test_inspect_not_elf() {
        let handler = ZxicDeployToolHandler::default();
        let tmpfile = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmpfile.path(), b"#!/bin/sh\necho hi\n").unwrap();

        let result = handler
            .inspect_artifact(Parameters(InspectArtifactArgs {
                path: Some(tmpfile.path().to_string_lossy().to_string()),
                require_static: false,
            }))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_adb_shell_empty_command() {
        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .adb_shell(Parameters(AdbShellArgs {
                command: "  ".to_string(),
                serial: None,
            }))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Command cannot be empty"));
    }

    #[tokio::test]
    async fn test_adb_push_missing_file() {
        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .adb_push(Parameters(AdbPushArgs {
                path: Some("/nonexistent/zxic_ping".to_string()),
                remote_dir: None,
                serial: None,
                allow_dynamic: false,
            }))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[tokio::test]
    async fn test_adb_push_refuses_dynamic_binary() {
        let config = Config {
            adb_program: PathBuf::from("/nonexistent/adb"),
            ..Config::default()
        };
        let handler = ZxicDeployToolHandler::new(config);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zxic_ping");
        std::fs::write(
            &path,
            artifact::elf32(goblin::elf::header::EM_ARM, Some("/lib/ld-musl-armhf.so.1")),
        )
        .unwrap();

        let err = handler
            .adb_push(Parameters(AdbPushArgs {
                path: Some(path.to_string_lossy().to_string()),
                remote_dir: None,
                serial: None,
                allow_dynamic: false,
            }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dynamically linked"));

        // With the check skipped the push reaches adb, which is missing here
        let err = handler
            .adb_push(Parameters(AdbPushArgs {
                path: Some(path.to_string_lossy().to_string()),
                remote_dir: None,
                serial: None,
                allow_dynamic: true,
            }))
            .await
            .unwrap_err();
        assert!(!err.to_string().contains("dynamically linked"));
    }

    #[tokio::test]
    async fn test_adb_push_refuses_wrong_machine() {
        let handler = ZxicDeployToolHandler::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zxic_ping");
        std::fs::write(&path, artifact::elf32(goblin::elf::header::EM_386, None)).unwrap();

        let err = handler
            .adb_push(Parameters(AdbPushArgs {
                path: Some(path.to_string_lossy().to_string()),
                remote_dir: None,
                serial: None,
                allow_dynamic: false,
            }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected 32-bit ARM"));
    }

    #[tokio::test]
    async fn test_launch_invalid_target() {
        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .launch(Parameters(LaunchArgs {
                target: Some("192.168.0.1".to_string()),
                background: true,
                prod: false,
                remote_path: None,
                serial: None,
            }))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Invalid target"));
    }

    #[tokio::test]
    async fn test_device_signal_unknown_signal() {
        let handler = ZxicDeployToolHandler::default();
        let err = handler
            .device_signal(Parameters(DeviceSignalArgs {
                device: "127.0.0.1".to_string(),
                signal: "reboot".to_string(),
                timeout_ms: None,
            }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown signal"));
    }

    #[tokio::test]
    async fn test_device_signal_acknowledged() {
        let device = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = device.local_addr().unwrap();
        let listener = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(b"OK", from).await.unwrap();
            buf[..len].to_vec()
        });

        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .device_signal(Parameters(DeviceSignalArgs {
                device: addr.to_string(),
                signal: "restart-adbd".to_string(),
                timeout_ms: Some(500),
            }))
            .await
            .unwrap();
        assert!(extract_text(&result).contains("Signal restart-adbd acknowledged"));
        assert_eq!(listener.await.unwrap(), b"RESTART_ADBD".to_vec());
    }

    #[tokio::test]
    async fn test_tftp_start_bad_bind() {
        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .tftp_start(Parameters(TftpStartArgs {
                root: Some("/tmp".to_string()),
                bind: Some("not-an-address".to_string()),
            }))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("Invalid bind address"));
    }

    #[tokio::test]
    async fn test_tftp_stop_not_found() {
        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .tftp_stop(Parameters(TftpStopArgs {
                server_id: "nonexistent".to_string(),
            }))
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_tftp_status_empty() {
        let handler = ZxicDeployToolHandler::default();
        let result = handler
            .tftp_status(Parameters(TftpStatusArgs { server_id: None }))
            .await
            .unwrap();
        assert_eq!(extract_text(&result), "No TFTP servers running");
    }

    #[tokio::test]
    async fn test_tftp_lifecycle() {
        let handler = ZxicDeployToolHandler::default();
        let root = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(root.path().join("zxic_ping"), &payload).unwrap();

        let started = handler
            .tftp_start(Parameters(TftpStartArgs {
                root: Some(root.path().to_string_lossy().to_string()),
                bind: Some("127.0.0.1:0".to_string()),
            }))
            .await
            .unwrap();
        let text = extract_text(&started);
        assert!(text.contains("TFTP server started"));

        let (server_id, addr) = {
            let servers = handler.tftp_servers.read().await;
            assert_eq!(servers.len(), 1);
            let (id, handle) = servers.iter().next().unwrap();
            (id.clone(), handle.local_addr())
        };
        assert!(text.contains(&server_id));

        let status = handler
            .tftp_status(Parameters(TftpStatusArgs { server_id: Some(server_id.clone()) }))
            .await
            .unwrap();
        assert!(extract_text(&status).contains("Running: true"));

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("zxic_ping");
        let fetched = handler
            .tftp_fetch(Parameters(TftpFetchArgs {
                server: addr.to_string(),
                filename: "zxic_ping".to_string(),
                output: dest.to_string_lossy().to_string(),
                blksize: None,
            }))
            .await
            .unwrap();
        assert!(extract_text(&fetched).contains("Bytes: 1300"));
        assert_eq!(std::fs::read(&dest).unwrap(), payload);

        let stopped = handler
            .tftp_stop(Parameters(TftpStopArgs { server_id: server_id.clone() }))
            .await
            .unwrap();
        assert!(extract_text(&stopped).contains("stopped"));
        assert!(handler.tftp_servers.read().await.is_empty());
    }
}
