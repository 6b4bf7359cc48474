//! zxic-deploy: main entry point

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing::{info, error, debug};
use tracing_subscriber::{EnvFilter, fmt};
use rmcp::{ServiceExt, transport::stdio};

use zxic_deploy::adb_client;
use zxic_deploy::artifact;
use zxic_deploy::builder::{self, Profile};
use zxic_deploy::launch::{self, LaunchOptions, PingTarget};
use zxic_deploy::signal::{self, DeviceSignal, SignalOptions};
use zxic_deploy::tftp::{self, FetchOptions, ServerConfig, TftpServer};
use zxic_deploy::toolchain;
use zxic_deploy::{Args, Command, Config, Error, ZxicDeployToolHandler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = Config::from_args(&args);
    let command = args.command.unwrap_or(Command::Mcp);

    if command == Command::Mcp {
        info!("Starting zxic-deploy MCP Server v{}", env!("CARGO_PKG_VERSION"));

        let service = ZxicDeployToolHandler::new(config)
            .serve(stdio()).await.inspect_err(|e| {
                error!("Serving error: {:?}", e);
            })?;

        service.waiting().await?;
        return Ok(());
    }

    if let Err(e) = run(command, &config).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: Command, config: &Config) -> zxic_deploy::Result<()> {
    match command {
        Command::Provision { install_target, exports } => {
            let env = toolchain::provision(&config.toolchain_spec(install_target), &config.project_dir).await?;
            if exports {
                println!("{}", env.to_shell_exports());
            } else {
                println!("Channel: {}", env.channel);
                println!("Target: {}", env.target);
                println!("Linker: {}", env.linker.display());
                match &env.cert_bundle {
                    Some(bundle) => println!("CA bundle: {}", bundle.display()),
                    None => println!("CA bundle: none"),
                }
            }
        }

        Command::Build { debug, bin, check_reproducible } => {
            let env = toolchain::provision(&config.toolchain_spec(false), &config.project_dir).await?;
            let profile = if debug { Profile::Debug } else { Profile::Release };
            let request = config.build_request(profile, bin);

            let output = if check_reproducible {
                builder::check_reproducible(Path::new("cargo"), &env, &request).await?
            } else {
                builder::build(&env, &request).await?
            };

            let report = artifact::inspect(&output.artifact)?;
            artifact::ensure_static(&report)?;
            println!("{}", report.summary());
            println!("Built in {:.1}s", output.duration.as_secs_f64());
        }

        Command::Inspect { path, json } => {
            let path = match path {
                Some(path) => path,
                None => config.release_artifact().await,
            };
            let report = artifact::inspect(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.summary());
            }
        }

        Command::Devices => {
            let devices = adb_client::adb_devices(&config.adb()).await?;
            if devices.is_empty() {
                println!("No ADB devices attached");
            }
            for device in devices {
                println!("{}\t{}", device.serial, device.state);
            }
        }

        Command::Push { path, allow_dynamic } => {
            let path = match path {
                Some(path) => path,
                None => config.release_artifact().await,
            };
            if !allow_dynamic {
                artifact::check_deployable(&path)?;
            }
            let transcript = adb_client::deploy_push(&config.adb(), &path, &config.remote_dir).await?;
            println!("{}", transcript);
        }

        Command::ServeTftp { root } => {
            let root = match root {
                Some(root) => root,
                None => config
                    .release_artifact()
                    .await
                    .parent()
                    .map(Path::to_path_buf)
                    .ok_or_else(|| Error::InvalidConfig("no artifact directory to serve".to_string()))?,
            };

            let server = TftpServer::bind(ServerConfig::new(config.tftp_bind, &root)).await?;
            let addr = server.local_addr()?;
            let stats = server.stats();
            println!("Serving {} on {} (Ctrl-C to stop)", server.root().display(), addr);
            println!("On the device: tftp -g -r {} <host-ip>", config.binary_name());

            server
                .serve(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;

            let stats = stats.snapshot();
            println!(
                "Stopped: {} requests, {} completed, {} failed, {} bytes sent",
                stats.requests, stats.completed, stats.failed, stats.bytes_sent
            );
        }

        Command::Fetch { server, filename, output, blksize } => {
            let dest = output.unwrap_or_else(|| {
                Path::new(&filename)
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("tftp.out"))
            });
            let opts = FetchOptions {
                blksize,
                ..FetchOptions::default()
            };
            let outcome = tftp::fetch(server, &filename, &dest, &opts).await?;
            println!(
                "{} -> {} ({} bytes, {} blocks, sha256 {})",
                filename,
                dest.display(),
                outcome.bytes,
                outcome.blocks,
                artifact::sha256_file(&dest)?
            );
        }

        Command::Launch { target, background, prod, remote_path } => {
            let opts = LaunchOptions {
                remote_path: remote_path.unwrap_or_else(|| config.remote_binary()),
                target: target.as_deref().map(PingTarget::parse).transpose()?,
                background,
                prod,
            };
            let result = launch::launch(&config.adb(), &opts).await?;
            let transcript = result.combined();
            if !transcript.is_empty() {
                println!("{}", transcript);
            }
            if !result.success {
                return Err(Error::Adb(adb_client::AdbError::CommandFailed(format!(
                    "{} exited with {}",
                    launch::launch_command(&opts),
                    result.exit_code
                ))));
            }
        }

        Command::Signal { device, signal, timeout_ms } => {
            let kind: DeviceSignal = signal.parse()?;
            let addr = signal::resolve_device(&device).await?;
            let opts = SignalOptions {
                timeout: Duration::from_millis(timeout_ms),
                ..SignalOptions::default()
            };
            let rtt = signal::send_signal(addr, kind, &opts).await?;
            println!("{} acknowledged {} in {:.1}ms", addr, kind, rtt.as_secs_f64() * 1000.0);
        }

        Command::Mcp => {
            return Err(Error::InvalidConfig("mcp runs as a server, not a one-shot command".to_string()));
        }
    }
    Ok(())
}

fn init_logging(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false);

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    debug!("Logging initialized with level: {}", args.log_level);
    Ok(())
}
