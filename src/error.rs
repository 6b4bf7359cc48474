//! Error types for zxic-deploy

use thiserror::Error;

use crate::adb_client::AdbError;
use crate::artifact::ArtifactError;
use crate::builder::BuildError;
use crate::launch::LaunchError;
use crate::signal::SignalError;
use crate::tftp::TftpError;
use crate::toolchain::ToolchainError;

/// Top-level error for every pipeline step.
///
/// All variants are terminal for the current invocation; nothing retries
/// or falls back to another transfer mechanism.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Provisioning failed: {0}")]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Artifact check failed: {0}")]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Adb(#[from] AdbError),

    #[error("TFTP: {0}")]
    Tftp(#[from] TftpError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Device signal: {0}")]
    Signal(#[from] SignalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;
