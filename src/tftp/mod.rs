//! TFTP pull path: a read-only server rooted at the build output directory
//! and the matching read client.
//!
//! - [`protocol`]: packet codec, error codes, option negotiation (RFC 1350/2347/2348/2349)
//! - [`server`]: listener plus one task per transfer, each on its own TID
//! - [`client`]: RRQ client used to verify what a device would receive

pub mod client;
pub mod protocol;
pub mod server;

use std::net::SocketAddr;
use std::path::PathBuf;

pub use client::{fetch, fetch_bytes, FetchOptions, FetchOutcome};
pub use protocol::{ErrorCode, Packet, TransferMode, DEFAULT_PORT};
pub use server::{ServerConfig, StatsSnapshot, TftpHandle, TftpServer};

#[derive(Debug, thiserror::Error)]
pub enum TftpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Root is not a directory: {0}")]
    RootNotFound(PathBuf),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Server error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("Request for '{filename}' refused: {code}")]
    Refused { code: ErrorCode, filename: String },

    #[error("Request timed out after {retries} retransmissions")]
    Timeout { retries: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TftpError {
    /// True when the requested file does not exist on the server
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Remote { code: ErrorCode::FileNotFound, .. }
                | Self::Refused { code: ErrorCode::FileNotFound, .. }
        )
    }
}
