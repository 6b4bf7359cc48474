//! TFTP read client
//!
//! Plays the device side of a TFTP pull: what busybox `tftp -g -r <file>`
//! does on the router, used to verify a running server from the host.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::protocol::*;
use super::TftpError;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub mode: TransferMode,
    /// Request a block size other than 512 via RFC 2348
    pub blksize: Option<usize>,
    /// Ask the server for the transfer size
    pub request_tsize: bool,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            mode: TransferMode::Octet,
            blksize: None,
            request_tsize: true,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// What a finished transfer looked like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub bytes: u64,
    pub blocks: u64,
    pub blksize: usize,
    /// Size announced by the server in its OACK
    pub tsize: Option<u64>,
    /// The server's transfer ID (its ephemeral port)
    pub server_tid: SocketAddr,
}

fn local_bind_for(server: &SocketAddr) -> SocketAddr {
    match server.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn build_request(filename: &str, opts: &FetchOptions) -> Request {
    let mut request = Request::read(filename, opts.mode);
    if let Some(size) = opts.blksize {
        request = request.with_option("blksize", size);
    }
    if opts.request_tsize {
        request = request.with_option("tsize", 0);
    }
    request
}

/// Read `filename` from `server` into memory
pub async fn fetch_bytes(
    server: SocketAddr,
    filename: &str,
    opts: &FetchOptions,
) -> Result<(Vec<u8>, FetchOutcome), TftpError> {
    let socket = UdpSocket::bind(local_bind_for(&server)).await?;
    let request = Packet::Rrq(build_request(filename, opts)).encode();

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let mut received = Vec::new();
    let mut peer: Option<SocketAddr> = None;
    let mut blksize = DEFAULT_BLOCK_SIZE;
    let mut tsize = None;
    let mut expected: u16 = 1;
    let mut blocks = 0u64;

    // Retransmitted on timeout: the RRQ until the server answers, then our last ACK
    let mut last_sent = request;
    let mut last_dest = server;
    let mut retries = 0u32;

    socket.send_to(&last_sent, last_dest).await?;
    debug!("RRQ {} -> {}", filename, server);

    loop {
        let (len, from) = match tokio::time::timeout(opts.timeout, socket.recv_from(&mut buf)).await {
            Err(_) => {
                retries += 1;
                if retries > opts.max_retries {
                    return Err(TftpError::Timeout { retries: opts.max_retries });
                }
                debug!("Timeout waiting for block {}, resending", expected);
                socket.send_to(&last_sent, last_dest).await?;
                continue;
            }
            Ok(r) => r?,
        };

        if let Some(tid) = peer {
            if from != tid {
                let err = Packet::error(ErrorCode::UnknownTid).encode();
                let _ = socket.send_to(&err, from).await;
                continue;
            }
        }

        match Packet::decode(&buf[..len]).map_err(|e| TftpError::Malformed(e.0))? {
            Packet::Oack { options } if peer.is_none() => {
                peer = Some(from);
                for (name, value) in &options {
                    match name.as_str() {
                        "blksize" => {
                            blksize = value
                                .parse::<usize>()
                                .ok()
                                .filter(|s| (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(s))
                                .ok_or_else(|| TftpError::Protocol(format!("bad blksize '{}'", value)))?;
                        }
                        "tsize" => tsize = value.parse().ok(),
                        _ => {}
                    }
                }
                last_sent = Packet::Ack { block: 0 }.encode();
                last_dest = from;
                retries = 0;
                socket.send_to(&last_sent, last_dest).await?;
            }
            Packet::Oack { .. } if peer == Some(from) && blocks == 0 => {
                // Server missed our ACK 0
                socket.send_to(&last_sent, last_dest).await?;
            }
            Packet::Data { block, data } if block == expected => {
                peer.get_or_insert(from);
                received.extend_from_slice(&data);
                blocks += 1;

                last_sent = Packet::Ack { block }.encode();
                last_dest = from;
                retries = 0;
                socket.send_to(&last_sent, last_dest).await?;

                if data.len() < blksize {
                    break;
                }
                expected = expected.wrapping_add(1);
            }
            Packet::Data { block, .. } if block == expected.wrapping_sub(1) && peer.is_some() => {
                // Our ACK was lost; repeat it
                socket.send_to(&last_sent, last_dest).await?;
            }
            Packet::Error { code, message } => {
                return Err(TftpError::Remote { code, message });
            }
            other => {
                let err = Packet::error(ErrorCode::IllegalOperation).encode();
                let _ = socket.send_to(&err, from).await;
                return Err(TftpError::Protocol(format!(
                    "unexpected {:?} while waiting for block {}",
                    other.opcode(),
                    expected
                )));
            }
        }
    }

    if opts.mode == TransferMode::Netascii {
        received = netascii_decode(&received);
    }

    let outcome = FetchOutcome {
        bytes: received.len() as u64,
        blocks,
        blksize,
        tsize,
        server_tid: peer.unwrap_or(server),
    };
    Ok((received, outcome))
}

/// Read `filename` from `server` and write it to `dest`.
///
/// `dest` is only created once the whole file has arrived.
pub async fn fetch(
    server: SocketAddr,
    filename: &str,
    dest: &Path,
    opts: &FetchOptions,
) -> Result<FetchOutcome, TftpError> {
    let (bytes, outcome) = fetch_bytes(server, filename, opts).await?;
    tokio::fs::write(dest, &bytes).await?;
    info!(
        "Fetched {} from {} -> {} ({} bytes, {} blocks)",
        filename,
        server,
        dest.display(),
        outcome.bytes,
        outcome.blocks
    );
    Ok(outcome)
}
