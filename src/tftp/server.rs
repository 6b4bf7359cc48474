//! Read-only TFTP server rooted at the build output directory
//!
//! Every read request is served from a fresh ephemeral socket (its own TID)
//! in a task owned by the server; stopping the server aborts in-flight
//! transfers. Write requests are always refused.

use std::future::Future;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::*;
use super::TftpError;

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub root: PathBuf,
    /// Retransmission timeout when the client does not negotiate one
    pub timeout: Duration,
    pub max_retries: u32,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr, root: impl Into<PathBuf>) -> Self {
        Self {
            bind,
            root: root.into(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Counters shared between the listener and its transfers
#[derive(Debug, Default)]
pub struct ServerStats {
    pub requests: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_sent: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Resolve a requested filename inside `root`.
///
/// `root` must already be canonical. Absolute paths, `..` components and
/// symlinks leading outside the root are access violations. Anything that is
/// missing, is not a regular file, or runs through a non-directory component
/// is reported as not found.
pub fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf, ErrorCode> {
    if filename.is_empty() || filename.contains('\0') {
        return Err(ErrorCode::AccessViolation);
    }

    let normalized = filename.replace('\\', "/");
    let relative = Path::new(&normalized);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ErrorCode::AccessViolation);
            }
        }
    }

    let candidate = root.join(relative);
    let canonical = match candidate.canonicalize() {
        Ok(p) => p,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
            return Err(ErrorCode::FileNotFound);
        }
        Err(_) => return Err(ErrorCode::AccessViolation),
    };

    if !canonical.starts_with(root) {
        return Err(ErrorCode::AccessViolation);
    }
    if !canonical.is_file() {
        return Err(ErrorCode::FileNotFound);
    }
    Ok(canonical)
}

fn unspecified_like(addr: &SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => SocketAddr::new(IpAddr::V4(ip), 0),
        IpAddr::V6(ip) if !ip.is_unspecified() => SocketAddr::new(IpAddr::V6(ip), 0),
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Shared state every transfer task needs
#[derive(Debug)]
struct Shared {
    root: PathBuf,
    transfer_bind: SocketAddr,
    timeout: Duration,
    max_retries: u32,
    stats: Arc<ServerStats>,
}

/// A bound, not yet running server
pub struct TftpServer {
    socket: UdpSocket,
    shared: Arc<Shared>,
}

impl TftpServer {
    /// Bind the listening socket. The port is held exclusively from here on.
    pub async fn bind(config: ServerConfig) -> Result<Self, TftpError> {
        let root = config
            .root
            .canonicalize()
            .map_err(|_| TftpError::RootNotFound(config.root.clone()))?;
        if !root.is_dir() {
            return Err(TftpError::RootNotFound(config.root));
        }

        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|source| TftpError::Bind { addr: config.bind, source })?;

        Ok(Self {
            socket,
            shared: Arc::new(Shared {
                root,
                transfer_bind: unspecified_like(&config.bind),
                timeout: config.timeout,
                max_retries: config.max_retries,
                stats: Arc::new(ServerStats::default()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TftpError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.shared.stats.clone()
    }

    /// Serve until `shutdown` resolves; transfers still running are aborted
    pub async fn serve<F>(self, shutdown: F) -> Result<(), TftpError>
    where
        F: Future<Output = ()>,
    {
        let addr = self.local_addr()?;
        warn!(
            "TFTP server on {} exposes {} read-only to any client until stopped",
            addr,
            self.shared.root.display()
        );

        tokio::pin!(shutdown);
        let mut transfers = JoinSet::new();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("TFTP server on {} stopping ({} transfers aborted)", addr, transfers.len());
                    transfers.abort_all();
                    return Ok(());
                }
                Some(_) = transfers.join_next(), if !transfers.is_empty() => {}
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP port unreachable from an earlier send surfaces here on some stacks
                            debug!("recv_from failed: {}", e);
                            continue;
                        }
                    };
                    self.dispatch(&buf[..len], peer, &mut transfers).await;
                }
            }
        }
    }

    async fn dispatch(&self, datagram: &[u8], peer: SocketAddr, transfers: &mut JoinSet<()>) {
        let reply = match Packet::decode(datagram) {
            Ok(Packet::Rrq(request)) => {
                self.shared.stats.requests.fetch_add(1, Ordering::Relaxed);
                info!("RRQ {} ({}) from {}", request.filename, request.mode.as_str(), peer);
                let shared = self.shared.clone();
                transfers.spawn(async move {
                    match serve_read(&shared, peer, request).await {
                        Ok(sent) => {
                            shared.stats.completed.fetch_add(1, Ordering::Relaxed);
                            shared.stats.bytes_sent.fetch_add(sent, Ordering::Relaxed);
                        }
                        Err(e) => {
                            shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!("Transfer to {} failed: {}", peer, e);
                        }
                    }
                });
                return;
            }
            Ok(Packet::Wrq(request)) => {
                self.shared.stats.requests.fetch_add(1, Ordering::Relaxed);
                self.shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Refusing WRQ {} from {}", request.filename, peer);
                Packet::Error {
                    code: ErrorCode::AccessViolation,
                    message: "Server is read-only".to_string(),
                }
            }
            // Stray DATA/ACK/OACK/ERROR: an ERROR must never be answered, and
            // answering the rest invites loops with spoofed sources
            Ok(other) => {
                debug!("Dropping {:?} on listen port from {}", other.opcode(), peer);
                return;
            }
            Err(e) => {
                debug!("Bad datagram from {}: {}", peer, e);
                Packet::Error {
                    code: ErrorCode::IllegalOperation,
                    message: e.to_string(),
                }
            }
        };

        if let Err(e) = self.socket.send_to(&reply.encode(), peer).await {
            debug!("Failed to send error to {}: {}", peer, e);
        }
    }

    /// Run the server on a background task
    pub fn spawn(self) -> Result<TftpHandle, TftpError> {
        let local_addr = self.local_addr()?;
        let root = self.shared.root.clone();
        let stats = self.stats();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.serve(async move {
            let _ = rx.await;
        }));

        Ok(TftpHandle {
            local_addr,
            root,
            stats,
            started_at: std::time::Instant::now(),
            shutdown: Some(tx),
            task,
        })
    }
}

/// Control handle for a spawned server
pub struct TftpHandle {
    local_addr: SocketAddr,
    root: PathBuf,
    stats: Arc<ServerStats>,
    started_at: std::time::Instant,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), TftpError>>,
}

impl std::fmt::Debug for TftpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TftpHandle")
            .field("local_addr", &self.local_addr)
            .field("root", &self.root)
            .finish()
    }
}

impl TftpHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the server and release its port
    pub async fn stop(mut self) -> Result<StatsSnapshot, TftpError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match (&mut self.task).await {
            Ok(result) => result?,
            Err(e) if e.is_cancelled() => {}
            Err(e) => return Err(TftpError::Protocol(format!("server task panicked: {}", e))),
        }
        Ok(self.stats.snapshot())
    }
}

// =========================================================================
// Read transfer
// =========================================================================

async fn send_error(socket: &UdpSocket, peer: SocketAddr, packet: Packet) {
    if let Err(e) = socket.send_to(&packet.encode(), peer).await {
        debug!("Failed to send error to {}: {}", peer, e);
    }
}

/// Send `packet` and wait for `ACK block`, retransmitting on timeout
async fn send_until_acked(
    socket: &UdpSocket,
    peer: SocketAddr,
    packet: &[u8],
    block: u16,
    timeout: Duration,
    max_retries: u32,
) -> Result<(), TftpError> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];

    for attempt in 0..=max_retries {
        if attempt > 0 {
            debug!("Retransmitting block {} to {} (attempt {})", block, peer, attempt);
        }
        socket.send_to(packet, peer).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (len, from) = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(received) => received?,
            };
            if from != peer {
                send_error(socket, from, Packet::error(ErrorCode::UnknownTid)).await;
                continue;
            }
            match Packet::decode(&buf[..len]) {
                Ok(Packet::Ack { block: acked }) if acked == block => return Ok(()),
                // Duplicate ACK for an earlier block: never resend on it
                Ok(Packet::Ack { .. }) => continue,
                Ok(Packet::Error { code, message }) => {
                    return Err(TftpError::Remote { code, message });
                }
                Ok(other) => {
                    send_error(socket, peer, Packet::error(ErrorCode::IllegalOperation)).await;
                    return Err(TftpError::Protocol(format!("unexpected {:?} from client", other.opcode())));
                }
                Err(e) => {
                    send_error(socket, peer, Packet::error(ErrorCode::IllegalOperation)).await;
                    return Err(TftpError::Malformed(e.0));
                }
            }
        }
    }

    Err(TftpError::Timeout { retries: max_retries })
}

/// Serve one RRQ; returns the payload bytes sent
async fn serve_read(shared: &Shared, peer: SocketAddr, request: Request) -> Result<u64, TftpError> {
    let socket = UdpSocket::bind(shared.transfer_bind).await?;

    if request.mode == TransferMode::Mail {
        send_error(&socket, peer, Packet::error(ErrorCode::IllegalOperation)).await;
        return Err(TftpError::Protocol("mail mode is not supported".to_string()));
    }

    let path = match resolve_path(&shared.root, &request.filename) {
        Ok(path) => path,
        Err(code) => {
            info!("RRQ {} from {}: {}", request.filename, peer, code);
            send_error(&socket, peer, Packet::error(code)).await;
            return Err(TftpError::Refused {
                code,
                filename: request.filename,
            });
        }
    };

    let mut contents = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            send_error(&socket, peer, Packet::error(ErrorCode::AccessViolation)).await;
            return Err(TftpError::Io(e));
        }
    };
    if request.mode == TransferMode::Netascii {
        contents = netascii_encode(&contents);
    }

    let (options, acked) = negotiate(&request.options, contents.len() as u64, shared.timeout);
    debug!("Transfer {} -> {}: {:?}", path.display(), peer, options);

    if !acked.is_empty() {
        let oack = Packet::Oack { options: acked }.encode();
        send_until_acked(&socket, peer, &oack, 0, options.timeout, shared.max_retries).await?;
    }

    let mut block: u16 = 1;
    let mut offset = 0usize;
    loop {
        let end = (offset + options.blksize).min(contents.len());
        let chunk = &contents[offset..end];
        let packet = Packet::Data { block, data: chunk.to_vec() }.encode();
        send_until_acked(&socket, peer, &packet, block, options.timeout, shared.max_retries).await?;

        offset = end;
        if chunk.len() < options.blksize {
            break;
        }
        block = block.wrapping_add(1);
    }

    info!("Sent {} ({} bytes) to {}", path.display(), contents.len(), peer);
    Ok(contents.len() as u64)
}
