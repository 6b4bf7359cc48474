//! Control signals for a running zxic_ping
//!
//! The deployed binary listens on UDP port 1300 for bare ASCII commands and
//! answers each recognised one with `OK`. Unknown payloads get no reply, so
//! from the host they look the same as a lost datagram.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Port the device-side listener binds
pub const SIGNAL_PORT: u16 = 1300;

pub const DEFAULT_SIGNAL_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SIGNAL_RETRIES: u32 = 2;

const REPLY_OK: &[u8] = b"OK";

/// Commands understood by the device listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSignal {
    Ping,
    RestartAdbd,
    KillAdbd,
    RestartServer,
}

impl DeviceSignal {
    pub const ALL: [DeviceSignal; 4] = [
        DeviceSignal::Ping,
        DeviceSignal::RestartAdbd,
        DeviceSignal::KillAdbd,
        DeviceSignal::RestartServer,
    ];

    /// Datagram payload
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Ping => b"PING",
            Self::RestartAdbd => b"RESTART_ADBD",
            Self::KillAdbd => b"KILL_ADBD",
            Self::RestartServer => b"RESTART_SERVER",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::RestartAdbd => "restart-adbd",
            Self::KillAdbd => "kill-adbd",
            Self::RestartServer => "restart-server",
        }
    }
}

impl fmt::Display for DeviceSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceSignal {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|signal| signal.name() == wanted)
            .ok_or_else(|| SignalError::UnknownSignal(s.to_string()))
    }
}

/// Reply timing for [`send_signal`]
#[derive(Debug, Clone, Copy)]
pub struct SignalOptions {
    /// Wait per attempt
    pub timeout: Duration,
    /// Extra sends after the first one goes unanswered
    pub max_retries: u32,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SIGNAL_TIMEOUT,
            max_retries: DEFAULT_SIGNAL_RETRIES,
        }
    }
}

/// Resolve `host`, `host:port`, `ip` or `[v6]:port`, defaulting the port to 1300
pub async fn resolve_device(device: &str) -> Result<SocketAddr, SignalError> {
    let device = device.trim();
    let invalid = |reason: &str| SignalError::InvalidDevice {
        device: device.to_string(),
        reason: reason.to_string(),
    };
    if device.is_empty() {
        return Err(invalid("empty address"));
    }

    if let Ok(addr) = device.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = device.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, SIGNAL_PORT));
    }

    let lookup = match device.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
            tokio::net::lookup_host((host, port)).await
        }
        None => tokio::net::lookup_host((device, SIGNAL_PORT)).await,
    };
    lookup
        .map_err(|e| invalid(&e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host did not resolve"))
}

/// Send `signal` to the listener at `device` and wait for its `OK`.
///
/// Returns the round-trip time of the answered attempt. Datagrams from any
/// other address are ignored.
pub async fn send_signal(
    device: SocketAddr,
    signal: DeviceSignal,
    opts: &SignalOptions,
) -> Result<Duration, SignalError> {
    let local = match device.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = UdpSocket::bind(local).await?;
    let mut buf = [0u8; 64];

    for attempt in 0..=opts.max_retries {
        if attempt > 0 {
            warn!("No reply from {} to {}, retrying ({}/{})", device, signal, attempt, opts.max_retries);
        }
        let started = Instant::now();
        socket.send_to(signal.as_bytes(), device).await?;
        debug!("Sent {} to {}", signal, device);

        let deadline = tokio::time::Instant::now() + opts.timeout;
        loop {
            let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => break,
            };
            if from != device {
                debug!("Ignoring datagram from {}", from);
                continue;
            }
            if &buf[..len] != REPLY_OK {
                return Err(SignalError::UnexpectedReply {
                    device,
                    reply: String::from_utf8_lossy(&buf[..len]).into_owned(),
                });
            }
            let rtt = started.elapsed();
            info!("{} acknowledged {} in {:?}", device, signal, rtt);
            return Ok(rtt);
        }
    }

    Err(SignalError::Timeout {
        device,
        retries: opts.max_retries,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("Unknown signal '{0}' (expected ping, restart-adbd, kill-adbd or restart-server)")]
    UnknownSignal(String),

    #[error("Invalid device address '{device}': {reason}")]
    InvalidDevice { device: String, reason: String },

    #[error("No reply from {device} after {retries} retransmissions")]
    Timeout { device: SocketAddr, retries: u32 },

    #[error("Unexpected reply from {device}: {reply:?}")]
    UnexpectedReply { device: SocketAddr, reply: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
