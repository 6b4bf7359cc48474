//! Launching the deployed binary on the router
//!
//! zxic_ping takes an optional positional `host:port` reachability target
//! plus the `--background` (daemonize) and `--isprod` (quiet) switches.
//! Without a target the binary reads `TARGET_IP` from its environment and
//! falls back to [`DEFAULT_PING_TARGET`]. A given target is validated on the
//! host so a typo fails before touching the device.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use tracing::info;

use crate::adb_client::{self, Adb, AdbError};
use crate::process::ExecResult;

/// Target the device-side binary uses when neither an argument nor `TARGET_IP` is set
pub const DEFAULT_PING_TARGET: &str = "127.0.0.1:80";

/// `host:port` argument of the deployed binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingTarget {
    pub host: String,
    pub port: u16,
}

impl PingTarget {
    pub fn parse(s: &str) -> Result<Self, LaunchError> {
        s.parse()
    }
}

impl fmt::Display for PingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

impl FromStr for PingTarget {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| LaunchError::InvalidTarget {
            target: s.to_string(),
            reason: reason.to_string(),
        };

        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:").ok_or_else(|| invalid("expected [v6-addr]:port"))?;
            host.parse::<Ipv6Addr>().map_err(|_| invalid("bad IPv6 address"))?;
            (host, port)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
            if host.contains(':') {
                return Err(invalid("IPv6 addresses must be bracketed"));
            }
            if !valid_hostname(host) {
                return Err(invalid("bad host"));
            }
            (host, port)
        };

        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
        if port == 0 {
            return Err(invalid("port must be 1-65535"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// How to start the binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub remote_path: String,
    /// `None` leaves the choice to the device
    pub target: Option<PingTarget>,
    pub background: bool,
    pub prod: bool,
}

/// Device-side command line
pub fn launch_command(opts: &LaunchOptions) -> String {
    let mut cmd = opts.remote_path.clone();
    if let Some(target) = &opts.target {
        cmd.push_str(&format!(" {}", target));
    }
    if opts.background {
        cmd.push_str(" --background");
    }
    if opts.prod {
        cmd.push_str(" --isprod");
    }
    cmd
}

/// Start the deployed binary over `adb shell`
pub async fn launch(adb: &Adb, opts: &LaunchOptions) -> Result<ExecResult, LaunchError> {
    let command = launch_command(opts);
    info!("Launching on device: {}", command);
    Ok(adb_client::adb_shell(adb, &command).await?)
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error(transparent)]
    Adb(#[from] AdbError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_target() {
        let target = PingTarget::parse("192.168.0.1:80").unwrap();
        assert_eq!(target.host, "192.168.0.1");
        assert_eq!(target.port, 80);
        assert_eq!(target.to_string(), "192.168.0.1:80");
    }

    #[test]
    fn test_parse_hostname_target() {
        let target = PingTarget::parse("ping.example.net:443").unwrap();
        assert_eq!(target.host, "ping.example.net");
    }

    #[test]
    fn test_parse_ipv6_target() {
        let target = PingTarget::parse("[fe80::1]:8080").unwrap();
        assert_eq!(target.host, "fe80::1");
        assert_eq!(target.to_string(), "[fe80::1]:8080");
        assert!(PingTarget::parse("fe80::1:8080").is_err());
        assert!(PingTarget::parse("[nothex]:80").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_targets() {
        for bad in ["", "127.0.0.1", "127.0.0.1:", ":80", "host:0", "host:70000", "bad host:80", "-x.com:1"] {
            assert!(PingTarget::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_launch_command() {
        let mut opts = LaunchOptions {
            remote_path: "/etc_rw/zxic_ping".to_string(),
            target: Some(PingTarget::parse("127.0.0.1:80").unwrap()),
            background: false,
            prod: false,
        };
        assert_eq!(launch_command(&opts), "/etc_rw/zxic_ping 127.0.0.1:80");

        opts.background = true;
        opts.prod = true;
        assert_eq!(
            launch_command(&opts),
            "/etc_rw/zxic_ping 127.0.0.1:80 --background --isprod"
        );
    }

    #[test]
    fn test_launch_command_without_target() {
        let opts = LaunchOptions {
            remote_path: "/etc_rw/zxic_ping".to_string(),
            target: None,
            background: true,
            prod: false,
        };
        assert_eq!(launch_command(&opts), "/etc_rw/zxic_ping --background");
        assert!(PingTarget::parse(DEFAULT_PING_TARGET).is_ok());
    }
}
