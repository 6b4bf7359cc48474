//! Toolchain provisioner
//!
//! Resolves the pinned Rust toolchain, makes sure the cross target is
//! installed, locates a musl cross-linker and assembles the isolated build
//! environment (linker variable keyed by triple, UTF-8 C locale, CA bundle).

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::process;

/// Triple the router firmware runs on
pub const DEFAULT_TARGET: &str = "armv7-unknown-linux-musleabi";

/// Locale forced on every child process so tool output is stable
pub const UTF8_LOCALE: &str = "C.UTF-8";

/// Linker flags forcing a fully static musl binary
pub const STATIC_RUSTFLAGS: &str = "-C target-feature=+crt-static";

/// Well-known CA bundle locations, checked in order
const CERT_BUNDLE_CANDIDATES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/cert.pem",
    "/etc/ssl/ca-bundle.pem",
];

// =========================================================================
// Target triple
// =========================================================================

/// A validated `arch-vendor-os[-abi]` target triple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetTriple(String);

impl TargetTriple {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cargo's per-target linker variable, e.g.
    /// `CARGO_TARGET_ARMV7_UNKNOWN_LINUX_MUSLEABI_LINKER`
    pub fn linker_env_var(&self) -> String {
        format!(
            "CARGO_TARGET_{}_LINKER",
            self.0.to_ascii_uppercase().replace(['-', '.'], "_")
        )
    }

    /// cc-rs compiler variable, e.g. `CC_armv7_unknown_linux_musleabi`
    pub fn cc_env_var(&self) -> String {
        format!("CC_{}", self.0.replace(['-', '.'], "_"))
    }

    /// gcc names a cross toolchain for this triple is commonly installed as
    pub fn linker_candidates(&self) -> Vec<String> {
        let mut parts = self.0.splitn(2, '-');
        let arch = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();
        // rest = "unknown-linux-musleabi"
        let os_abi = rest.strip_prefix("unknown-").unwrap_or(rest);

        let mut names = vec![format!("{}-gcc", self.0)];
        if arch == "armv7" {
            names.push(format!("armv7l-unknown-{}-gcc", os_abi));
            names.push(format!("armv7l-{}-gcc", os_abi));
            names.push(format!("arm-{}-gcc", os_abi));
            names.push(format!("arm-unknown-{}-gcc", os_abi));
        } else {
            names.push(format!("{}-{}-gcc", arch, os_abi));
        }
        names.dedup();
        names
    }

    pub fn is_musl(&self) -> bool {
        self.0.contains("musl")
    }
}

impl Default for TargetTriple {
    fn default() -> Self {
        Self(DEFAULT_TARGET.to_string())
    }
}

impl fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TargetTriple {
    type Err = ToolchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parts: Vec<&str> = s.split('-').collect();
        let valid_chars = s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) || !valid_chars {
            return Err(ToolchainError::InvalidTarget(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

// =========================================================================
// Inputs and provisioned environment
// =========================================================================

/// Inputs to provisioning
#[derive(Debug, Clone, Default)]
pub struct ToolchainSpec {
    /// Pinned channel; falls back to the project's rust-toolchain file
    pub channel: Option<String>,
    pub target: TargetTriple,
    /// Explicit cross-linker; otherwise searched on PATH
    pub linker: Option<PathBuf>,
    pub cert_bundle: Option<PathBuf>,
    /// Run `rustup target add` when the target std is missing
    pub install_target: bool,
}

/// The isolated environment handed to the builder
#[derive(Debug, Clone, PartialEq)]
pub struct ToolchainEnv {
    pub channel: String,
    pub target: TargetTriple,
    pub linker: PathBuf,
    pub cert_bundle: Option<PathBuf>,
    pub vars: BTreeMap<String, String>,
}

impl ToolchainEnv {
    pub fn new(
        channel: impl Into<String>,
        target: TargetTriple,
        linker: PathBuf,
        cert_bundle: Option<PathBuf>,
    ) -> Self {
        let mut vars = BTreeMap::new();
        let linker_str = linker.display().to_string();
        vars.insert(target.linker_env_var(), linker_str.clone());
        vars.insert(target.cc_env_var(), linker_str);
        vars.insert("LANG".to_string(), UTF8_LOCALE.to_string());
        vars.insert("LC_ALL".to_string(), UTF8_LOCALE.to_string());
        if target.is_musl() {
            vars.insert("RUSTFLAGS".to_string(), STATIC_RUSTFLAGS.to_string());
        }
        if let Some(bundle) = &cert_bundle {
            let bundle = bundle.display().to_string();
            vars.insert("SSL_CERT_FILE".to_string(), bundle.clone());
            vars.insert("NIX_SSL_CERT_FILE".to_string(), bundle);
        }

        Self {
            channel: channel.into(),
            target,
            linker,
            cert_bundle,
            vars,
        }
    }

    /// Export the environment onto a child command
    pub fn apply(&self, cmd: &mut tokio::process::Command) {
        cmd.envs(&self.vars);
    }

    /// `KEY=value` lines, in a form a shell can `export`
    pub fn to_shell_exports(&self) -> String {
        self.vars
            .iter()
            .map(|(k, v)| format!("export {}='{}'", k, v.replace('\'', r"'\''")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// =========================================================================
// Channel resolution
// =========================================================================

#[derive(Debug, Deserialize)]
struct ToolchainFile {
    toolchain: ToolchainSection,
}

#[derive(Debug, Deserialize)]
struct ToolchainSection {
    channel: Option<String>,
}

/// Pull the channel out of a `rust-toolchain.toml` or legacy `rust-toolchain` file
pub fn parse_toolchain_file(contents: &str) -> Result<String, String> {
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err("file is empty".to_string());
    }

    // Legacy format: a bare channel name on one line
    if !trimmed.contains('[') && !trimmed.contains('=') && trimmed.lines().count() == 1 {
        return Ok(trimmed.to_string());
    }

    let parsed: ToolchainFile = toml::from_str(contents).map_err(|e| e.to_string())?;
    parsed
        .toolchain
        .channel
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "[toolchain] has no channel".to_string())
}

/// Resolve the pinned channel: explicit override, then the project's toolchain file
pub fn resolve_channel(project_dir: &Path, explicit: Option<&str>) -> Result<String, ToolchainError> {
    if let Some(channel) = explicit.map(str::trim).filter(|c| !c.is_empty()) {
        return Ok(channel.to_string());
    }

    for name in ["rust-toolchain.toml", "rust-toolchain"] {
        let path = project_dir.join(name);
        if !path.is_file() {
            continue;
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| ToolchainError::InvalidToolchainFile {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let channel = parse_toolchain_file(&contents)
            .map_err(|reason| ToolchainError::InvalidToolchainFile { path: path.clone(), reason })?;
        debug!("Pinned channel {} from {}", channel, path.display());
        return Ok(channel);
    }

    Err(ToolchainError::Unpinned(project_dir.to_path_buf()))
}

// =========================================================================
// Linker and CA bundle discovery
// =========================================================================

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Locate the cross-linker: an explicit path, or the first candidate on `path_var`
pub fn find_linker(
    target: &TargetTriple,
    explicit: Option<&Path>,
    path_var: Option<&OsStr>,
) -> Result<PathBuf, ToolchainError> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ToolchainError::LinkerNotFound {
                target: target.to_string(),
                searched: vec![path.display().to_string()],
            });
        }
        if !is_executable(path) {
            return Err(ToolchainError::LinkerNotExecutable(path.to_path_buf()));
        }
        return Ok(path.to_path_buf());
    }

    let candidates = target.linker_candidates();
    if let Some(path_var) = path_var {
        for dir in std::env::split_paths(path_var) {
            for name in &candidates {
                let candidate = dir.join(name);
                if is_executable(&candidate) {
                    debug!("Found linker {}", candidate.display());
                    return Ok(candidate);
                }
            }
        }
    }

    Err(ToolchainError::LinkerNotFound {
        target: target.to_string(),
        searched: candidates,
    })
}

/// Locate a CA bundle for network access during provisioning.
///
/// An explicit bundle must exist. Without one, `SSL_CERT_FILE` and the
/// well-known locations are tried and `None` means nothing was found.
pub fn find_cert_bundle(explicit: Option<&Path>) -> Result<Option<PathBuf>, ToolchainError> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(ToolchainError::CertBundleNotFound(path.to_path_buf()));
        }
        return Ok(Some(path.to_path_buf()));
    }

    if let Some(env_path) = std::env::var_os("SSL_CERT_FILE").map(PathBuf::from) {
        if env_path.is_file() {
            return Ok(Some(env_path));
        }
        debug!("SSL_CERT_FILE {} is not a file, ignoring", env_path.display());
    }

    Ok(CERT_BUNDLE_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file()))
}

// =========================================================================
// rustup checks
// =========================================================================

/// Confirm the pinned toolchain is installed; returns `rustc --version`
pub async fn verify_toolchain(channel: &str) -> Result<String, ToolchainError> {
    let result = process::run("rustup", ["run", channel, "rustc", "--version"])
        .await
        .map_err(|e| ToolchainError::RustupUnavailable(e.to_string()))?;

    if result.success {
        Ok(result.stdout.trim().to_string())
    } else {
        Err(ToolchainError::UnresolvableToolchain {
            channel: channel.to_string(),
            reason: result.combined(),
        })
    }
}

/// Make sure the target's std is available for `channel`
pub async fn ensure_target(
    channel: &str,
    target: &TargetTriple,
    install: bool,
) -> Result<(), ToolchainError> {
    let listed = process::run(
        "rustup",
        ["target", "list", "--installed", "--toolchain", channel],
    )
    .await
    .map_err(|e| ToolchainError::RustupUnavailable(e.to_string()))?;

    if !listed.success {
        return Err(ToolchainError::UnresolvableToolchain {
            channel: channel.to_string(),
            reason: listed.combined(),
        });
    }

    if listed.stdout.lines().any(|l| l.trim() == target.as_str()) {
        return Ok(());
    }

    if !install {
        return Err(ToolchainError::TargetMissing {
            channel: channel.to_string(),
            target: target.to_string(),
        });
    }

    info!("Installing target {} for toolchain {}", target, channel);
    let added = process::run(
        "rustup",
        ["target", "add", "--toolchain", channel, target.as_str()],
    )
    .await
    .map_err(|e| ToolchainError::RustupUnavailable(e.to_string()))?;

    if added.success {
        Ok(())
    } else {
        Err(ToolchainError::TargetMissing {
            channel: channel.to_string(),
            target: format!("{} ({})", target, added.combined()),
        })
    }
}

/// Provision the build environment for `project_dir`.
///
/// Halts on the first failure; no partially provisioned environment is
/// ever returned.
pub async fn provision(spec: &ToolchainSpec, project_dir: &Path) -> Result<ToolchainEnv, ToolchainError> {
    let channel = resolve_channel(project_dir, spec.channel.as_deref())?;
    let version = verify_toolchain(&channel).await?;
    info!("Toolchain {}: {}", channel, version);

    ensure_target(&channel, &spec.target, spec.install_target).await?;

    let path_var = std::env::var_os("PATH");
    let linker = find_linker(&spec.target, spec.linker.as_deref(), path_var.as_deref())?;
    info!("Cross-linker for {}: {}", spec.target, linker.display());

    let cert_bundle = find_cert_bundle(spec.cert_bundle.as_deref())?;
    if cert_bundle.is_none() {
        warn!("No CA bundle found; SSL_CERT_FILE will not be set");
    }

    Ok(ToolchainEnv::new(channel, spec.target.clone(), linker, cert_bundle))
}

#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    #[error("No toolchain pinned: pass --toolchain or add rust-toolchain.toml to {0}")]
    Unpinned(PathBuf),

    #[error("Invalid toolchain file {path}: {reason}")]
    InvalidToolchainFile { path: PathBuf, reason: String },

    #[error("Toolchain '{channel}' cannot be resolved: {reason}")]
    UnresolvableToolchain { channel: String, reason: String },

    #[error("Target {target} is not installed for toolchain {channel}")]
    TargetMissing { channel: String, target: String },

    #[error("No cross-linker found for {target} (searched: {})", searched.join(", "))]
    LinkerNotFound { target: String, searched: Vec<String> },

    #[error("Linker is not an executable file: {0}")]
    LinkerNotExecutable(PathBuf),

    #[error("CA bundle not found: {0}")]
    CertBundleNotFound(PathBuf),

    #[error("Invalid target triple: '{0}'")]
    InvalidTarget(String),

    #[error("rustup unavailable: {0}")]
    RustupUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_target() {
        let target = TargetTriple::default();
        assert_eq!(target.as_str(), "armv7-unknown-linux-musleabi");
        assert!(target.is_musl());
    }

    #[test]
    fn test_linker_env_var() {
        let target = TargetTriple::default();
        assert_eq!(
            target.linker_env_var(),
            "CARGO_TARGET_ARMV7_UNKNOWN_LINUX_MUSLEABI_LINKER"
        );
        assert_eq!(target.cc_env_var(), "CC_armv7_unknown_linux_musleabi");
    }

    #[test]
    fn test_linker_candidates() {
        let candidates = TargetTriple::default().linker_candidates();
        assert_eq!(candidates[0], "armv7-unknown-linux-musleabi-gcc");
        assert!(candidates.contains(&"armv7l-unknown-linux-musleabi-gcc".to_string()));
        assert!(candidates.contains(&"arm-linux-musleabi-gcc".to_string()));
    }

    #[test]
    fn test_target_parsing() {
        assert!("armv7-unknown-linux-musleabi".parse::<TargetTriple>().is_ok());
        assert!("x86_64-unknown-linux-gnu".parse::<TargetTriple>().is_ok());
        assert!("armv7".parse::<TargetTriple>().is_err());
        assert!("arm--linux".parse::<TargetTriple>().is_err());
        assert!("arm-linux musl".parse::<TargetTriple>().is_err());
    }

    #[test]
    fn test_parse_toolchain_toml() {
        let contents = "[toolchain]\nchannel = \"1.82.0\"\ntargets = [\"armv7-unknown-linux-musleabi\"]\n";
        assert_eq!(parse_toolchain_file(contents).unwrap(), "1.82.0");
    }

    #[test]
    fn test_parse_legacy_toolchain_file() {
        assert_eq!(parse_toolchain_file("nightly-2024-05-01\n").unwrap(), "nightly-2024-05-01");
        assert!(parse_toolchain_file("   ").is_err());
        assert!(parse_toolchain_file("[toolchain]\nprofile = \"minimal\"\n").is_err());
    }

    #[test]
    fn test_resolve_channel_prefers_explicit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("rust-toolchain.toml"), "[toolchain]\nchannel = \"1.80.0\"\n").unwrap();
        assert_eq!(resolve_channel(dir.path(), Some("1.82.0")).unwrap(), "1.82.0");
        assert_eq!(resolve_channel(dir.path(), None).unwrap(), "1.80.0");
    }

    #[test]
    fn test_resolve_channel_unpinned() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_channel(dir.path(), None).unwrap_err();
        assert!(matches!(err, ToolchainError::Unpinned(_)));
        assert!(err.to_string().contains("rust-toolchain.toml"));
    }

    #[test]
    fn test_env_vars() {
        let env = ToolchainEnv::new(
            "1.82.0",
            TargetTriple::default(),
            PathBuf::from("/opt/cross/bin/armv7l-unknown-linux-musleabi-gcc"),
            Some(PathBuf::from("/etc/ssl/certs/ca-certificates.crt")),
        );
        assert_eq!(
            env.vars["CARGO_TARGET_ARMV7_UNKNOWN_LINUX_MUSLEABI_LINKER"],
            "/opt/cross/bin/armv7l-unknown-linux-musleabi-gcc"
        );
        assert_eq!(env.vars["LANG"], "C.UTF-8");
        assert_eq!(env.vars["LC_ALL"], "C.UTF-8");
        assert_eq!(env.vars["SSL_CERT_FILE"], "/etc/ssl/certs/ca-certificates.crt");
        assert_eq!(env.vars["RUSTFLAGS"], STATIC_RUSTFLAGS);
        assert!(env.to_shell_exports().contains("export LC_ALL='C.UTF-8'"));
    }

    #[test]
    fn test_env_without_cert_bundle() {
        let env = ToolchainEnv::new("stable", TargetTriple::default(), PathBuf::from("/bin/true"), None);
        assert!(!env.vars.contains_key("SSL_CERT_FILE"));
    }

    #[test]
    fn test_find_linker_explicit_missing() {
        let err = find_linker(
            &TargetTriple::default(),
            Some(Path::new("/nonexistent/arm-gcc")),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ToolchainError::LinkerNotFound { .. }));
    }

    #[test]
    fn test_find_linker_empty_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_linker(&TargetTriple::default(), None, Some(dir.path().as_os_str())).unwrap_err();
        assert!(err.to_string().contains("armv7-unknown-linux-musleabi-gcc"));
    }

    #[cfg(unix)]
    #[test]
    fn test_find_linker_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arm-linux-musleabi-gcc");
        std::fs::write(&path, "").unwrap();
        let err = find_linker(&TargetTriple::default(), Some(&path), None).unwrap_err();
        assert!(matches!(err, ToolchainError::LinkerNotExecutable(_)));
    }

    #[test]
    fn test_find_cert_bundle_explicit_missing() {
        let err = find_cert_bundle(Some(Path::new("/nonexistent/bundle.crt"))).unwrap_err();
        assert!(matches!(err, ToolchainError::CertBundleNotFound(_)));
        assert!(err.to_string().contains("/nonexistent/bundle.crt"));
    }

    #[test]
    fn test_find_cert_bundle_explicit_present() {
        let bundle = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            find_cert_bundle(Some(bundle.path())).unwrap(),
            Some(bundle.path().to_path_buf())
        );
    }
}
