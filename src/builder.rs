//! Builder: release build of the project for the cross target
//!
//! Runs cargo inside the provisioned environment and locates the artifact at
//! `<target-dir>/<triple>/<profile>/<binary>`, where `<target-dir>` is what
//! `cargo metadata` reports (workspace root, `build.target-dir`, or
//! `CARGO_TARGET_DIR`). Compile and link errors are surfaced verbatim and
//! never retried.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::artifact;
use crate::process::ExecResult;
use crate::toolchain::{TargetTriple, ToolchainEnv};

/// Binary the router deployment expects
pub const DEFAULT_BINARY: &str = "zxic_ping";

/// Scratch target directory, under the output root, for the second build of a reproducibility check
pub const REPRODUCIBLE_CHECK_DIR: &str = "reproducible-check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Release,
    Debug,
}

impl Profile {
    /// Directory cargo writes this profile's output to
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// What to build
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub project_dir: PathBuf,
    /// Overrides `<project>/target` (also honoured from `CARGO_TARGET_DIR`)
    pub target_dir: Option<PathBuf>,
    /// Defaults to the name found in the project's Cargo.toml
    pub binary_name: Option<String>,
    pub profile: Profile,
}

impl BuildRequest {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            target_dir: None,
            binary_name: None,
            profile: Profile::Release,
        }
    }

    /// Explicit target dir or `<project>/target`, without asking cargo
    pub fn output_root(&self) -> PathBuf {
        self.target_dir
            .clone()
            .unwrap_or_else(|| self.project_dir.join("target"))
    }
}

/// Result of a successful build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub artifact: PathBuf,
    pub sha256: String,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

/// `<output-root>/<target-triple>/<profile>/<binary-name>`
pub fn artifact_path(output_root: &Path, target: &TargetTriple, profile: Profile, binary: &str) -> PathBuf {
    output_root
        .join(target.as_str())
        .join(profile.dir_name())
        .join(binary)
}

#[derive(Debug, Deserialize)]
struct CargoManifest {
    package: Option<ManifestPackage>,
    #[serde(default)]
    bin: Vec<ManifestBin>,
}

#[derive(Debug, Deserialize)]
struct ManifestPackage {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ManifestBin {
    name: Option<String>,
}

/// Binary name from a Cargo.toml: first `[[bin]] name`, else `[package] name`
pub fn binary_name_from_manifest(contents: &str) -> Result<String, BuildError> {
    let manifest: CargoManifest = toml::from_str(contents)
        .map_err(|e| BuildError::InvalidManifest(e.to_string()))?;

    manifest
        .bin
        .into_iter()
        .find_map(|b| b.name)
        .or_else(|| manifest.package.map(|p| p.name))
        .ok_or_else(|| BuildError::InvalidManifest("no [package] or [[bin]] name".to_string()))
}

/// Read the binary name from `<project_dir>/Cargo.toml`
pub fn binary_name(project_dir: &Path) -> Result<String, BuildError> {
    let manifest = project_dir.join("Cargo.toml");
    let contents = std::fs::read_to_string(&manifest)
        .map_err(|_| BuildError::ProjectNotFound(project_dir.to_path_buf()))?;
    binary_name_from_manifest(&contents)
}

#[derive(Debug, Deserialize)]
struct CargoMetadata {
    target_directory: PathBuf,
}

/// `target_directory` from `cargo metadata --format-version 1` output
pub fn target_directory_from_metadata(json: &str) -> Result<PathBuf, BuildError> {
    serde_json::from_str::<CargoMetadata>(json)
        .map(|m| m.target_directory)
        .map_err(|e| BuildError::Metadata(e.to_string()))
}

/// Ask cargo where `project_dir` puts its build output
pub async fn target_directory(cargo: &Path, channel: Option<&str>, project_dir: &Path) -> Result<PathBuf, BuildError> {
    let mut cmd = Command::new(cargo);
    if let Some(channel) = channel {
        cmd.arg(format!("+{}", channel));
    }
    cmd.args(["metadata", "--format-version", "1", "--no-deps"])
        .current_dir(project_dir);

    let output = cmd
        .output()
        .await
        .map_err(|e| BuildError::CargoUnavailable(format!("{}: {}", cargo.display(), e)))?;
    let result = ExecResult::from_output(&output);
    if !result.success {
        return Err(BuildError::Metadata(result.combined()));
    }

    let dir = target_directory_from_metadata(&result.stdout)?;
    debug!("cargo metadata: target directory {}", dir.display());
    Ok(dir)
}

/// Output root of `request`: the explicit target dir, else cargo's own answer
pub async fn resolve_output_root(
    cargo: &Path,
    channel: Option<&str>,
    request: &BuildRequest,
) -> Result<PathBuf, BuildError> {
    match &request.target_dir {
        Some(dir) => Ok(dir.clone()),
        None => target_directory(cargo, channel, &request.project_dir).await,
    }
}

/// Arguments passed to cargo for this request
pub fn cargo_args(env: &ToolchainEnv, request: &BuildRequest) -> Vec<String> {
    let mut args = vec![
        format!("+{}", env.channel),
        "build".to_string(),
        "--target".to_string(),
        env.target.to_string(),
    ];
    if request.profile == Profile::Release {
        args.push("--release".to_string());
    }
    if request.project_dir.join("Cargo.lock").is_file() {
        args.push("--locked".to_string());
    }
    if let Some(bin) = &request.binary_name {
        args.push("--bin".to_string());
        args.push(bin.clone());
    }
    args
}

/// Build the project in the provisioned environment
pub async fn build(env: &ToolchainEnv, request: &BuildRequest) -> Result<BuildOutput, BuildError> {
    build_with(Path::new("cargo"), env, request).await
}

/// Same as [`build`] with an explicit cargo executable
pub async fn build_with(cargo: &Path, env: &ToolchainEnv, request: &BuildRequest) -> Result<BuildOutput, BuildError> {
    if !request.project_dir.join("Cargo.toml").is_file() {
        return Err(BuildError::ProjectNotFound(request.project_dir.clone()));
    }

    let binary = match &request.binary_name {
        Some(name) => name.clone(),
        None => binary_name(&request.project_dir)?,
    };
    let args = cargo_args(env, request);

    info!("Building {} for {} ({})", binary, env.target, request.profile);

    let mut cmd = Command::new(cargo);
    cmd.args(&args).current_dir(&request.project_dir);
    env.apply(&mut cmd);
    if let Some(dir) = &request.target_dir {
        cmd.env("CARGO_TARGET_DIR", dir);
    }
    debug!("cargo {}", args.join(" "));

    let started = Instant::now();
    let output = cmd
        .output()
        .await
        .map_err(|e| BuildError::CargoUnavailable(format!("{}: {}", cargo.display(), e)))?;
    let result = ExecResult::from_output(&output);
    let duration = started.elapsed();

    if !result.success {
        return Err(BuildError::CompileFailed {
            exit_code: result.exit_code,
            stderr: result.stderr,
        });
    }

    let output_root = resolve_output_root(cargo, Some(&env.channel), request).await?;
    let artifact = artifact_path(&output_root, &env.target, request.profile, &binary);
    if !artifact.is_file() {
        return Err(BuildError::ArtifactMissing(artifact));
    }

    let sha256 = artifact::sha256_file(&artifact)?;

    info!("Built {} in {:.1}s (sha256 {})", artifact.display(), duration.as_secs_f64(), &sha256[..16]);

    Ok(BuildOutput {
        artifact,
        sha256,
        duration,
        stdout: result.stdout,
        stderr: result.stderr,
    })
}

/// Build, then rebuild from an empty target directory and require
/// byte-identical artifacts.
///
/// The second build goes to `<output-root>/reproducible-check` so cargo
/// cannot reuse anything from the first one. Returns the first build.
pub async fn check_reproducible(
    cargo: &Path,
    env: &ToolchainEnv,
    request: &BuildRequest,
) -> Result<BuildOutput, BuildError> {
    let first = build_with(cargo, env, request).await?;

    let scratch = resolve_output_root(cargo, Some(&env.channel), request)
        .await?
        .join(REPRODUCIBLE_CHECK_DIR);
    match tokio::fs::remove_dir_all(&scratch).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    info!("Rebuilding from scratch in {}", scratch.display());

    let rebuild = BuildRequest {
        target_dir: Some(scratch),
        ..request.clone()
    };
    let second = build_with(cargo, env, &rebuild).await?;

    if first.sha256 != second.sha256 {
        return Err(BuildError::NotReproducible {
            first: first.sha256,
            second: second.sha256,
        });
    }
    Ok(first)
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Project not found (no Cargo.toml): {0}")]
    ProjectNotFound(PathBuf),

    #[error("Invalid Cargo.toml: {0}")]
    InvalidManifest(String),

    #[error("Failed to run cargo: {0}")]
    CargoUnavailable(String),

    #[error("Build failed (exit code {exit_code}):\n{stderr}")]
    CompileFailed { exit_code: i32, stderr: String },

    #[error("cargo metadata failed: {0}")]
    Metadata(String),

    #[error("Build succeeded but artifact is missing: {0}")]
    ArtifactMissing(PathBuf),

    #[error("Build is not reproducible: {first} != {second}")]
    NotReproducible { first: String, second: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_env() -> ToolchainEnv {
        ToolchainEnv::new("1.82.0", TargetTriple::default(), PathBuf::from("/usr/bin/arm-linux-musleabi-gcc"), None)
    }

    #[test]
    fn test_artifact_path() {
        let path = artifact_path(Path::new("target"), &TargetTriple::default(), Profile::Release, "zxic_ping");
        assert_eq!(path, PathBuf::from("target/armv7-unknown-linux-musleabi/release/zxic_ping"));
    }

    #[test]
    fn test_output_root() {
        let mut request = BuildRequest::new("/src/zxic_ping");
        assert_eq!(request.output_root(), PathBuf::from("/src/zxic_ping/target"));
        request.target_dir = Some("/tmp/out".into());
        assert_eq!(request.output_root(), PathBuf::from("/tmp/out"));
    }

    #[test]
    fn test_binary_name_from_package() {
        let manifest = "[package]\nname = \"zxic_ping\"\nversion = \"0.1.0\"\n";
        assert_eq!(binary_name_from_manifest(manifest).unwrap(), "zxic_ping");
    }

    #[test]
    fn test_binary_name_prefers_bin_section() {
        let manifest = "[package]\nname = \"router-tools\"\n\n[[bin]]\nname = \"zxping\"\npath = \"src/main.rs\"\n";
        assert_eq!(binary_name_from_manifest(manifest).unwrap(), "zxping");
    }

    #[test]
    fn test_binary_name_workspace_manifest() {
        let manifest = "[workspace]\nmembers = [\"a\"]\n";
        assert!(matches!(
            binary_name_from_manifest(manifest),
            Err(BuildError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_cargo_args_release() {
        let dir = tempfile::tempdir().unwrap();
        let request = BuildRequest::new(dir.path());
        let args = cargo_args(&test_env(), &request);
        assert_eq!(args, vec!["+1.82.0", "build", "--target", "armv7-unknown-linux-musleabi", "--release"]);
    }

    #[test]
    fn test_cargo_args_locked_debug_bin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), "").unwrap();
        let request = BuildRequest {
            profile: Profile::Debug,
            binary_name: Some("zxic_ping".to_string()),
            ..BuildRequest::new(dir.path())
        };
        let args = cargo_args(&test_env(), &request);
        assert!(!args.contains(&"--release".to_string()));
        assert!(args.contains(&"--locked".to_string()));
        assert_eq!(&args[args.len() - 2..], &["--bin".to_string(), "zxic_ping".to_string()]);
    }

    #[test]
    fn test_target_directory_from_metadata() {
        let json = r#"{"packages":[],"workspace_members":[],"target_directory":"/work/ws/target","version":1,"workspace_root":"/work/ws"}"#;
        assert_eq!(
            target_directory_from_metadata(json).unwrap(),
            PathBuf::from("/work/ws/target")
        );
        assert!(matches!(
            target_directory_from_metadata("not json"),
            Err(BuildError::Metadata(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_output_root_prefers_explicit_dir() {
        let mut request = BuildRequest::new("/nonexistent/zxic");
        request.target_dir = Some("/tmp/out".into());
        let root = resolve_output_root(Path::new("/nonexistent/cargo"), None, &request)
            .await
            .unwrap();
        assert_eq!(root, PathBuf::from("/tmp/out"));
    }

    #[tokio::test]
    async fn test_build_missing_project() {
        let dir = tempfile::tempdir().unwrap();
        let err = build(&test_env(), &BuildRequest::new(dir.path().join("nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::ProjectNotFound(_)));
    }
}
