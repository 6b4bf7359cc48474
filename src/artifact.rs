//! Build artifact inspection
//!
//! Checksums and ELF checks on the produced binary: the router image has no
//! dynamic loader, so the artifact must carry no `PT_INTERP` and no
//! `DT_NEEDED` entries.

use std::fs::File;
use std::path::{Path, PathBuf};

use goblin::elf::{header, Elf};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// What we know about a built binary
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArtifactReport {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    /// e.g. "ARM"
    pub machine: String,
    pub machine_id: u16,
    pub is_64: bool,
    pub is_static: bool,
    pub interpreter: Option<String>,
    pub needed: Vec<String>,
}

impl ArtifactReport {
    pub fn summary(&self) -> String {
        let linkage = if self.is_static {
            "static".to_string()
        } else {
            let mut deps = Vec::new();
            if let Some(interp) = &self.interpreter {
                deps.push(format!("interpreter {}", interp));
            }
            if !self.needed.is_empty() {
                deps.push(format!("needs {}", self.needed.join(", ")));
            }
            format!("dynamic ({})", deps.join("; "))
        };

        format!(
            "Artifact: {}\n\
             Size: {} bytes\n\
             SHA-256: {}\n\
             Machine: {} ({}-bit)\n\
             Linkage: {}",
            self.path.display(),
            self.size,
            self.sha256,
            self.machine,
            if self.is_64 { 64 } else { 32 },
            linkage,
        )
    }
}

/// Lowercase hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Lowercase hex SHA-256 of an in-memory buffer
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Parse an ELF image already in memory
pub fn inspect_bytes(path: &Path, bytes: &[u8]) -> Result<ArtifactReport, ArtifactError> {
    if bytes.len() < ELF_MAGIC.len() || &bytes[..4] != ELF_MAGIC {
        return Err(ArtifactError::NotElf(path.to_path_buf()));
    }

    let elf = Elf::parse(bytes).map_err(|e| ArtifactError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let interpreter = elf.interpreter.map(str::to_string);
    let needed: Vec<String> = elf.libraries.iter().map(|s| s.to_string()).collect();
    debug!(
        "ELF {}: machine={} interp={:?} needed={:?}",
        path.display(),
        elf.header.e_machine,
        interpreter,
        needed
    );

    Ok(ArtifactReport {
        path: path.to_path_buf(),
        size: bytes.len() as u64,
        sha256: sha256_bytes(bytes),
        machine: header::machine_to_str(elf.header.e_machine).to_string(),
        machine_id: elf.header.e_machine,
        is_64: elf.is_64,
        is_static: interpreter.is_none() && needed.is_empty(),
        interpreter,
        needed,
    })
}

/// Read and inspect the artifact at `path`
pub fn inspect(path: &Path) -> Result<ArtifactReport, ArtifactError> {
    let bytes = std::fs::read(path).map_err(|e| ArtifactError::Read {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    inspect_bytes(path, &bytes)
}

/// Fail unless the artifact has no dynamic dependencies
pub fn ensure_static(report: &ArtifactReport) -> Result<(), ArtifactError> {
    if report.is_static {
        return Ok(());
    }
    let mut deps: Vec<String> = report.interpreter.iter().cloned().collect();
    deps.extend(report.needed.iter().cloned());
    Err(ArtifactError::DynamicallyLinked {
        path: report.path.clone(),
        deps,
    })
}

/// Fail unless the artifact is a 32-bit ARM executable
pub fn ensure_arm(report: &ArtifactReport) -> Result<(), ArtifactError> {
    if report.machine_id == header::EM_ARM && !report.is_64 {
        Ok(())
    } else {
        Err(ArtifactError::WrongMachine {
            path: report.path.clone(),
            machine: report.machine.clone(),
        })
    }
}

/// Inspect `path` and require a static 32-bit ARM executable
pub fn check_deployable(path: &Path) -> Result<ArtifactReport, ArtifactError> {
    let report = inspect(path)?;
    ensure_arm(&report)?;
    ensure_static(&report)?;
    Ok(report)
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Cannot read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Not an ELF file: {0}")]
    NotElf(PathBuf),

    #[error("Malformed ELF {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("{path} is dynamically linked against: {}", deps.join(", "))]
    DynamicallyLinked { path: PathBuf, deps: Vec<String> },

    #[error("{path} targets {machine}, expected 32-bit ARM")]
    WrongMachine { path: PathBuf, machine: String },
}

/// Minimal little-endian ELF32 executable, optionally with a PT_INTERP segment
#[cfg(test)]
pub(crate) fn elf32(machine: u16, interp: Option<&str>) -> Vec<u8> {
    let phnum: u16 = if interp.is_some() { 1 } else { 0 };
    let mut b = Vec::new();
    b.extend_from_slice(ELF_MAGIC);
    b.extend_from_slice(&[1, 1, 1, 0]);
    b.extend_from_slice(&[0; 8]);
    b.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    b.extend_from_slice(&machine.to_le_bytes());
    b.extend_from_slice(&1u32.to_le_bytes());
    b.extend_from_slice(&0x10000u32.to_le_bytes());
    b.extend_from_slice(&(if phnum > 0 { 52u32 } else { 0 }).to_le_bytes());
    b.extend_from_slice(&0u32.to_le_bytes());
    b.extend_from_slice(&0x0500_0200u32.to_le_bytes());
    b.extend_from_slice(&52u16.to_le_bytes());
    b.extend_from_slice(&32u16.to_le_bytes());
    b.extend_from_slice(&phnum.to_le_bytes());
    b.extend_from_slice(&40u16.to_le_bytes());
    b.extend_from_slice(&0u16.to_le_bytes());
    b.extend_from_slice(&0u16.to_le_bytes());

    if let Some(interp) = interp {
        let offset = 52 + 32;
        let len = interp.len() as u32 + 1;
        for field in [3u32, offset, 0, 0, len, len, 4, 1] {
            b.extend_from_slice(&field.to_le_bytes());
        }
        b.extend_from_slice(interp.as_bytes());
        b.push(0);
    }
    b
}
