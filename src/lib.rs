//! zxic-deploy
//!
//! Host-side tooling for the zxic_ping router utility: provisions an
//! ARMv7/musl cross toolchain, builds a static release binary, inspects it,
//! delivers it over ADB push or a read-only TFTP server, and talks to the
//! running binary's UDP control port.

pub mod adb_client;
pub mod artifact;
pub mod builder;
pub mod config;
pub mod error;
pub mod launch;
pub mod process;
pub mod signal;
pub mod tftp;
pub mod toolchain;
pub mod tools;

pub use config::{Args, Command, Config};
pub use error::{Error, Result};
pub use tools::ZxicDeployToolHandler;
