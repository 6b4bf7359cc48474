//! zxic-deploy MCP tools module
//!
//! One tool handler exposing every pipeline step using the RMCP 0.3.2 API.

pub mod deploy_tools;
pub mod types;

pub use deploy_tools::*;
pub use types::*;
