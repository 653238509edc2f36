//! RTOS probe MCP tools module
//!
//! A single tool handler built with the RMCP 0.3.2 router macros.

// Module declarations
pub mod debugger_tools;
pub mod types;

pub use debugger_tools::*;
pub use types::*;
