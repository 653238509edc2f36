//! Argument types for the RTOS probe MCP tools

use serde::Deserialize;
use schemars::JsonSchema;

// =============================================================================
// Connection Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListProbesArgs {
    // No parameters needed
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConnectArgs {
    /// Probe selector (serial number, identifier, or "auto" for first available)
    pub probe_selector: String,
    /// Target chip name (e.g., "STM32F407VGTx")
    pub target_chip: String,
    /// Firmware ELF with the kernel symbols (defaults to the configured firmware)
    #[serde(default)]
    pub elf_path: Option<String>,
    /// Whether to halt and scan threads right after connecting
    #[serde(default = "default_true")]
    pub halt_after_connect: bool,
}

fn default_true() -> bool { true }

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DisconnectArgs {
    /// Session ID to disconnect
    pub session_id: String,
}

// =============================================================================
// Target Control Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct HaltArgs {
    /// Session ID
    pub session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunArgs {
    /// Session ID
    pub session_id: String,
}

// =============================================================================
// Thread Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LoadFirmwareArgs {
    /// Session ID
    pub session_id: String,
    /// Path to the firmware ELF running on the target
    pub elf_path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListTasksArgs {
    /// Session ID
    pub session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SelectTaskArgs {
    /// Session ID
    pub session_id: String,
    /// Thread ID as shown by list_tasks
    pub thread_id: u32,
}

// =============================================================================
// Core Dump Types
// =============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteSnapshotArgs {
    /// Session ID
    pub session_id: String,
    /// Core file path; a -YYMMDD-HHMMSS suffix is appended (defaults to the configured name)
    #[serde(default)]
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_defaults() {
        let args: ConnectArgs = serde_json::from_str(
            r#"{"probe_selector": "auto", "target_chip": "STM32F407VGTx"}"#,
        )
        .unwrap();
        assert!(args.halt_after_connect);
        assert!(args.elf_path.is_none());
    }

    #[test]
    fn test_select_task_args() {
        let args: SelectTaskArgs =
            serde_json::from_str(r#"{"session_id": "session_1", "thread_id": 3}"#).unwrap();
        assert_eq!(args.thread_id, 3);
        assert!(serde_json::from_str::<SelectTaskArgs>(r#"{"session_id": "s"}"#).is_err());
    }
}
