//! Configuration management for the RTOS probe

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use clap::Parser;
use crate::error::{DebugError, Result};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "rtos-probe")]
#[command(about = "RTOS thread awareness and ELF core dumps for Cortex-M targets")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Maximum number of concurrent debug sessions
    #[arg(long, default_value = "5")]
    pub max_sessions: usize,

    /// Default core dump file name (a timestamp suffix is appended)
    #[arg(long, env = "RTOS_PROBE_CORE_FILE")]
    pub core_file_name: Option<String>,

    /// Firmware ELF used for kernel symbols and frame descriptions
    #[arg(long)]
    pub elf: Option<PathBuf>,

    /// Generate default configuration file
    #[arg(long)]
    pub generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,

    /// Show current configuration and exit
    #[arg(long)]
    pub show_config: bool,
}

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub debugger: DebuggerConfig,
    pub rtos: RtosConfig,
    pub coredump: CoreDumpConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file or create default
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            let content = std::fs::read_to_string(path)
                .map_err(|e| DebugError::InvalidConfig(format!("Failed to read config file: {}", e)))?;
            Self::from_toml(&content)
        } else {
            Ok(Config::default())
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| DebugError::InvalidConfig(format!("Invalid TOML syntax: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Merge command line arguments into configuration
    pub fn merge_args(&mut self, args: &Args) {
        self.server.max_sessions = args.max_sessions;
        if let Some(name) = &args.core_file_name {
            self.coredump.file_name = name.clone();
        }
        if args.elf.is_some() {
            self.debugger.firmware = args.elf.clone();
        }
        self.logging.level = args.log_level.clone();
        if args.log_file.is_some() {
            self.logging.file = args.log_file.clone();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.max_sessions == 0 {
            return Err(DebugError::InvalidConfig("max_sessions must be > 0".to_string()));
        }
        if self.debugger.default_speed_khz == 0 {
            return Err(DebugError::InvalidConfig("default_speed_khz must be > 0".to_string()));
        }
        if self.rtos.max_tasks == 0 {
            return Err(DebugError::InvalidConfig("rtos.max_tasks must be > 0".to_string()));
        }
        if self.rtos.context.size == 0 {
            return Err(DebugError::InvalidConfig("rtos.context.size must be > 0".to_string()));
        }
        if self.coredump.file_name.is_empty() {
            return Err(DebugError::InvalidConfig("coredump.file_name must not be empty".to_string()));
        }
        for region in &self.coredump.regions {
            if region.size == 0 {
                return Err(DebugError::InvalidConfig(format!(
                    "coredump region '{}' has zero size", region.name
                )));
            }
            if (region.start as u64) + (region.size as u64) > 1 << 32 {
                return Err(DebugError::InvalidConfig(format!(
                    "coredump region '{}' extends past the 32-bit address space", region.name
                )));
            }
        }
        Ok(())
    }

    /// Generate TOML configuration string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DebugError::InvalidConfig(format!("Failed to serialize config: {}", e)))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { max_sessions: 5 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DebuggerConfig {
    pub default_speed_khz: u32,
    pub halt_timeout_ms: u64,
    /// Firmware image used when `connect` does not name one
    pub firmware: Option<PathBuf>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            default_speed_khz: 4000,
            halt_timeout_ms: 1000,
            firmware: None,
        }
    }
}

/// Where the kernel keeps its thread registry, and how its records are laid out.
///
/// Defaults match ChibiOS/RT 2.x on ARMv7-M with the registry enabled and no
/// FPU context in the switch frame.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RtosConfig {
    /// Symbol of the ready list that doubles as the registry ring head
    pub registry_symbol: String,
    /// Fixed ready list address, overriding the symbol lookup
    pub registry_address: Option<u32>,
    pub ready_list: ReadyListLayout,
    pub thread: ThreadLayout,
    pub context: ContextLayout,
    /// Routine a thread preempted by an interrupt resumes into
    pub switch_trampoline: String,
    pub exception_frame: FrameKindSetting,
    /// Forget threads that disappear from the registry
    pub prune_dead_tasks: bool,
    /// Upper bound on the registry walk, in case the ring is corrupt
    pub max_tasks: usize,
    pub max_name_len: usize,
}

impl Default for RtosConfig {
    fn default() -> Self {
        Self {
            registry_symbol: "rlist".to_string(),
            registry_address: None,
            ready_list: ReadyListLayout::default(),
            thread: ThreadLayout::default(),
            context: ContextLayout::default(),
            switch_trampoline: "_port_switch_from_isr".to_string(),
            exception_frame: FrameKindSetting::Auto,
            prune_dead_tasks: false,
            max_tasks: 64,
            max_name_len: 32,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReadyListLayout {
    /// First thread of the registry ring (`r_newer`)
    pub first_offset: u32,
    /// Currently running thread (`r_current`)
    pub current_offset: u32,
}

impl Default for ReadyListLayout {
    fn default() -> Self {
        Self {
            first_offset: 16,
            current_offset: 24,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ThreadLayout {
    /// Saved context pointer (`p_ctx.r13`)
    pub ctx_offset: u32,
    /// Next thread in the registry ring (`p_newer`)
    pub next_offset: u32,
    /// Name pointer (`p_name`)
    pub name_offset: u32,
}

impl Default for ThreadLayout {
    fn default() -> Self {
        Self {
            ctx_offset: 12,
            next_offset: 16,
            name_offset: 24,
        }
    }
}

/// Layout of the register block the context switch pushes (`struct intctx`)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ContextLayout {
    /// Offset of r4; r5-r11 follow
    pub r4_offset: u32,
    pub lr_offset: u32,
    /// Total size; the thread's stack pointer sits just past the block
    pub size: u32,
}

impl Default for ContextLayout {
    fn default() -> Self {
        Self {
            r4_offset: 0,
            lr_offset: 32,
            size: 36,
        }
    }
}

/// Exception frame size policy when unwinding the interrupt trampoline
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameKindSetting {
    /// Inspect CPACR and FPCCR at each stop
    Auto,
    Standard,
    Extended,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoreDumpConfig {
    pub file_name: String,
    /// Dump automatically when the target stops on a fault
    pub auto_on_fault: bool,
    pub regions: Vec<CoreRegion>,
}

impl Default for CoreDumpConfig {
    fn default() -> Self {
        Self {
            file_name: "core".to_string(),
            auto_on_fault: true,
            regions: vec![
                CoreRegion {
                    name: "ccmram".to_string(),
                    start: 0x1000_0000,
                    size: 64 * 1024,
                },
                CoreRegion {
                    name: "ram".to_string(),
                    start: 0x2000_0000,
                    size: 128 * 1024,
                },
                CoreRegion {
                    name: "scs".to_string(),
                    start: 0xE000_ED00,
                    size: 0x40,
                },
            ],
        }
    }
}

/// A window of target memory copied into core dumps
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CoreRegion {
    pub name: String,
    pub start: u32,
    pub size: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rtos.switch_trampoline, "_port_switch_from_isr");
        assert_eq!(config.coredump.regions.len(), 3);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[rtos]"));
        assert!(text.contains("exception_frame = \"auto\""));

        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.coredump.regions, config.coredump.regions);
        assert_eq!(parsed.rtos.context.size, 36);
    }

    #[test]
    fn test_zero_size_region_rejected() {
        let mut config = Config::default();
        config.coredump.regions[0].size = 0;
        assert!(matches!(config.validate(), Err(DebugError::InvalidConfig(_))));
    }

    #[test]
    fn test_region_past_address_space_rejected() {
        let mut config = Config::default();
        config.coredump.regions.push(CoreRegion {
            name: "top".to_string(),
            start: 0xFFFF_FF00,
            size: 0x200,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_args() {
        let args = Args::parse_from([
            "rtos-probe",
            "--core-file-name", "crash",
            "--elf", "fw.elf",
            "--max-sessions", "2",
        ]);
        let mut config = Config::default();
        config.merge_args(&args);
        assert_eq!(config.coredump.file_name, "crash");
        assert_eq!(config.debugger.firmware, Some(PathBuf::from("fw.elf")));
        assert_eq!(config.server.max_sessions, 2);
    }

    #[test]
    fn test_merge_args_keeps_file_settings() {
        let mut config = Config::from_toml(
            "[coredump]\nfile_name = \"crash\"\nauto_on_fault = true\nregions = []\n",
        )
        .unwrap();
        config.debugger.firmware = Some(PathBuf::from("ch.elf"));

        config.merge_args(&Args::parse_from(["rtos-probe"]));
        assert_eq!(config.coredump.file_name, "crash");
        assert_eq!(config.debugger.firmware, Some(PathBuf::from("ch.elf")));
    }

    #[test]
    fn test_invalid_toml() {
        let result = Config::from_toml("[rtos\nmax_tasks = 1");
        assert!(matches!(result, Err(DebugError::InvalidConfig(_))));
    }
}
