//! Error types for the RTOS probe

use thiserror::Error;

/// Main error type for the RTOS probe
#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Probe not found: {0}")]
    ProbeNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid session ID: {0}")]
    InvalidSession(String),

    #[error("Session limit exceeded (max: {0})")]
    SessionLimitExceeded(usize),

    #[error("No target")]
    NoTarget,

    #[error("Thread ID {0} not known")]
    UnknownTask(u32),

    #[error("Memory access failed: {0}")]
    MemoryAccessFailed(String),

    #[error("Register access failed: {0}")]
    RegisterAccessFailed(String),

    #[error("Invalid core file: {0}")]
    InvalidCoreFile(String),

    #[error("Symbol error: {0}")]
    SymbolError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Probe error: {0}")]
    ProbeError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl DebugError {
    /// True for failures talking to the target (memory or register round-trips).
    pub fn is_target_communication(&self) -> bool {
        matches!(
            self,
            DebugError::MemoryAccessFailed(_)
                | DebugError::RegisterAccessFailed(_)
                | DebugError::ProbeError(_)
        )
    }
}

impl From<probe_rs::Error> for DebugError {
    fn from(error: probe_rs::Error) -> Self {
        DebugError::ProbeError(error.to_string())
    }
}

impl From<anyhow::Error> for DebugError {
    fn from(error: anyhow::Error) -> Self {
        DebugError::InternalError(error.to_string())
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DebugError>;

/// Target control errors
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Target not halted")]
    TargetNotHalted,

    #[error("Halt failed: {0}")]
    HaltFailed(String),

    #[error("Resume failed: {0}")]
    ResumeFailed(String),
}

impl From<TargetError> for DebugError {
    fn from(error: TargetError) -> Self {
        DebugError::ProbeError(error.to_string())
    }
}

/// Memory operation errors
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Read failed at address 0x{address:08x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Invalid memory range: 0x{start:08x}-0x{end:08x}")]
    InvalidRange { start: u64, end: u64 },

    #[error("Memory region not accessible: 0x{address:08x}")]
    NotAccessible { address: u64 },
}

impl From<MemoryError> for DebugError {
    fn from(error: MemoryError) -> Self {
        DebugError::MemoryAccessFailed(error.to_string())
    }
}

/// Core register errors
#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("Read of {register} failed: {reason}")]
    ReadFailed { register: String, reason: String },

    #[error("Write of {register} failed: {reason}")]
    WriteFailed { register: String, reason: String },

    #[error("Register {register} is not 32 bits wide")]
    UnexpectedWidth { register: String },
}

impl From<RegisterError> for DebugError {
    fn from(error: RegisterError) -> Self {
        DebugError::RegisterAccessFailed(error.to_string())
    }
}

/// Core file layout errors
#[derive(Error, Debug)]
pub enum CoreFileError {
    #[error("Bad ELF magic")]
    BadMagic,

    #[error("Only little-endian ELF32 images are supported")]
    UnsupportedClass,

    #[error("Truncated image: need {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("Segment too large for ELF32: {0} bytes")]
    SegmentTooLarge(usize),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CoreFileError> for DebugError {
    fn from(error: CoreFileError) -> Self {
        DebugError::InvalidCoreFile(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_task_message() {
        let error = DebugError::UnknownTask(7);
        assert_eq!(error.to_string(), "Thread ID 7 not known");
    }

    #[test]
    fn test_memory_error_conversion() {
        let error: DebugError = MemoryError::ReadFailed {
            address: 0x2000_0000,
            reason: "fault".to_string(),
        }
        .into();
        assert!(error.is_target_communication());
        assert!(error.to_string().contains("0x20000000"));
    }

    #[test]
    fn test_core_file_error_is_not_communication() {
        let error: DebugError = CoreFileError::BadMagic.into();
        assert!(!error.is_target_communication());
    }
}
