//! RTOS Probe
//!
//! Thread awareness for ChibiOS/RT targets on ARM Cortex-M: rebuilds the
//! register state of every kernel thread from target memory at each halt and
//! writes ELF core files that `gdb-multiarch` can load. Served to AI assistants
//! as a Model Context Protocol server over probe-rs.

pub mod config;
pub mod error;
pub mod target;
pub mod registers;
pub mod symbols;
pub mod rtos;
pub mod coredump;
pub mod session;
pub mod tools;

pub use error::{DebugError, Result};
pub use config::Config;
pub use session::{StopEvent, StopReport, TargetObserver, TaskSession};
pub use tools::RtosProbeToolHandler;
