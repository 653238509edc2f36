//! Access to the live target: core registers and memory
//!
//! Everything above this module talks to a [`Target`]. The probe-rs backed
//! implementation drives a real Cortex-M core; [`MemoryTarget`] holds a register
//! file and a sparse memory image in RAM, which is what offline replay of a core
//! file and the unit tests run against.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use probe_rs::{Core, MemoryInterface, RegisterId, RegisterValue};
use tracing::trace;

use crate::error::{MemoryError, RegisterError, Result};

/// Number of slots in the Cortex-M register id space used here (r0-r15, xPSR, MSP, PSP).
const REGISTER_SLOTS: usize = 19;

/// Longest C string read from the target when no limit is configured.
pub const DEFAULT_STRING_LIMIT: usize = 64;

/// Cortex-M core register, numbered like the DCRSR REGSEL field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreRegister {
    /// r0-r15 (r13 = sp, r14 = lr, r15 = pc)
    General(u8),
    Xpsr,
    /// Main (handler) stack pointer
    Msp,
    /// Process (thread) stack pointer
    Psp,
}

impl CoreRegister {
    pub const SP: CoreRegister = CoreRegister::General(13);
    pub const LR: CoreRegister = CoreRegister::General(14);
    pub const PC: CoreRegister = CoreRegister::General(15);

    /// Register id understood by the debug interface.
    pub fn id(self) -> u16 {
        match self {
            CoreRegister::General(n) => n as u16,
            CoreRegister::Xpsr => 16,
            CoreRegister::Msp => 17,
            CoreRegister::Psp => 18,
        }
    }
}

impl fmt::Display for CoreRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreRegister::General(13) => write!(f, "sp"),
            CoreRegister::General(14) => write!(f, "lr"),
            CoreRegister::General(15) => write!(f, "pc"),
            CoreRegister::General(n) => write!(f, "r{}", n),
            CoreRegister::Xpsr => write!(f, "xpsr"),
            CoreRegister::Msp => write!(f, "msp"),
            CoreRegister::Psp => write!(f, "psp"),
        }
    }
}

/// Register and memory primitives of a halted target
pub trait Target {
    fn read_register(&mut self, reg: CoreRegister) -> Result<u32>;

    fn write_register(&mut self, reg: CoreRegister, value: u32) -> Result<()>;

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<()>;

    /// Read one little-endian machine word.
    fn read_word(&mut self, address: u32) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read_memory(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read consecutive little-endian words starting at `address`.
    fn read_words(&mut self, address: u32, words: &mut [u32]) -> Result<()> {
        let mut bytes = vec![0u8; words.len() * 4];
        self.read_memory(address, &mut bytes)?;
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes.
    ///
    /// Reads in small chunks so a short name near the end of a memory region
    /// does not fault on bytes past its terminator.
    fn read_c_string(&mut self, address: u32, max_len: usize) -> Result<String> {
        const CHUNK: usize = 16;
        let mut bytes = Vec::new();
        let mut cursor = address;
        while bytes.len() < max_len {
            let len = CHUNK.min(max_len - bytes.len());
            let mut chunk = [0u8; CHUNK];
            if self.read_memory(cursor, &mut chunk[..len]).is_err() {
                // The chunk runs off the end of memory; go byte by byte up to the NUL
                for i in 0..len {
                    self.read_memory(cursor.wrapping_add(i as u32), &mut chunk[i..i + 1])?;
                    if chunk[i] == 0 {
                        break;
                    }
                }
            }
            if let Some(end) = chunk[..len].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.extend_from_slice(&chunk[..len]);
            cursor = cursor.wrapping_add(len as u32);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl<T: Target + ?Sized> Target for &mut T {
    fn read_register(&mut self, reg: CoreRegister) -> Result<u32> {
        (**self).read_register(reg)
    }

    fn write_register(&mut self, reg: CoreRegister, value: u32) -> Result<()> {
        (**self).write_register(reg, value)
    }

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_memory(address, buf)
    }
}

// =============================================================================
// probe-rs backend
// =============================================================================

/// [`Target`] over an attached probe-rs core
pub struct ProbeTarget<'probe> {
    core: Core<'probe>,
}

impl<'probe> ProbeTarget<'probe> {
    pub fn new(core: Core<'probe>) -> Self {
        Self { core }
    }

    /// The underlying core, for run control.
    pub fn core_mut(&mut self) -> &mut Core<'probe> {
        &mut self.core
    }
}

impl Target for ProbeTarget<'_> {
    fn read_register(&mut self, reg: CoreRegister) -> Result<u32> {
        let value: RegisterValue = self
            .core
            .read_core_reg(RegisterId(reg.id()))
            .map_err(|e| RegisterError::ReadFailed {
                register: reg.to_string(),
                reason: e.to_string(),
            })?;
        match value {
            RegisterValue::U32(v) => Ok(v),
            _ => Err(RegisterError::UnexpectedWidth {
                register: reg.to_string(),
            }
            .into()),
        }
    }

    fn write_register(&mut self, reg: CoreRegister, value: u32) -> Result<()> {
        trace!("write {} = 0x{:08X}", reg, value);
        self.core
            .write_core_reg(RegisterId(reg.id()), value)
            .map_err(|e| {
                RegisterError::WriteFailed {
                    register: reg.to_string(),
                    reason: e.to_string(),
                }
                .into()
            })
    }

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.core.read(address as u64, buf).map_err(|e| {
            MemoryError::ReadFailed {
                address: address as u64,
                reason: e.to_string(),
            }
            .into()
        })
    }
}

// =============================================================================
// In-memory target
// =============================================================================

/// Register file plus sparse memory held in RAM
///
/// Writes to r13 land in whichever banked stack pointer the current xPSR
/// selects, and writes to the banked pointers show through r13, so a
/// capture/restore cycle behaves like it does on silicon.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    registers: [u32; REGISTER_SLOTS],
    regions: BTreeMap<u32, Vec<u8>>,
    rejected: HashSet<CoreRegister>,
    write_log: Vec<(CoreRegister, u32)>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `data` at `base`. Overlapping an existing region replaces it.
    pub fn add_region(&mut self, base: u32, data: Vec<u8>) {
        self.regions.insert(base, data);
    }

    /// Store a word into already mapped memory.
    pub fn write_word(&mut self, address: u32, value: u32) -> Result<()> {
        let (base, data) = self
            .regions
            .range_mut(..=address)
            .next_back()
            .ok_or(MemoryError::NotAccessible { address: address as u64 })?;
        let offset = (address - *base) as usize;
        if offset + 4 > data.len() {
            return Err(MemoryError::NotAccessible { address: address as u64 }.into());
        }
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Store bytes into already mapped memory.
    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        let (base, data) = self
            .regions
            .range_mut(..=address)
            .next_back()
            .ok_or(MemoryError::NotAccessible { address: address as u64 })?;
        let offset = (address - *base) as usize;
        if offset + bytes.len() > data.len() {
            return Err(MemoryError::InvalidRange {
                start: address as u64,
                end: address as u64 + bytes.len() as u64,
            }
            .into());
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Set a register directly, bypassing stack pointer banking and the write log.
    pub fn set_register(&mut self, reg: CoreRegister, value: u32) {
        self.registers[reg.id() as usize] = value;
    }

    pub fn register(&self, reg: CoreRegister) -> u32 {
        self.registers[reg.id() as usize]
    }

    /// Make writes to `reg` fail from now on.
    pub fn reject_writes(&mut self, reg: CoreRegister) {
        self.rejected.insert(reg);
    }

    /// Register writes performed through [`Target::write_register`], in order.
    pub fn write_log(&self) -> &[(CoreRegister, u32)] {
        &self.write_log
    }

    fn active_stack_pointer(&self) -> CoreRegister {
        if self.registers[CoreRegister::Xpsr.id() as usize] & 0xff != 0 {
            CoreRegister::Msp
        } else {
            CoreRegister::Psp
        }
    }
}

impl Target for MemoryTarget {
    fn read_register(&mut self, reg: CoreRegister) -> Result<u32> {
        Ok(self.register(reg))
    }

    fn write_register(&mut self, reg: CoreRegister, value: u32) -> Result<()> {
        if self.rejected.contains(&reg) {
            return Err(RegisterError::WriteFailed {
                register: reg.to_string(),
                reason: "rejected by target".to_string(),
            }
            .into());
        }
        self.write_log.push((reg, value));
        self.set_register(reg, value);
        let active = self.active_stack_pointer();
        if reg == CoreRegister::SP {
            self.set_register(active, value);
        } else if reg == active {
            self.set_register(CoreRegister::SP, value);
        }
        Ok(())
    }

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let not_mapped = || MemoryError::ReadFailed {
            address: address as u64,
            reason: "address not mapped".to_string(),
        };
        let (base, data) = self.regions.range(..=address).next_back().ok_or_else(not_mapped)?;
        let offset = (address - *base) as usize;
        if offset + buf.len() > data.len() {
            return Err(not_mapped().into());
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }
}
