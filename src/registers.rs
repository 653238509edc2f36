//! Register sets and the live register cache

use std::fmt;

use tracing::{debug, warn};

use crate::error::Result;
use crate::target::{CoreRegister, Target};

/// Number of words in a [`RegisterSet`].
///
/// r0-r15 and xPSR, plus two scratch slots that are kept so the set matches
/// the 19-word register block GDB expects in an ARM prstatus note.
pub const NUM_REGS: usize = 19;

pub const SP: usize = 13;
pub const LR: usize = 14;
pub const PC: usize = 15;
pub const XPSR: usize = 16;

/// xPSR exception number field; non-zero while a handler is running.
const XPSR_EXCEPTION_MASK: u32 = 0xff;

/// One thread's view of the core registers
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterSet(pub [u32; NUM_REGS]);

impl RegisterSet {
    pub fn sp(&self) -> u32 {
        self.0[SP]
    }

    pub fn lr(&self) -> u32 {
        self.0[LR]
    }

    pub fn pc(&self) -> u32 {
        self.0[PC]
    }

    pub fn xpsr(&self) -> u32 {
        self.0[XPSR]
    }

    /// True when xPSR says the core is inside an exception handler.
    pub fn in_handler(&self) -> bool {
        self.xpsr() & XPSR_EXCEPTION_MASK != 0
    }

    /// Banked stack pointer that is live for this xPSR.
    pub fn active_stack_pointer(&self) -> CoreRegister {
        if self.in_handler() {
            CoreRegister::Msp
        } else {
            CoreRegister::Psp
        }
    }

    /// All words, little-endian, in slot order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|word| word.to_le_bytes()).collect()
    }
}

impl fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for word in &self.0 {
            list.entry(&format_args!("0x{:08X}", word));
        }
        list.finish()
    }
}

impl fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.0;
        writeln!(f, "  R0:  0x{:08X}   R1:  0x{:08X}   R2:  0x{:08X}   R3:  0x{:08X}", r[0], r[1], r[2], r[3])?;
        writeln!(f, "  R4:  0x{:08X}   R5:  0x{:08X}   R6:  0x{:08X}   R7:  0x{:08X}", r[4], r[5], r[6], r[7])?;
        writeln!(f, "  R8:  0x{:08X}   R9:  0x{:08X}   R10: 0x{:08X}   R11: 0x{:08X}", r[8], r[9], r[10], r[11])?;
        writeln!(f, "  R12: 0x{:08X}   SP:  0x{:08X}   LR:  0x{:08X}   PC:  0x{:08X}", r[12], r[SP], r[LR], r[PC])?;
        write!(f, "  xPSR: 0x{:08X}", r[XPSR])
    }
}

/// Snapshot of the hardware register file taken at the last stop
#[derive(Debug, Default)]
pub struct RegisterCache {
    live: Option<RegisterSet>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read r0-r15 and xPSR from the target and remember them as the live set.
    pub fn capture<T: Target + ?Sized>(&mut self, target: &mut T) -> Result<RegisterSet> {
        let regs = read_cpu_regs(target)?;
        debug!("Captured live registers: pc=0x{:08X} sp=0x{:08X}", regs.pc(), regs.sp());
        self.live = Some(regs);
        Ok(regs)
    }

    /// Write the cached live set back, if there is one.
    pub fn restore<T: Target + ?Sized>(&self, target: &mut T) -> Result<bool> {
        match &self.live {
            Some(regs) => {
                write_cpu_regs(target, regs)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn live(&self) -> Option<&RegisterSet> {
        self.live.as_ref()
    }

    pub fn clear(&mut self) {
        self.live = None;
    }
}

/// Read the general purpose registers and xPSR of the current context.
pub fn read_cpu_regs<T: Target + ?Sized>(target: &mut T) -> Result<RegisterSet> {
    let mut regs = RegisterSet::default();
    for i in 0..16u8 {
        regs.0[i as usize] = target.read_register(CoreRegister::General(i))?;
    }
    regs.0[XPSR] = target.read_register(CoreRegister::Xpsr)?;
    Ok(regs)
}

/// Load `regs` into the core.
///
/// The stack pointer has to go to the banked MSP or PSP for the core to use it
/// after resuming, so it is written last and even when the xPSR write fails.
pub fn write_cpu_regs<T: Target + ?Sized>(target: &mut T, regs: &RegisterSet) -> Result<()> {
    for i in 0..16u8 {
        target.write_register(CoreRegister::General(i), regs.0[i as usize])?;
    }

    if let Err(e) = target.write_register(CoreRegister::Xpsr, regs.xpsr()) {
        warn!("Failed to set xpsr: {}", e);
    }

    target.write_register(regs.active_stack_pointer(), regs.sp())
}
