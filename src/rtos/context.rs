//! Per-thread register reconstruction

use tracing::{debug, warn};

use crate::config::{FrameKindSetting, RtosConfig};
use crate::error::Result;
use crate::registers::{RegisterSet, LR, PC, SP, XPSR};
use crate::symbols::{FrameDescriptor, FrameResolver};
use crate::target::Target;

use super::{Task, TaskId};

/// Coprocessor Access Control Register
const CPACR: u32 = 0xE000_ED88;
/// Floating-point Context Control Register
const FPCCR: u32 = 0xE000_EF34;
const CPACR_CP10_CP11: u32 = 0xF << 20;
const FPCCR_ASPEN: u32 = 1 << 31;

/// xPSR bit set when the core padded the stack to 8-byte alignment on entry.
const XPSR_STACK_ALIGN: u32 = 1 << 9;

/// Words of the basic frame: r0, r1, r2, r3, r12, lr, pc, xpsr.
const BASIC_FRAME_WORDS: usize = 8;

/// Exception frame pushed by the core on interrupt entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Integer registers only
    Standard,
    /// Integer registers plus s0-s15, FPSCR and a reserved word
    Extended,
}

impl FrameKind {
    pub fn size(self) -> u32 {
        match self {
            FrameKind::Standard => 0x20,
            FrameKind::Extended => 0x68,
        }
    }
}

/// Decide the frame kind for this stop.
///
/// In `auto` mode the frame is extended when the FPU is enabled and automatic
/// state preservation is on. If the FPU registers cannot be read the extended
/// frame is assumed, which is what a port with FPU support pushes.
pub fn detect_frame_kind<T: Target + ?Sized>(target: &mut T, setting: FrameKindSetting) -> FrameKind {
    match setting {
        FrameKindSetting::Standard => FrameKind::Standard,
        FrameKindSetting::Extended => FrameKind::Extended,
        FrameKindSetting::Auto => {
            let probe = target
                .read_word(CPACR)
                .and_then(|cpacr| Ok((cpacr, target.read_word(FPCCR)?)));
            match probe {
                Ok((cpacr, fpccr)) => {
                    let kind = if cpacr & CPACR_CP10_CP11 != 0 && fpccr & FPCCR_ASPEN != 0 {
                        FrameKind::Extended
                    } else {
                        FrameKind::Standard
                    };
                    debug!("CPACR=0x{:08X} FPCCR=0x{:08X}: {:?} exception frames", cpacr, fpccr, kind);
                    kind
                }
                Err(e) => {
                    warn!("Could not read FPU control registers ({}), assuming extended frames", e);
                    FrameKind::Extended
                }
            }
        }
    }
}

/// Rebuilds thread register sets for one stop
pub struct ContextReconstructor<'a> {
    config: &'a RtosConfig,
    resolver: &'a FrameResolver,
    frame_kind: FrameKind,
}

impl<'a> ContextReconstructor<'a> {
    pub fn new(config: &'a RtosConfig, resolver: &'a FrameResolver, frame_kind: FrameKind) -> Self {
        Self {
            config,
            resolver,
            frame_kind,
        }
    }

    /// Refresh name, registers and frame of `task`.
    ///
    /// On error the task keeps its previous registers and frame and records
    /// the failure instead.
    pub fn refresh<T: Target + ?Sized>(
        &self,
        target: &mut T,
        task: &mut Task,
        live: &RegisterSet,
        current: Option<TaskId>,
    ) -> Result<()> {
        match self.reconstruct(target, task.id, live, current) {
            Ok((name, regs, frame)) => {
                task.name = name;
                task.active = current == Some(task.id);
                task.regs = regs;
                task.frame = Some(frame);
                task.error = None;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to reconstruct thread {} ({}): {}", task.label, task.id, e);
                task.active = current == Some(task.id);
                task.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn reconstruct<T: Target + ?Sized>(
        &self,
        target: &mut T,
        id: TaskId,
        live: &RegisterSet,
        current: Option<TaskId>,
    ) -> Result<(String, RegisterSet, FrameDescriptor)> {
        let name = self.read_name(target, id)?;

        if current == Some(id) {
            let frame = self.resolver.resolve(live.pc());
            return Ok((name, *live, frame));
        }

        let mut regs = self.saved_context(target, id, live)?;
        let mut frame = self.resolver.resolve(regs.pc());

        if frame.function == self.config.switch_trampoline {
            debug!("Thread {} resumes through {}, popping exception frame", id, frame.function);
            unwind_exception_frame(target, &mut regs, self.frame_kind)?;
            frame = self.resolver.resolve(regs.pc());
        }

        Ok((name, regs, frame))
    }

    fn read_name<T: Target + ?Sized>(&self, target: &mut T, id: TaskId) -> Result<String> {
        let name_ptr = target.read_word(id.0.wrapping_add(self.config.thread.name_offset))?;
        if name_ptr == 0 {
            return Ok(String::new());
        }
        target.read_c_string(name_ptr, self.config.max_name_len)
    }

    /// Registers of a switched-out thread from its saved context block.
    ///
    /// r0-r3, r12 and xpsr are not saved by the switch, so they keep the live values.
    pub fn saved_context<T: Target + ?Sized>(
        &self,
        target: &mut T,
        id: TaskId,
        live: &RegisterSet,
    ) -> Result<RegisterSet> {
        let layout = &self.config.context;
        let ctx = target.read_word(id.0.wrapping_add(self.config.thread.ctx_offset))?;

        let mut regs = *live;
        regs.0[SP] = ctx.wrapping_add(layout.size);
        regs.0[PC] = target.read_word(ctx.wrapping_add(layout.lr_offset))?;

        let mut callee_saved = [0u32; 8];
        target.read_words(ctx.wrapping_add(layout.r4_offset), &mut callee_saved)?;
        regs.0[4..12].copy_from_slice(&callee_saved);
        Ok(regs)
    }
}

/// Pop one hardware exception frame from the stack `regs` points at.
pub fn unwind_exception_frame<T: Target + ?Sized>(
    target: &mut T,
    regs: &mut RegisterSet,
    kind: FrameKind,
) -> Result<()> {
    let mut frame = [0u32; BASIC_FRAME_WORDS];
    target.read_words(regs.sp(), &mut frame)?;

    regs.0[..4].copy_from_slice(&frame[..4]);
    regs.0[12] = frame[4];
    regs.0[LR] = frame[5];
    regs.0[PC] = frame[6];
    regs.0[XPSR] = frame[7];

    let mut size = kind.size();
    if frame[7] & XPSR_STACK_ALIGN != 0 {
        size += 4;
    }
    regs.0[SP] = regs.sp().wrapping_add(size);
    Ok(())
}
