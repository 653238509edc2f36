//! Per-target thread session driven by debugger events
//!
//! The host calls [`TargetObserver::on_stop`] whenever the core halts,
//! [`TargetObserver::on_resume`] before letting it run and
//! [`TargetObserver::on_exit`] when the target goes away. Between stops the
//! session answers thread listing, selection and snapshot requests from its
//! cached state.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::config::Config;
use crate::coredump::{self, SIGSEGV};
use crate::error::{DebugError, Result};
use crate::registers::{write_cpu_regs, RegisterCache, RegisterSet};
use crate::rtos::{
    detect_frame_kind, walk_registry, ContextReconstructor, ScanReport, TaskId, TaskRegistry, TaskSummary,
};
use crate::symbols::FrameResolver;
use crate::target::Target;

/// Why the target stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// Halted on request or at a breakpoint
    Halted,
    /// Stopped with a signal, e.g. [`SIGSEGV`] on a fault
    Signal(u32),
}

impl StopEvent {
    pub fn signal(self) -> Option<u32> {
        match self {
            StopEvent::Halted => None,
            StopEvent::Signal(sig) => Some(sig),
        }
    }
}

/// What a stop refresh found
#[derive(Debug, Default)]
pub struct StopReport {
    /// False when the kernel registry could not be located
    pub rtos_present: bool,
    pub scan: ScanReport,
    /// Core file written automatically for a fault
    pub snapshot: Option<PathBuf>,
}

/// Debugger event hooks
pub trait TargetObserver {
    fn on_stop(&mut self, target: &mut dyn Target, event: StopEvent) -> Result<StopReport>;

    fn on_resume(&mut self, target: &mut dyn Target) -> Result<()>;

    fn on_exit(&mut self);
}

/// Thread state of one attached target
#[derive(Debug)]
pub struct TaskSession {
    config: Config,
    resolver: FrameResolver,
    cache: RegisterCache,
    registry: TaskRegistry,
    attached: bool,
}

impl TaskSession {
    pub fn new(config: Config, resolver: FrameResolver) -> Self {
        Self {
            config,
            resolver,
            cache: RegisterCache::new(),
            registry: TaskRegistry::new(),
            attached: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &FrameResolver {
        &self.resolver
    }

    /// Swap in symbols for newly loaded firmware. Known threads are kept.
    pub fn set_resolver(&mut self, resolver: FrameResolver) {
        self.resolver = resolver;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Live registers captured at the last stop.
    pub fn live_registers(&self) -> Option<&RegisterSet> {
        self.cache.live()
    }

    /// Address of the kernel ready list, from config or the firmware symbols.
    pub fn registry_root(&self) -> Option<u32> {
        let rtos = &self.config.rtos;
        rtos.registry_address.or_else(|| {
            self.resolver
                .symbols()
                .object_address(&rtos.registry_symbol)
                .and_then(|addr| u32::try_from(addr).ok())
        })
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.attached {
            Ok(())
        } else {
            Err(DebugError::NoTarget)
        }
    }

    /// Known threads in label order.
    pub fn list_tasks(&self) -> Result<Vec<TaskSummary>> {
        self.ensure_attached()?;
        Ok(self.registry.tasks().iter().map(TaskSummary::from).collect())
    }

    /// Load a thread's registers into the core and make it the selected thread.
    ///
    /// An unknown label leaves both the core and the selection untouched.
    pub fn select_task(&mut self, target: &mut dyn Target, label: u32) -> Result<TaskSummary> {
        self.ensure_attached()?;
        let task = self.registry.get(label).ok_or(DebugError::UnknownTask(label))?;
        let regs = task.regs;
        if let Err(e) = write_cpu_regs(target, &regs) {
            if let Err(restore_err) = self.cache.restore(target) {
                error!("Failed to restore live registers: {}", restore_err);
            }
            return Err(e);
        }
        self.registry.set_active(label);

        let task = self.registry.get(label).ok_or(DebugError::UnknownTask(label))?;
        info!("[Switching to thread {} ({})]", task.label, task.name);
        Ok(TaskSummary::from(task))
    }

    /// "[Current thread is N (name)]", or None before the first stop.
    pub fn current_task(&self) -> Result<Option<String>> {
        self.ensure_attached()?;
        Ok(self
            .registry
            .active()
            .map(|task| format!("[Current thread is {} ({})]", task.label, task.name)))
    }

    /// Dump every known thread and the configured memory regions.
    ///
    /// `path` defaults to the configured core file name.
    pub fn write_snapshot(&self, target: &mut dyn Target, path: Option<&Path>, signal: u32) -> Result<PathBuf> {
        self.ensure_attached()?;
        let base = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(&self.config.coredump.file_name));
        coredump::write_snapshot(target, self.registry.tasks(), &self.config.coredump.regions, &base, signal)
    }

    fn rescan(&mut self, target: &mut dyn Target, live: &RegisterSet) -> Result<StopReport> {
        let rtos = &self.config.rtos;
        let Some(root) = self.registry_root() else {
            debug!("Symbol '{}' not found, no RTOS threads", rtos.registry_symbol);
            self.registry.clear();
            return Ok(StopReport::default());
        };

        let found = walk_registry(target, rtos, root)?;
        let current = target.read_word(root.wrapping_add(rtos.ready_list.current_offset))?;
        let frame_kind = detect_frame_kind(target, rtos.exception_frame);
        let reconstructor = ContextReconstructor::new(rtos, &self.resolver, frame_kind);

        let scan = self.registry.rescan(
            target,
            &found,
            live,
            Some(TaskId(current)),
            rtos.prune_dead_tasks,
            &reconstructor,
        );
        Ok(StopReport {
            rtos_present: true,
            scan,
            snapshot: None,
        })
    }
}

impl TargetObserver for TaskSession {
    /// Capture, rescan, then put the live registers back whatever happened.
    fn on_stop(&mut self, target: &mut dyn Target, event: StopEvent) -> Result<StopReport> {
        self.attached = true;
        let live = self.cache.capture(target)?;

        let scanned = self.rescan(target, &live);
        let restored = self.cache.restore(target);
        let mut report = scanned?;
        restored?;

        if event == StopEvent::Signal(SIGSEGV) && self.config.coredump.auto_on_fault {
            match self.write_snapshot(target, None, SIGSEGV) {
                Ok(path) => report.snapshot = Some(path),
                Err(e) => error!("Automatic core dump failed: {}", e),
            }
        }
        Ok(report)
    }

    fn on_resume(&mut self, target: &mut dyn Target) -> Result<()> {
        if self.cache.restore(target)? {
            debug!("Live registers restored before resume");
        }
        Ok(())
    }

    fn on_exit(&mut self) {
        if self.attached {
            info!("Target detached, dropping {} threads", self.registry.len());
        }
        self.cache.clear();
        self.registry.reset();
        self.attached = false;
    }
}
