//! Thread registry walk and the persistent set of known threads

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::config::RtosConfig;
use crate::error::Result;
use crate::registers::RegisterSet;
use crate::target::Target;

use super::context::ContextReconstructor;
use super::{Task, TaskId};

/// Walk the registry ring starting at the ready list `root`.
///
/// Stops when the ring closes (back at the root or the first thread), at a null
/// link, or at a thread whose saved context pointer is zero: such a thread was
/// created but has never been switched out, and is not reported.
pub fn walk_registry<T: Target + ?Sized>(
    target: &mut T,
    config: &RtosConfig,
    root: u32,
) -> Result<Vec<TaskId>> {
    let first = target.read_word(root.wrapping_add(config.ready_list.first_offset))?;
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut tp = first;

    while tp != root && tp != 0 {
        if found.len() >= config.max_tasks {
            warn!("Registry walk stopped after {} threads", config.max_tasks);
            break;
        }
        let ctx = target.read_word(tp.wrapping_add(config.thread.ctx_offset))?;
        if ctx == 0 {
            debug!("Thread 0x{:08x} has no saved context yet, stopping walk", tp);
            break;
        }
        found.push(TaskId(tp));
        seen.insert(tp);

        tp = target.read_word(tp.wrapping_add(config.thread.next_offset))?;
        if tp == first || seen.contains(&tp) {
            break;
        }
    }

    Ok(found)
}

/// Result of one rescan
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    /// Labels of threads seen for the first time, in ring order
    pub new: Vec<u32>,
    /// Threads dropped because they left the registry (only with pruning on)
    pub removed: Vec<Task>,
    /// Threads whose registers could not be rebuilt, with the reason
    pub failed: Vec<(u32, String)>,
}

/// Known threads, kept across stops
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
    next_label: u32,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            next_label: 1,
        }
    }

    /// Merge the latest registry walk and refresh every known thread.
    ///
    /// Identity is the control record address. New addresses get the next
    /// label; known ones keep theirs. A thread that fails to refresh is
    /// reported in `failed` and does not affect the others.
    pub fn rescan<T: Target + ?Sized>(
        &mut self,
        target: &mut T,
        found: &[TaskId],
        live: &RegisterSet,
        current: Option<TaskId>,
        prune: bool,
        reconstructor: &ContextReconstructor<'_>,
    ) -> ScanReport {
        let mut report = ScanReport::default();

        if prune {
            let present: HashSet<TaskId> = found.iter().copied().collect();
            let (kept, removed): (Vec<Task>, Vec<Task>) =
                self.tasks.drain(..).partition(|task| present.contains(&task.id));
            self.tasks = kept;
            for task in &removed {
                info!("[Thread '{}' exited]", task.name);
            }
            report.removed = removed;
        }

        let known: HashSet<TaskId> = self.tasks.iter().map(|task| task.id).collect();
        for id in found {
            if !known.contains(id) {
                let label = self.next_label;
                self.next_label += 1;
                self.tasks.push(Task::new(*id, label));
                report.new.push(label);
            }
        }

        for task in &mut self.tasks {
            if let Err(e) = reconstructor.refresh(target, task, live, current) {
                report.failed.push((task.label, e.to_string()));
            }
        }

        for label in &report.new {
            if let Some(task) = self.get(*label) {
                info!("[New thread '{}']", task.name);
            }
        }

        report
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, label: u32) -> Option<&Task> {
        self.tasks.iter().find(|task| task.label == label)
    }

    pub fn active(&self) -> Option<&Task> {
        self.tasks.iter().find(|task| task.active)
    }

    /// Mark `label` as the selected thread. Unknown labels change nothing.
    pub fn set_active(&mut self, label: u32) -> bool {
        if self.get(label).is_none() {
            return false;
        }
        for task in &mut self.tasks {
            task.active = task.label == label;
        }
        true
    }

    /// Forget all threads. Labels keep counting from where they were.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Forget all threads and restart labels at 1.
    pub fn reset(&mut self) {
        self.tasks.clear();
        self.next_label = 1;
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
