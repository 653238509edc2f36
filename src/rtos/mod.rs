//! RTOS thread awareness
//!
//! Threads are discovered by walking the kernel registry ring in target memory
//! and each gets a reconstructed register set: the live registers for the running
//! thread, the saved switch context (plus one popped exception frame when the
//! thread was preempted by an interrupt) for everything else.

pub mod context;
pub mod registry;

use std::fmt;

use crate::registers::RegisterSet;
use crate::symbols::FrameDescriptor;

pub use context::{detect_frame_kind, ContextReconstructor, FrameKind};
pub use registry::{walk_registry, ScanReport, TaskRegistry};

/// Address of a thread control record; stable for the thread's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// One RTOS thread as seen at the last stop
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Label shown to the user, assigned on first sighting and never reused
    pub label: u32,
    pub name: String,
    pub active: bool,
    pub regs: RegisterSet,
    pub frame: Option<FrameDescriptor>,
    /// Why the last refresh of this thread failed, if it did
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, label: u32) -> Self {
        Self {
            id,
            label,
            name: String::new(),
            active: false,
            regs: RegisterSet::default(),
            frame: None,
            error: None,
        }
    }

    /// Frame column of the thread listing.
    pub fn frame_description(&self) -> String {
        match (&self.error, &self.frame) {
            (Some(error), _) => format!("<unavailable: {}>", error),
            (None, Some(frame)) => frame.to_string(),
            (None, None) => "<unknown>".to_string(),
        }
    }
}

/// One row of the thread listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub label: u32,
    pub name: String,
    pub active: bool,
    pub frame: String,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            label: task.label,
            name: task.name.clone(),
            active: task.active,
            frame: task.frame_description(),
        }
    }
}

/// Render the listing the way `info threads` does.
pub fn format_task_table(tasks: &[TaskSummary]) -> String {
    let mut out = String::from("  Id   Target Id            Frame\n");
    for task in tasks {
        out.push_str(&format!(
            "{} {:<4} {:<20} {}\n",
            if task.active { '*' } else { ' ' },
            task.label,
            task.name,
            task.frame
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(0x2000_0A10).to_string(), "0x20000a10");
    }

    #[test]
    fn test_frame_description_prefers_error() {
        let mut task = Task::new(TaskId(0x2000_0000), 1);
        assert_eq!(task.frame_description(), "<unknown>");

        task.frame = Some(FrameDescriptor {
            pc: 0x0800_0100,
            function: "main".to_string(),
        });
        assert_eq!(task.frame_description(), "0x8000100 in main ()");

        task.error = Some("read failed".to_string());
        assert_eq!(task.frame_description(), "<unavailable: read failed>");
    }

    #[test]
    fn test_format_task_table() {
        let rows = vec![
            TaskSummary {
                label: 1,
                name: "main".to_string(),
                active: true,
                frame: "0x8000100 in main ()".to_string(),
            },
            TaskSummary {
                label: 2,
                name: "idle".to_string(),
                active: false,
                frame: "0x8000200 in _idle_thread ()".to_string(),
            },
        ];
        let table = format_task_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "  Id   Target Id            Frame");
        assert!(lines[1].starts_with("* 1    main"));
        assert!(lines[2].starts_with("  2    idle"));
        assert!(lines[2].ends_with("in _idle_thread ()"));
    }
}
