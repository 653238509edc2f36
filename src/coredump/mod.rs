//! ELF core dumps of an RTOS target
//!
//! A snapshot is an `ET_CORE`/`EM_ARM` image with one `PT_NOTE` segment holding
//! an `NT_PRSTATUS` note per thread, followed by a `PT_LOAD` segment per
//! configured memory region. `gdb-multiarch` loads it together with the
//! firmware ELF and shows every thread.

pub mod elf;
pub mod note;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::{debug, info};

use crate::config::CoreRegion;
use crate::error::Result;
use crate::rtos::Task;
use crate::target::Target;

pub use elf::{CoreFile, ElfHeader, ProgramHeader, Segment, EM_ARM, ET_CORE, PT_LOAD, PT_NOTE, PT_NULL};
pub use note::{encode_note, notes, prstatus_desc, Note, PrStatus, ThreadStatus, NT_PRSTATUS};

/// Interrupt, the signal of a snapshot taken on request
pub const SIGINT: u32 = 2;
/// Fault, the signal of a snapshot taken on a crash
pub const SIGSEGV: u32 = 11;

/// `PT_NOTE` payload for `tasks`; only the active thread carries `signal`.
pub fn build_notes(tasks: &[Task], signal: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    for task in tasks {
        let status = PrStatus {
            pr_cursig: if task.active { signal as u16 } else { 0 },
            pr_pid: task.label,
            ..PrStatus::default()
        };
        payload.extend(encode_note(note::CORE_NOTE_NAME, NT_PRSTATUS, &prstatus_desc(&status, &task.regs)));
    }
    payload
}

/// Assemble a core image from the threads and fresh reads of `regions`.
pub fn build_core_file<T: Target + ?Sized>(
    target: &mut T,
    tasks: &[Task],
    regions: &[CoreRegion],
    signal: u32,
) -> Result<CoreFile> {
    let mut core = CoreFile::new();
    core.set_type(ET_CORE);
    core.set_machine(EM_ARM);
    core.add_segment(PT_NOTE, 0, build_notes(tasks, signal));

    for region in regions {
        debug!("Reading {} (0x{:08X}, {} bytes)", region.name, region.start, region.size);
        let mut data = vec![0u8; region.size as usize];
        target.read_memory(region.start, &mut data)?;
        core.add_segment(PT_LOAD, region.start, data);
    }
    Ok(core)
}

/// `base` with a `-YYMMDD-HHMMSS` suffix for `now`.
pub fn timestamped_path(base: &Path, now: DateTime<Local>) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(now.format("-%y%m%d-%H%M%S").to_string());
    PathBuf::from(name)
}

/// Write a snapshot next to `base` and return the file actually written.
pub fn write_snapshot<T: Target + ?Sized>(
    target: &mut T,
    tasks: &[Task],
    regions: &[CoreRegion],
    base: &Path,
    signal: u32,
) -> Result<PathBuf> {
    let mut core = build_core_file(target, tasks, regions, signal)?;
    let path = timestamped_path(base, Local::now());

    let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
    core.write_to(&mut file)?;

    info!("(core dumped to {:?})", path.display().to_string());
    Ok(path)
}

/// Load a core file from disk.
pub fn read_core_file(path: &Path) -> Result<CoreFile> {
    let data = std::fs::read(path)?;
    Ok(CoreFile::parse(&data)?)
}

impl CoreFile {
    /// Thread records of every `NT_PRSTATUS` note, in file order.
    pub fn threads(&self) -> Result<Vec<ThreadStatus>> {
        let mut threads = Vec::new();
        for segment in self.segments().iter().filter(|s| s.header.p_type == PT_NOTE) {
            for note in notes(&segment.data) {
                let note = note?;
                if note.n_type == NT_PRSTATUS && note.name == note::CORE_NOTE_NAME {
                    threads.push(ThreadStatus::parse(&note.desc)?);
                }
            }
        }
        Ok(threads)
    }

    /// Bytes of the loadable segment covering `address`, from there to its end.
    pub fn memory_at(&self, address: u32) -> Option<&[u8]> {
        self.segments()
            .iter()
            .filter(|s| s.header.p_type == PT_LOAD)
            .find_map(|s| {
                let start = s.header.p_vaddr;
                let offset = address.checked_sub(start)? as usize;
                s.data.get(offset..)
            })
            .filter(|rest| !rest.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DebugError;
    use crate::registers::RegisterSet;
    use crate::rtos::TaskId;
    use crate::target::MemoryTarget;
    use chrono::TimeZone;

    fn task(label: u32, active: bool, pc: u32) -> Task {
        let mut task = Task::new(TaskId(0x2000_0100 + label * 0x40), label);
        task.active = active;
        let mut regs = RegisterSet::default();
        regs.0[15] = pc;
        task.regs = regs;
        task
    }

    fn regions() -> Vec<CoreRegion> {
        vec![
            CoreRegion {
                name: "ram".to_string(),
                start: 0x2000_0000,
                size: 0x100,
            },
            CoreRegion {
                name: "scs".to_string(),
                start: 0xE000_ED00,
                size: 0x40,
            },
        ]
    }

    fn target() -> MemoryTarget {
        let mut target = MemoryTarget::new();
        target.add_region(0x2000_0000, (0..=255u8).collect());
        target.add_region(0xE000_ED00, vec![0x5A; 0x40]);
        target
    }

    #[test]
    fn test_only_active_thread_carries_signal() {
        let tasks = vec![task(1, false, 0x0800_0100), task(2, true, 0x0800_0200)];
        let core = build_core_file(&mut target(), &tasks, &regions(), SIGSEGV).unwrap();
        let threads = core.threads().unwrap();

        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].status.pr_cursig, 0);
        assert_eq!(threads[0].status.pr_pid, 1);
        assert_eq!(threads[1].status.pr_cursig, SIGSEGV as u16);
        assert_eq!(threads[1].regs.pc(), 0x0800_0200);
    }

    #[test]
    fn test_segment_order() {
        let core = build_core_file(&mut target(), &[task(1, true, 0)], &regions(), SIGINT).unwrap();
        let kinds: Vec<(u32, u32)> = core.segments().iter().map(|s| (s.header.p_type, s.header.p_vaddr)).collect();
        assert_eq!(kinds, vec![(PT_NOTE, 0), (PT_LOAD, 0x2000_0000), (PT_LOAD, 0xE000_ED00)]);
        assert_eq!(core.memory_at(0x2000_0010).unwrap()[0], 0x10);
        assert!(core.memory_at(0x3000_0000).is_none());
    }

    #[test]
    fn test_unreadable_region_fails() {
        let mut regions = regions();
        regions.push(CoreRegion {
            name: "ccmram".to_string(),
            start: 0x1000_0000,
            size: 0x10,
        });
        let result = build_core_file(&mut target(), &[], &regions, SIGINT);
        assert!(matches!(result, Err(DebugError::MemoryAccessFailed(_))));
    }

    #[test]
    fn test_timestamped_path() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 2).unwrap();
        let path = timestamped_path(Path::new("/tmp/core"), now);
        assert_eq!(path, PathBuf::from("/tmp/core-240307-090502"));
    }

    #[test]
    fn test_write_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("core");
        let tasks = vec![task(1, true, 0x0800_0100)];

        let path = write_snapshot(&mut target(), &tasks, &regions(), &base, SIGINT).unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("core-"));
        assert_eq!(file_name.len(), "core-YYMMDD-HHMMSS".len());

        let bytes = std::fs::read(&path).unwrap();
        let elf = goblin::elf::Elf::parse(&bytes).unwrap();
        assert_eq!(elf.header.e_phoff, 52);
        assert_eq!(elf.program_headers.len(), 3);
        assert_eq!(elf.program_headers[0].p_offset, 52 + 3 * 32);

        let core = read_core_file(&path).unwrap();
        assert_eq!(core.threads().unwrap()[0].status.pr_cursig, SIGINT as u16);
    }
}
