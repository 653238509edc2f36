//! ELF notes and the ARM `prstatus` record carried in core files

use crate::error::CoreFileError;
use crate::registers::{RegisterSet, NUM_REGS};

/// Note type of a per-thread status record
pub const NT_PRSTATUS: u32 = 1;

/// Owner name of core file notes
pub const CORE_NOTE_NAME: &str = "CORE";

/// Size of the fixed part of [`PrStatus`]; the registers follow it.
pub const PRSTATUS_SIZE: usize = 72;

/// Size of one thread's `NT_PRSTATUS` descriptor.
pub const PRSTATUS_DESC_SIZE: usize = PRSTATUS_SIZE + NUM_REGS * 4;

fn align4(val: usize) -> usize {
    (val + 3) & !3
}

/// Encode one note: `[namesz, descsz, type]`, the NUL-terminated name padded
/// to 4 bytes, then the descriptor padded to 4 bytes.
pub fn encode_note(name: &str, n_type: u32, desc: &[u8]) -> Vec<u8> {
    let namesz = name.len() + 1;
    let mut out = Vec::with_capacity(12 + align4(namesz) + align4(desc.len()));
    out.extend_from_slice(&(namesz as u32).to_le_bytes());
    out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    out.extend_from_slice(&n_type.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.resize(12 + align4(namesz), 0);
    out.extend_from_slice(desc);
    out.resize(12 + align4(namesz) + align4(desc.len()), 0);
    out
}

/// One decoded note
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub name: String,
    pub n_type: u32,
    pub desc: Vec<u8>,
}

/// Iterator over the notes packed in a `PT_NOTE` payload
pub struct NoteIter<'a> {
    data: &'a [u8],
    offset: usize,
}

/// Walk the notes in `data`.
pub fn notes(data: &[u8]) -> NoteIter<'_> {
    NoteIter { data, offset: 0 }
}

impl NoteIter<'_> {
    fn word(&self, at: usize) -> Result<u32, CoreFileError> {
        self.data
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(CoreFileError::Truncated { offset: at, needed: 4 })
    }

    fn next_note(&mut self) -> Result<Note, CoreFileError> {
        let start = self.offset;
        let namesz = self.word(start)? as usize;
        let descsz = self.word(start + 4)? as usize;
        let n_type = self.word(start + 8)?;

        let name_start = start + 12;
        let desc_start = name_start + align4(namesz);
        let end = desc_start + align4(descsz);

        let name = self
            .data
            .get(name_start..name_start + namesz)
            .ok_or(CoreFileError::Truncated { offset: name_start, needed: namesz })?;
        let desc = self
            .data
            .get(desc_start..desc_start + descsz)
            .ok_or(CoreFileError::Truncated { offset: desc_start, needed: descsz })?;

        // The trailing padding of the last note may be missing
        self.offset = end.min(self.data.len());
        Ok(Note {
            name: String::from_utf8_lossy(name).trim_end_matches('\0').to_string(),
            n_type,
            desc: desc.to_vec(),
        })
    }
}

impl Iterator for NoteIter<'_> {
    type Item = Result<Note, CoreFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let note = self.next_note();
        if note.is_err() {
            self.offset = self.data.len();
        }
        Some(note)
    }
}

/// ARM `struct elf_prstatus` without the register block.
///
/// Debuggers only look at `pr_cursig` and `pr_pid`; the rest stays zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrStatus {
    pub si_signo: u32,
    pub si_code: u32,
    pub si_errno: u32,
    pub pr_cursig: u16,
    pub pr_pad0: u16,
    pub pr_sigpend: u32,
    pub pr_sighold: u32,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_utime: u64,
    pub pr_stime: u64,
    pub pr_cutime: u64,
    pub pr_cstime: u64,
}

impl PrStatus {
    pub fn to_bytes(&self) -> [u8; PRSTATUS_SIZE] {
        let mut buf = [0u8; PRSTATUS_SIZE];
        buf[0..4].copy_from_slice(&self.si_signo.to_le_bytes());
        buf[4..8].copy_from_slice(&self.si_code.to_le_bytes());
        buf[8..12].copy_from_slice(&self.si_errno.to_le_bytes());
        buf[12..14].copy_from_slice(&self.pr_cursig.to_le_bytes());
        buf[14..16].copy_from_slice(&self.pr_pad0.to_le_bytes());
        buf[16..20].copy_from_slice(&self.pr_sigpend.to_le_bytes());
        buf[20..24].copy_from_slice(&self.pr_sighold.to_le_bytes());
        buf[24..28].copy_from_slice(&self.pr_pid.to_le_bytes());
        buf[28..32].copy_from_slice(&self.pr_ppid.to_le_bytes());
        buf[32..36].copy_from_slice(&self.pr_pgrp.to_le_bytes());
        buf[36..40].copy_from_slice(&self.pr_sid.to_le_bytes());
        buf[40..48].copy_from_slice(&self.pr_utime.to_le_bytes());
        buf[48..56].copy_from_slice(&self.pr_stime.to_le_bytes());
        buf[56..64].copy_from_slice(&self.pr_cutime.to_le_bytes());
        buf[64..72].copy_from_slice(&self.pr_cstime.to_le_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self, CoreFileError> {
        if data.len() < PRSTATUS_SIZE {
            return Err(CoreFileError::Truncated {
                offset: 0,
                needed: PRSTATUS_SIZE,
            });
        }
        let u16_at = |o: usize| u16::from_le_bytes([data[o], data[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[o..o + 8]);
            u64::from_le_bytes(b)
        };
        Ok(Self {
            si_signo: u32_at(0),
            si_code: u32_at(4),
            si_errno: u32_at(8),
            pr_cursig: u16_at(12),
            pr_pad0: u16_at(14),
            pr_sigpend: u32_at(16),
            pr_sighold: u32_at(20),
            pr_pid: u32_at(24),
            pr_ppid: u32_at(28),
            pr_pgrp: u32_at(32),
            pr_sid: u32_at(36),
            pr_utime: u64_at(40),
            pr_stime: u64_at(48),
            pr_cutime: u64_at(56),
            pr_cstime: u64_at(64),
        })
    }
}

/// Descriptor of one thread's `NT_PRSTATUS` note: status record then registers.
pub fn prstatus_desc(status: &PrStatus, regs: &RegisterSet) -> Vec<u8> {
    let mut desc = Vec::with_capacity(PRSTATUS_DESC_SIZE);
    desc.extend_from_slice(&status.to_bytes());
    desc.extend_from_slice(&regs.to_le_bytes());
    desc
}

/// A thread as recorded in a core file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStatus {
    pub status: PrStatus,
    pub regs: RegisterSet,
}

impl ThreadStatus {
    /// Decode an `NT_PRSTATUS` descriptor.
    pub fn parse(desc: &[u8]) -> Result<Self, CoreFileError> {
        if desc.len() < PRSTATUS_DESC_SIZE {
            return Err(CoreFileError::Truncated {
                offset: 0,
                needed: PRSTATUS_DESC_SIZE,
            });
        }
        let status = PrStatus::parse(desc)?;
        let mut regs = RegisterSet::default();
        for (i, chunk) in desc[PRSTATUS_SIZE..PRSTATUS_DESC_SIZE].chunks_exact(4).enumerate() {
            regs.0[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self { status, regs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_core_note() {
        let note = encode_note("CORE", NT_PRSTATUS, b"");
        assert_eq!(note.len() % 4, 0);
        assert_eq!(note.len(), 20);
        assert_eq!(u32::from_le_bytes([note[0], note[1], note[2], note[3]]), 5);
        assert_eq!(u32::from_le_bytes([note[4], note[5], note[6], note[7]]), 0);
        assert_eq!(u32::from_le_bytes([note[8], note[9], note[10], note[11]]), 1);
        assert_eq!(&note[12..17], b"CORE\0");
    }

    #[test]
    fn test_descriptor_padding() {
        let note = encode_note("GNU", 3, &[1, 2, 3, 4, 5]);
        // 12 header + 4 name + 8 padded descriptor
        assert_eq!(note.len(), 24);
        assert_eq!(&note[16..21], &[1, 2, 3, 4, 5]);
        assert_eq!(&note[21..24], &[0, 0, 0]);
    }

    #[test]
    fn test_prstatus_layout() {
        let status = PrStatus {
            pr_cursig: 11,
            pr_pid: 3,
            ..PrStatus::default()
        };
        let bytes = status.to_bytes();
        assert_eq!(bytes.len(), PRSTATUS_SIZE);
        assert_eq!(u16::from_le_bytes([bytes[12], bytes[13]]), 11);
        assert_eq!(u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]), 3);
        assert_eq!(PrStatus::parse(&bytes).unwrap(), status);
    }

    #[test]
    fn test_notes_iterator() {
        let mut regs = RegisterSet::default();
        regs.0[15] = 0x0800_0123;
        let status = PrStatus {
            pr_pid: 2,
            ..PrStatus::default()
        };

        let mut payload = encode_note(CORE_NOTE_NAME, NT_PRSTATUS, &prstatus_desc(&PrStatus::default(), &regs));
        payload.extend(encode_note(CORE_NOTE_NAME, NT_PRSTATUS, &prstatus_desc(&status, &regs)));

        let decoded: Vec<Note> = notes(&payload).collect::<Result<_, _>>().unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].name, "CORE");
        assert_eq!(decoded[1].desc.len(), PRSTATUS_DESC_SIZE);

        let thread = ThreadStatus::parse(&decoded[1].desc).unwrap();
        assert_eq!(thread.status.pr_pid, 2);
        assert_eq!(thread.regs.pc(), 0x0800_0123);
    }

    #[test]
    fn test_truncated_note() {
        let note = encode_note("CORE", NT_PRSTATUS, &[0; 16]);
        let mut iter = notes(&note[..20]);
        assert!(matches!(iter.next(), Some(Err(CoreFileError::Truncated { .. }))));
        assert!(iter.next().is_none());
    }
}
