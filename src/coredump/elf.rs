//! Minimal ELF32 core image: file header, program headers and segment data
//!
//! Only what a core file needs is modelled. There is no section header table,
//! so `e_shoff`, `e_shentsize`, `e_shnum` and `e_shstrndx` are always zero.
//!
//! Reference: Tool Interface Standard (TIS) Executable and Linking Format (ELF)
//! Specification, Version 1.2.

use std::io::Write;

use crate::error::CoreFileError;

// ELF constants
pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;

pub const ET_NONE: u16 = 0;
pub const ET_CORE: u16 = 4;

pub const EM_ARM: u16 = 40;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;

pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

// ELF32 structure sizes
pub const ELF32_EHDR_SIZE: usize = 52;
pub const ELF32_PHDR_SIZE: usize = 32;

type Result<T> = std::result::Result<T, CoreFileError>;

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(CoreFileError::Truncated { offset, needed: 2 })
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(CoreFileError::Truncated { offset, needed: 4 })
}

/// ELF32 file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfHeader {
    pub ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Default for ElfHeader {
    /// A little-endian ELF32 header with no type or machine set
    fn default() -> Self {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(&ELFMAG);
        ident[4] = ELFCLASS32; // EI_CLASS
        ident[5] = ELFDATA2LSB; // EI_DATA
        ident[6] = EV_CURRENT; // EI_VERSION
        Self {
            ident,
            e_type: ET_NONE,
            e_machine: 0,
            e_version: EV_CURRENT as u32,
            e_entry: 0,
            e_phoff: 0,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: ELF32_EHDR_SIZE as u16,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }
}

impl ElfHeader {
    pub fn write_to(&self, output: &mut impl Write) -> std::io::Result<()> {
        output.write_all(&self.ident)?;
        output.write_all(&self.e_type.to_le_bytes())?;
        output.write_all(&self.e_machine.to_le_bytes())?;
        output.write_all(&self.e_version.to_le_bytes())?;
        output.write_all(&self.e_entry.to_le_bytes())?;
        output.write_all(&self.e_phoff.to_le_bytes())?;
        output.write_all(&self.e_shoff.to_le_bytes())?;
        output.write_all(&self.e_flags.to_le_bytes())?;
        output.write_all(&self.e_ehsize.to_le_bytes())?;
        output.write_all(&self.e_phentsize.to_le_bytes())?;
        output.write_all(&self.e_phnum.to_le_bytes())?;
        output.write_all(&self.e_shentsize.to_le_bytes())?;
        output.write_all(&self.e_shnum.to_le_bytes())?;
        output.write_all(&self.e_shstrndx.to_le_bytes())?;
        Ok(())
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ELF32_EHDR_SIZE {
            return Err(CoreFileError::Truncated {
                offset: 0,
                needed: ELF32_EHDR_SIZE,
            });
        }
        if data[..4] != ELFMAG {
            return Err(CoreFileError::BadMagic);
        }
        if data[4] != ELFCLASS32 || data[5] != ELFDATA2LSB {
            return Err(CoreFileError::UnsupportedClass);
        }
        let mut ident = [0u8; 16];
        ident.copy_from_slice(&data[..16]);
        Ok(Self {
            ident,
            e_type: read_u16(data, 16)?,
            e_machine: read_u16(data, 18)?,
            e_version: read_u32(data, 20)?,
            e_entry: read_u32(data, 24)?,
            e_phoff: read_u32(data, 28)?,
            e_shoff: read_u32(data, 32)?,
            e_flags: read_u32(data, 36)?,
            e_ehsize: read_u16(data, 40)?,
            e_phentsize: read_u16(data, 42)?,
            e_phnum: read_u16(data, 44)?,
            e_shentsize: read_u16(data, 46)?,
            e_shnum: read_u16(data, 48)?,
            e_shstrndx: read_u16(data, 50)?,
        })
    }
}

/// ELF32 program header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

impl ProgramHeader {
    pub fn write_to(&self, output: &mut impl Write) -> std::io::Result<()> {
        for field in [
            self.p_type,
            self.p_offset,
            self.p_vaddr,
            self.p_paddr,
            self.p_filesz,
            self.p_memsz,
            self.p_flags,
            self.p_align,
        ] {
            output.write_all(&field.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            p_type: read_u32(data, offset)?,
            p_offset: read_u32(data, offset + 4)?,
            p_vaddr: read_u32(data, offset + 8)?,
            p_paddr: read_u32(data, offset + 12)?,
            p_filesz: read_u32(data, offset + 16)?,
            p_memsz: read_u32(data, offset + 20)?,
            p_flags: read_u32(data, offset + 24)?,
            p_align: read_u32(data, offset + 28)?,
        })
    }
}

/// A program header and the bytes it describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: ProgramHeader,
    pub data: Vec<u8>,
}

/// In-memory core image
///
/// Offsets and sizes in the headers are only meaningful after
/// [`CoreFile::update_headers`], which [`CoreFile::serialize`] runs first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreFile {
    header: ElfHeader,
    segments: Vec<Segment>,
}

impl CoreFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the file type in the file header.
    pub fn set_type(&mut self, e_type: u16) {
        self.header.e_type = e_type;
    }

    /// Set the machine type in the file header.
    pub fn set_machine(&mut self, e_machine: u16) {
        self.header.e_machine = e_machine;
    }

    /// Append a segment mapped at `vaddr`.
    pub fn add_segment(&mut self, p_type: u32, vaddr: u32, data: Vec<u8>) {
        let (p_flags, p_paddr) = match p_type {
            PT_LOAD => (PF_R | PF_W, vaddr),
            _ => (0, 0),
        };
        let size = data.len() as u32;
        self.segments.push(Segment {
            header: ProgramHeader {
                p_type,
                p_offset: 0,
                p_vaddr: vaddr,
                p_paddr,
                p_filesz: size,
                p_memsz: size,
                p_flags,
                p_align: 4,
            },
            data,
        });
    }

    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Recompute table placement and per-segment offsets from the segment list.
    ///
    /// The program header table follows the file header; segment data follows
    /// the table in segment order.
    pub fn update_headers(&mut self) -> Result<()> {
        let header = &mut self.header;
        header.e_ehsize = ELF32_EHDR_SIZE as u16;
        header.e_phoff = ELF32_EHDR_SIZE as u32;
        header.e_phentsize = ELF32_PHDR_SIZE as u16;
        header.e_phnum = u16::try_from(self.segments.len())
            .map_err(|_| CoreFileError::Parse(format!("too many segments: {}", self.segments.len())))?;

        let mut offset = ELF32_EHDR_SIZE + ELF32_PHDR_SIZE * self.segments.len();
        for segment in &mut self.segments {
            let filesz = u32::try_from(segment.data.len())
                .map_err(|_| CoreFileError::SegmentTooLarge(segment.data.len()))?;
            segment.header.p_offset = u32::try_from(offset)
                .map_err(|_| CoreFileError::SegmentTooLarge(offset))?;
            segment.header.p_filesz = filesz;
            segment.header.p_memsz = segment.header.p_memsz.max(filesz);
            offset += segment.data.len();
        }
        Ok(())
    }

    /// Write the image: file header, program headers, then segment data.
    pub fn write_to(&mut self, output: &mut impl Write) -> std::result::Result<(), crate::error::DebugError> {
        self.update_headers()?;
        self.header.write_to(output)?;
        for segment in &self.segments {
            segment.header.write_to(output)?;
        }
        for segment in &self.segments {
            output.write_all(&segment.data)?;
        }
        output.flush()?;
        Ok(())
    }

    /// The serialized image.
    pub fn serialize(&mut self) -> Result<Vec<u8>> {
        self.update_headers()?;
        let total = ELF32_EHDR_SIZE
            + ELF32_PHDR_SIZE * self.segments.len()
            + self.segments.iter().map(|s| s.data.len()).sum::<usize>();
        let mut buf = Vec::with_capacity(total);
        self.header.write_to(&mut buf)?;
        for segment in &self.segments {
            segment.header.write_to(&mut buf)?;
        }
        for segment in &self.segments {
            buf.extend_from_slice(&segment.data);
        }
        Ok(buf)
    }

    /// Rebuild a core image from file contents.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = ElfHeader::parse(data)?;
        let mut segments = Vec::with_capacity(header.e_phnum as usize);
        let entsize = match header.e_phentsize as usize {
            0 => ELF32_PHDR_SIZE,
            n => n,
        };
        for i in 0..header.e_phnum as usize {
            let phdr = ProgramHeader::parse(data, header.e_phoff as usize + i * entsize)?;
            let start = phdr.p_offset as usize;
            let len = phdr.p_filesz as usize;
            let bytes = data
                .get(start..start + len)
                .ok_or(CoreFileError::Truncated { offset: start, needed: len })?
                .to_vec();
            segments.push(Segment { header: phdr, data: bytes });
        }
        Ok(Self { header, segments })
    }
}

impl std::fmt::Display for CoreFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "ELF32 type={} machine={} phoff={} phnum={}",
            self.header.e_type, self.header.e_machine, self.header.e_phoff, self.header.e_phnum
        )?;
        for segment in &self.segments {
            let h = &segment.header;
            writeln!(
                f,
                "  type={} offset=0x{:x} vaddr=0x{:08x} filesz=0x{:x} memsz=0x{:x}",
                h.p_type, h.p_offset, h.p_vaddr, h.p_filesz, h.p_memsz
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with(segments: &[(u32, u32, usize)]) -> CoreFile {
        let mut core = CoreFile::new();
        core.set_type(ET_CORE);
        core.set_machine(EM_ARM);
        for (p_type, vaddr, len) in segments {
            core.add_segment(*p_type, *vaddr, vec![0xA5; *len]);
        }
        core
    }

    #[test]
    fn test_elf_header_fields() {
        let buf = core_with(&[]).serialize().unwrap();
        assert_eq!(&buf[0..4], &ELFMAG);
        assert_eq!(buf[4], ELFCLASS32);
        assert_eq!(buf[5], ELFDATA2LSB);
        // e_type at offset 16, e_machine at 18
        assert_eq!(u16::from_le_bytes([buf[16], buf[17]]), ET_CORE);
        assert_eq!(u16::from_le_bytes([buf[18], buf[19]]), EM_ARM);
        // e_ehsize at offset 40
        assert_eq!(u16::from_le_bytes([buf[40], buf[41]]), ELF32_EHDR_SIZE as u16);
    }

    #[test]
    fn test_empty_core_layout() {
        let buf = core_with(&[]).serialize().unwrap();
        assert_eq!(buf.len(), ELF32_EHDR_SIZE);
        // e_phoff at offset 28, e_phnum at 44
        assert_eq!(u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]), ELF32_EHDR_SIZE as u32);
        assert_eq!(u16::from_le_bytes([buf[44], buf[45]]), 0);
    }

    #[test]
    fn test_segment_offsets_are_cumulative() {
        let mut core = core_with(&[(PT_NOTE, 0, 10), (PT_LOAD, 0x1000_0000, 256), (PT_LOAD, 0x2000_0000, 3)]);
        let buf = core.serialize().unwrap();

        let data_start = (ELF32_EHDR_SIZE + 3 * ELF32_PHDR_SIZE) as u32;
        let offsets: Vec<u32> = core.segments().iter().map(|s| s.header.p_offset).collect();
        assert_eq!(offsets, vec![data_start, data_start + 10, data_start + 266]);
        assert_eq!(buf.len(), data_start as usize + 269);
    }

    #[test]
    fn test_offsets_recomputed_after_mutation() {
        let mut core = core_with(&[(PT_LOAD, 0x2000_0000, 16)]);
        core.serialize().unwrap();
        core.add_segment(PT_LOAD, 0x2000_1000, vec![1; 8]);
        core.serialize().unwrap();

        let first = &core.segments()[0].header;
        assert_eq!(core.header().e_phnum, 2);
        assert_eq!(first.p_offset as usize, ELF32_EHDR_SIZE + 2 * ELF32_PHDR_SIZE);
    }

    #[test]
    fn test_memsz_never_below_filesz() {
        let mut core = core_with(&[(PT_LOAD, 0x2000_0000, 4)]);
        core.segments[0].data.extend_from_slice(&[0; 12]);
        core.segments[0].header.p_memsz = 64;
        core.update_headers().unwrap();
        assert_eq!(core.segments()[0].header.p_filesz, 16);
        assert_eq!(core.segments()[0].header.p_memsz, 64);

        core.segments[0].data.resize(100, 0);
        core.update_headers().unwrap();
        assert_eq!(core.segments()[0].header.p_memsz, 100);
    }

    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::StorageFull, "no space left"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_errors_are_reported() {
        let mut core = core_with(&[(PT_LOAD, 0x2000_0000, 16)]);
        let result = core.write_to(&mut FullDisk);
        assert!(matches!(result, Err(crate::error::DebugError::IoError(_))));

        let mut written = Vec::new();
        core.write_to(&mut written).unwrap();
        assert_eq!(written, core.serialize().unwrap());
    }

    #[test]
    fn test_parse_round_trip() {
        let mut core = core_with(&[(PT_NOTE, 0, 20), (PT_LOAD, 0xE000_ED00, 0x40)]);
        let buf = core.serialize().unwrap();
        let parsed = CoreFile::parse(&buf).unwrap();
        assert_eq!(parsed, core);
    }

    #[test]
    fn test_goblin_reads_program_headers() {
        let sizes = [(PT_LOAD, 0x1000_0000u32, 64usize), (PT_LOAD, 0x2000_0000, 128), (PT_LOAD, 0xE000_ED00, 0x40)];
        let buf = core_with(&sizes).serialize().unwrap();

        let elf = goblin::elf::Elf::parse(&buf).unwrap();
        assert_eq!(elf.header.e_type, goblin::elf::header::ET_CORE);
        assert_eq!(elf.header.e_machine, goblin::elf::header::EM_ARM);
        assert_eq!(elf.program_headers.len(), 3);
        for (phdr, (_, vaddr, len)) in elf.program_headers.iter().zip(sizes.iter()) {
            assert_eq!(phdr.p_vaddr, *vaddr as u64);
            assert_eq!(phdr.p_filesz, *len as u64);
        }
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(CoreFile::parse(b"short"), Err(CoreFileError::Truncated { .. })));
        assert!(matches!(CoreFile::parse(&[0u8; 64]), Err(CoreFileError::BadMagic)));

        let mut buf = core_with(&[(PT_LOAD, 0, 8)]).serialize().unwrap();
        buf.truncate(buf.len() - 4);
        assert!(CoreFile::parse(&buf).is_err());
    }
}
