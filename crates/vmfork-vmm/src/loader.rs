//! Guest binary loading.
//!
//! Accepts statically linked ELF64 executables for x86_64, loaded 1:1 at
//! their `PT_LOAD` virtual addresses (which the identity mapping turns
//! into guest physical addresses).  Segment bytes are copied by the
//! `linux-loader` ELF loader; this module validates the binary up front
//! and scans the program headers itself for the pieces the loader does
//! not report: per-segment permissions for W^X page-table flags, the
//! image bounds, and the entry point.

use crate::error::{MachineError, Result};
use crate::layout::{page_align_down, page_align_up};
use crate::memory::VmMemory;
use linux_loader::loader::elf::Elf;
use linux_loader::loader::KernelLoader;
use log::info;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

/// `p_flags` executable bit.
pub const PF_X: u32 = 1;
/// `p_flags` writable bit.
pub const PF_W: u32 = 2;
/// `p_flags` readable bit.
pub const PF_R: u32 = 4;

/// One loadable segment, as the page-table builder needs to see it.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u64,
    pub memsz: u64,
    pub flags: u32,
}

/// Result of loading a guest executable.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// ELF entry point (`e_entry`).
    pub entry: u64,
    /// Lowest loadable address, page-aligned down.
    pub image_base: u64,
    /// One past the highest loadable address, page-aligned up. The heap
    /// starts here.
    pub image_end: u64,
    pub segments: Vec<Segment>,
}

fn invalid(reason: impl Into<String>) -> MachineError {
    MachineError::InvalidBinary(reason.into())
}

fn read_u16(b: &[u8], off: usize) -> Result<u16> {
    b.get(off..off + 2)
        .map(|s| u16::from_le_bytes(s.try_into().unwrap()))
        .ok_or_else(|| invalid("truncated header"))
}

fn read_u32(b: &[u8], off: usize) -> Result<u32> {
    b.get(off..off + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .ok_or_else(|| invalid("truncated header"))
}

fn read_u64(b: &[u8], off: usize) -> Result<u64> {
    b.get(off..off + 8)
        .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
        .ok_or_else(|| invalid("truncated header"))
}

/// Validate `binary` and copy its loadable segments into guest memory.
///
/// The machine must not be prepared yet: segment bytes are written
/// straight into main memory.  BSS needs no explicit zeroing — the
/// backing pages are freshly mapped.
pub fn load_elf(mem: &VmMemory, binary: &[u8]) -> Result<LoadedImage> {
    let image = scan_elf(binary)?;

    if image.image_base < mem.kernel_end() {
        return Err(invalid(format!(
            "image base 0x{:x} overlaps the kernel region ending at 0x{:x}",
            image.image_base,
            mem.kernel_end()
        )));
    }
    if image.image_end > mem.max_mem() {
        return Err(invalid(format!(
            "image end 0x{:x} exceeds guest memory of 0x{:x} bytes",
            image.image_end,
            mem.max_mem()
        )));
    }

    let mut cursor = std::io::Cursor::new(binary);
    Elf::load(mem.main_memory(), None, &mut cursor, None).map_err(MachineError::ElfLoad)?;

    info!(
        "guest image loaded: entry 0x{:x}, 0x{:x}..0x{:x} ({} segments)",
        image.entry,
        image.image_base,
        image.image_end,
        image.segments.len()
    );
    Ok(image)
}

/// Parse and validate the ELF header and program headers without copying
/// any bytes.
pub fn scan_elf(binary: &[u8]) -> Result<LoadedImage> {
    if binary.len() < 64 {
        return Err(invalid("shorter than an ELF64 header"));
    }
    if binary[..4] != ELF_MAGIC {
        return Err(invalid("bad ELF magic"));
    }
    if binary[4] != ELFCLASS64 || binary[5] != ELFDATA2LSB {
        return Err(invalid("not a little-endian ELF64"));
    }
    let e_type = read_u16(binary, 16)?;
    if e_type != ET_EXEC {
        return Err(invalid(
            "not a static executable (dynamic or relocatable objects are unsupported)",
        ));
    }
    if read_u16(binary, 18)? != EM_X86_64 {
        return Err(invalid("not an x86_64 binary"));
    }

    let entry = read_u64(binary, 24)?;
    let phoff = read_u64(binary, 32)? as usize;
    let phentsize = read_u16(binary, 54)? as usize;
    let phnum = read_u16(binary, 56)? as usize;
    if phentsize < 56 {
        return Err(invalid("bad program header entry size"));
    }

    let mut segments = Vec::new();
    let mut image_base = u64::MAX;
    let mut image_end = 0u64;
    for i in 0..phnum {
        let off = phoff + i * phentsize;
        if read_u32(binary, off)? != PT_LOAD {
            continue;
        }
        let flags = read_u32(binary, off + 4)?;
        let vaddr = read_u64(binary, off + 16)?;
        let paddr = read_u64(binary, off + 24)?;
        let filesz = read_u64(binary, off + 32)?;
        let memsz = read_u64(binary, off + 40)?;
        if memsz == 0 {
            continue;
        }
        if paddr != vaddr {
            return Err(invalid(format!(
                "segment {i} has p_paddr 0x{paddr:x} != p_vaddr 0x{vaddr:x}; \
                 1:1 placement required"
            )));
        }
        if filesz > memsz {
            return Err(invalid(format!("segment {i} has p_filesz > p_memsz")));
        }
        image_base = image_base.min(page_align_down(vaddr));
        image_end = image_end.max(page_align_up(vaddr + memsz));
        segments.push(Segment {
            vaddr,
            memsz,
            flags,
        });
    }

    if segments.is_empty() {
        return Err(invalid("no loadable segments"));
    }
    let entry_ok = segments
        .iter()
        .any(|s| s.flags & PF_X != 0 && entry >= s.vaddr && entry < s.vaddr + s.memsz);
    if !entry_ok {
        return Err(invalid(format!(
            "entry point 0x{entry:x} is outside every executable segment"
        )));
    }

    Ok(LoadedImage {
        entry,
        image_base,
        image_end,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testelf;

    #[test]
    fn scans_a_minimal_executable() {
        let elf = testelf::static_executable(0x40_0000, &[0xc3], &[]);
        let image = scan_elf(&elf).unwrap();
        assert_eq!(image.entry, 0x40_0000 + testelf::CODE_OFFSET);
        assert_eq!(image.image_base, 0x40_0000 + testelf::CODE_OFFSET);
        assert!(image.image_end > image.image_base);
        assert_eq!(image.segments.len(), 1);
        assert!(image.segments[0].flags & PF_X != 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut elf = testelf::static_executable(0x40_0000, &[0xc3], &[]);
        elf[0] = 0;
        assert!(matches!(
            scan_elf(&elf).unwrap_err(),
            MachineError::InvalidBinary(_)
        ));
    }

    #[test]
    fn rejects_relocatable_objects() {
        let mut elf = testelf::static_executable(0x40_0000, &[0xc3], &[]);
        elf[16] = 1; // ET_REL
        assert!(scan_elf(&elf).is_err());
    }

    #[test]
    fn rejects_wrong_architecture() {
        let mut elf = testelf::static_executable(0x40_0000, &[0xc3], &[]);
        elf[18] = 0x28; // EM_ARM
        assert!(scan_elf(&elf).is_err());
    }

    #[test]
    fn includes_data_segment_bounds() {
        let elf = testelf::static_executable(0x40_0000, &[0xc3], &[0x11, 0x22]);
        let image = scan_elf(&elf).unwrap();
        assert_eq!(image.segments.len(), 2);
        // Data lands on the page after the code page; the image ends at
        // the data page's boundary.
        assert_eq!(image.image_end, 0x40_0000 + testelf::DATA_OFFSET + 0x1000);
    }

    #[test]
    fn truncated_binary_is_rejected() {
        assert!(scan_elf(&[0x7f, b'E', b'L']).is_err());
    }
}
