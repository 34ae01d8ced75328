//! Minimal static-executable synthesis.
//!
//! Tests, demos and benchmarks need tiny guest programs without dragging
//! a cross toolchain into the build.  This module emits just enough of an
//! ELF64 executable to satisfy the loader: a header, one `PT_LOAD` for
//! hand-assembled code and optionally one for data.
//!
//! The code segment lands at `base + CODE_OFFSET`, the data segment at
//! `base + DATA_OFFSET`; the entry point is the first code byte.

/// File and virtual offset of the code segment relative to `base`.
pub const CODE_OFFSET: u64 = 0x1000;

/// File and virtual offset of the data segment relative to `base`.
pub const DATA_OFFSET: u64 = 0x2000;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

fn phdr(flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) -> [u8; PHDR_SIZE] {
    let mut p = [0u8; PHDR_SIZE];
    p[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    p[4..8].copy_from_slice(&flags.to_le_bytes());
    p[8..16].copy_from_slice(&offset.to_le_bytes());
    p[16..24].copy_from_slice(&vaddr.to_le_bytes());
    p[24..32].copy_from_slice(&vaddr.to_le_bytes()); // p_paddr == p_vaddr
    p[32..40].copy_from_slice(&filesz.to_le_bytes());
    p[40..48].copy_from_slice(&memsz.to_le_bytes());
    p[48..56].copy_from_slice(&0x1000u64.to_le_bytes()); // p_align
    p
}

/// Build a static ELF64 executable with `code` at `base + CODE_OFFSET`
/// (read-execute) and, when non-empty, `data` at `base + DATA_OFFSET`
/// (read-write).  The entry point is the start of `code`.
///
/// # Panics
///
/// Panics if a segment exceeds one page or `base` is not page-aligned.
pub fn static_executable(base: u64, code: &[u8], data: &[u8]) -> Vec<u8> {
    assert!(base % 0x1000 == 0, "base must be page-aligned");
    assert!(code.len() <= 0x1000, "code segment limited to one page");
    assert!(data.len() <= 0x1000, "data segment limited to one page");

    let phnum: u16 = if data.is_empty() { 1 } else { 2 };
    let entry = base + CODE_OFFSET;

    let mut ehdr = [0u8; EHDR_SIZE];
    ehdr[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    ehdr[4] = 2; // ELFCLASS64
    ehdr[5] = 1; // ELFDATA2LSB
    ehdr[6] = 1; // EV_CURRENT
    ehdr[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    ehdr[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    ehdr[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    ehdr[24..32].copy_from_slice(&entry.to_le_bytes());
    ehdr[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
    ehdr[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    ehdr[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    ehdr[56..58].copy_from_slice(&phnum.to_le_bytes());

    let mut file = vec![0u8; CODE_OFFSET as usize];
    file[..EHDR_SIZE].copy_from_slice(&ehdr);

    let code_ph = phdr(
        5, // PF_R | PF_X
        CODE_OFFSET,
        base + CODE_OFFSET,
        code.len() as u64,
        code.len() as u64,
    );
    file[EHDR_SIZE..EHDR_SIZE + PHDR_SIZE].copy_from_slice(&code_ph);
    if !data.is_empty() {
        let data_ph = phdr(
            6, // PF_R | PF_W
            DATA_OFFSET,
            base + DATA_OFFSET,
            data.len() as u64,
            data.len() as u64,
        );
        file[EHDR_SIZE + PHDR_SIZE..EHDR_SIZE + 2 * PHDR_SIZE].copy_from_slice(&data_ph);
    }

    file.extend_from_slice(code);
    if !data.is_empty() {
        file.resize(DATA_OFFSET as usize, 0);
        file.extend_from_slice(data);
    }
    file
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_points_at_code() {
        let elf = static_executable(0x40_0000, &[0x90, 0xc3], &[]);
        let entry = u64::from_le_bytes(elf[24..32].try_into().unwrap());
        assert_eq!(entry, 0x40_0000 + CODE_OFFSET);
        assert_eq!(&elf[CODE_OFFSET as usize..CODE_OFFSET as usize + 2], &[0x90, 0xc3]);
    }

    #[test]
    fn data_segment_bytes_land_at_data_offset() {
        let elf = static_executable(0x40_0000, &[0xc3], &[0xaa, 0xbb]);
        assert_eq!(
            &elf[DATA_OFFSET as usize..DATA_OFFSET as usize + 2],
            &[0xaa, 0xbb]
        );
    }

    #[test]
    #[should_panic(expected = "page-aligned")]
    fn unaligned_base_panics() {
        static_executable(0x40_0100, &[0xc3], &[]);
    }
}
