//! x86_64 4-level page tables built inside guest physical memory.
//!
//! The monitor identity-maps guest virtual onto guest physical addresses
//! with 4 KiB leaf pages, which is what makes page-granular copy-on-write
//! possible: a fork redirects individual leaf entries into its memory
//! bank without touching its neighbours.
//!
//! All tables live in the kernel region between [`PT_BASE`] and
//! `kernel_end`; the last [`REMOTE_SPARE_TABLES`] pages of that region are
//! reserved for mapping the remote window on demand.  Because a fork
//! carries a private copy of the whole kernel region, its tables sit at
//! the same guest physical addresses as its parent's — CR3 never changes,
//! which is what the per-exit integrity check relies on.

use crate::error::{MachineError, Result};
use crate::layout::{kernel_end, PAGE_SIZE, PT_BASE, REMOTE_SPARE_TABLES};
use crate::memory::VmMemory;

// ─── PTE flag bits ───────────────────────────────────────────────────

pub const PTE_PRESENT: u64 = 1 << 0;
pub const PTE_RW: u64 = 1 << 1;
pub const PTE_USER: u64 = 1 << 2;
pub const PTE_ACCESSED: u64 = 1 << 5;
pub const PTE_DIRTY: u64 = 1 << 6;
/// Page-size bit in a directory entry (2 MiB mapping). Never set by the
/// builder; the walker refuses it defensively.
pub const PTE_PS: u64 = 1 << 7;
pub const PTE_NX: u64 = 1 << 63;

/// Physical-address bits of a table or leaf entry.
pub const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Flags every non-leaf entry carries: protection is enforced at the
/// leaf, so intermediates are permissive.
const TABLE_FLAGS: u64 = PTE_PRESENT | PTE_RW | PTE_USER;

#[inline]
fn table_index(gva: u64, level: u32) -> u64 {
    // level 3 = PML4, 0 = leaf table.
    (gva >> (12 + 9 * level)) & 0x1ff
}

// ─── Builder ─────────────────────────────────────────────────────────

/// Allocates table pages sequentially from the kernel page-table region
/// and installs mappings.  Used once, at machine construction.
pub struct PageTableBuilder {
    next_table: u64,
    limit: u64,
}

impl PageTableBuilder {
    /// The PML4 occupies [`PT_BASE`]; further tables are carved from the
    /// pages after it, up to the remote-window spares.
    pub fn new(max_mem: u64) -> Self {
        Self {
            next_table: PT_BASE + PAGE_SIZE,
            limit: kernel_end(max_mem) - REMOTE_SPARE_TABLES * PAGE_SIZE,
        }
    }

    fn alloc_table(&mut self, mem: &VmMemory) -> Result<u64> {
        if self.next_table >= self.limit {
            return Err(MachineError::machine(
                "page-table region exhausted during build",
                self.next_table,
            ));
        }
        let gpa = self.next_table;
        self.next_table += PAGE_SIZE;
        // Fresh anonymous memory is already zeroed, but the region may be
        // rebuilt in place (e.g. tests); clear it explicitly.
        mem.write_phys(gpa, &[0u8; PAGE_SIZE as usize])?;
        Ok(gpa)
    }

    /// Map the 4 KiB page at `gva` to physical `phys` with `flags`
    /// (leaf flags; `PTE_PRESENT` is implied).
    pub fn map_page(&mut self, mem: &VmMemory, gva: u64, phys: u64, flags: u64) -> Result<()> {
        let mut table = PT_BASE;
        for level in (1..=3).rev() {
            let entry_addr = table + table_index(gva, level) * 8;
            let entry: u64 = mem.read_obj_phys(entry_addr)?;
            table = if entry & PTE_PRESENT != 0 {
                entry & PTE_ADDR_MASK
            } else {
                let new_table = self.alloc_table(mem)?;
                mem.write_obj_phys(entry_addr, new_table | TABLE_FLAGS)?;
                new_table
            };
        }
        let leaf_addr = table + table_index(gva, 0) * 8;
        mem.write_obj_phys(leaf_addr, (phys & PTE_ADDR_MASK) | flags | PTE_PRESENT)
    }

    /// Identity-map `[gva, gva + len)` page by page.
    pub fn map_range(&mut self, mem: &VmMemory, gva: u64, len: u64, flags: u64) -> Result<()> {
        let end = gva + len;
        let mut page = gva & !(PAGE_SIZE - 1);
        while page < end {
            self.map_page(mem, page, page, flags)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }
}

// ─── Walkers ─────────────────────────────────────────────────────────

/// Guest physical address of the leaf PTE covering `gva`, if every
/// intermediate level is present.
pub fn leaf_entry_addr(mem: &VmMemory, gva: u64) -> Result<Option<u64>> {
    let mut table = PT_BASE;
    for level in (1..=3).rev() {
        let entry: u64 = mem.read_obj_phys(table + table_index(gva, level) * 8)?;
        if entry & PTE_PRESENT == 0 {
            return Ok(None);
        }
        if entry & PTE_PS != 0 {
            return Err(MachineError::machine("unexpected large-page mapping", gva));
        }
        table = entry & PTE_ADDR_MASK;
    }
    Ok(Some(table + table_index(gva, 0) * 8))
}

/// The leaf PTE covering `gva`, if mapped.
pub fn leaf_entry(mem: &VmMemory, gva: u64) -> Result<Option<u64>> {
    match leaf_entry_addr(mem, gva)? {
        Some(addr) => Ok(Some(mem.read_obj_phys(addr)?)),
        None => Ok(None),
    }
}

/// Overwrite the leaf PTE covering `gva`. The entry chain must exist.
pub fn set_leaf(mem: &VmMemory, gva: u64, pte: u64) -> Result<()> {
    let addr = leaf_entry_addr(mem, gva)?
        .ok_or(MachineError::machine("unmapped virtual address", gva))?;
    mem.write_obj_phys(addr, pte)
}

/// Translate a guest virtual address to guest physical, walking the live
/// tables. Returns `None` when unmapped.
pub fn translate(mem: &VmMemory, gva: u64) -> Result<Option<u64>> {
    match leaf_entry(mem, gva)? {
        Some(pte) if pte & PTE_PRESENT != 0 => {
            Ok(Some((pte & PTE_ADDR_MASK) | (gva & (PAGE_SIZE - 1))))
        }
        _ => Ok(None),
    }
}

/// Strip the writable bit from every present leaf entry whose virtual
/// address lies in `[low, high)`. Returns the number of entries changed.
///
/// This is the core of `prepare_copy_on_write`: after it runs, every
/// guest write below the shared boundary faults into the memory bank.
pub fn strip_write_range(mem: &VmMemory, low: u64, high: u64) -> Result<u64> {
    let mut stripped = 0;
    let pml4: [u64; 512] = read_table(mem, PT_BASE)?;
    for (i4, &e4) in pml4.iter().enumerate() {
        if e4 & PTE_PRESENT == 0 {
            continue;
        }
        let pdpt_gpa = e4 & PTE_ADDR_MASK;
        let pdpt: [u64; 512] = read_table(mem, pdpt_gpa)?;
        for (i3, &e3) in pdpt.iter().enumerate() {
            if e3 & PTE_PRESENT == 0 {
                continue;
            }
            let pd_gpa = e3 & PTE_ADDR_MASK;
            let pd: [u64; 512] = read_table(mem, pd_gpa)?;
            for (i2, &e2) in pd.iter().enumerate() {
                if e2 & PTE_PRESENT == 0 {
                    continue;
                }
                let pt_gpa = e2 & PTE_ADDR_MASK;
                let pt: [u64; 512] = read_table(mem, pt_gpa)?;
                for (i1, &e1) in pt.iter().enumerate() {
                    if e1 & PTE_PRESENT == 0 || e1 & PTE_RW == 0 {
                        continue;
                    }
                    let gva = ((i4 as u64) << 39)
                        | ((i3 as u64) << 30)
                        | ((i2 as u64) << 21)
                        | ((i1 as u64) << 12);
                    if gva >= low && gva < high {
                        mem.write_obj_phys(pt_gpa + i1 as u64 * 8, e1 & !PTE_RW)?;
                        stripped += 1;
                    }
                }
            }
        }
    }
    Ok(stripped)
}

/// Map one page of the remote window, creating intermediate tables from
/// the reserved spare pool as needed.
pub fn map_remote_page(mem: &mut VmMemory, gva: u64, pte: u64) -> Result<()> {
    let mut table = PT_BASE;
    for level in (1..=3).rev() {
        let entry_addr = table + table_index(gva, level) * 8;
        let entry: u64 = mem.read_obj_phys(entry_addr)?;
        table = if entry & PTE_PRESENT != 0 {
            entry & PTE_ADDR_MASK
        } else {
            let new_table = mem.alloc_spare_table()?;
            mem.write_phys(new_table, &[0u8; PAGE_SIZE as usize])?;
            mem.write_obj_phys(entry_addr, new_table | TABLE_FLAGS)?;
            new_table
        };
    }
    mem.write_obj_phys(table + table_index(gva, 0) * 8, pte)
}

/// Dump the mapped ranges with their effective flags through `out`.
/// Adjacent pages with identical flags are coalesced.
pub fn dump_pagetables(mem: &VmMemory, out: &mut dyn FnMut(&str)) {
    let mut run_start: Option<u64> = None;
    let mut run_end = 0u64;
    let mut run_flags = 0u64;
    let mut flush = |start: &mut Option<u64>, end: u64, flags: u64, out: &mut dyn FnMut(&str)| {
        if let Some(s) = start.take() {
            out(&format!(
                "0x{:012x}..0x{:012x}  {}{}{}{}\n",
                s,
                end,
                if flags & PTE_USER != 0 { "u" } else { "k" },
                if flags & PTE_RW != 0 { "w" } else { "-" },
                if flags & PTE_NX != 0 { "-" } else { "x" },
                if flags & PTE_DIRTY != 0 { " dirty" } else { "" },
            ));
        }
    };
    let Ok(pml4) = read_table(mem, PT_BASE) else {
        return;
    };
    for (i4, &e4) in pml4.iter().enumerate() {
        if e4 & PTE_PRESENT == 0 {
            continue;
        }
        let Ok(pdpt) = read_table(mem, e4 & PTE_ADDR_MASK) else {
            continue;
        };
        for (i3, &e3) in pdpt.iter().enumerate() {
            if e3 & PTE_PRESENT == 0 {
                continue;
            }
            let Ok(pd) = read_table(mem, e3 & PTE_ADDR_MASK) else {
                continue;
            };
            for (i2, &e2) in pd.iter().enumerate() {
                if e2 & PTE_PRESENT == 0 {
                    continue;
                }
                let Ok(pt) = read_table(mem, e2 & PTE_ADDR_MASK) else {
                    continue;
                };
                for (i1, &e1) in pt.iter().enumerate() {
                    let gva = ((i4 as u64) << 39)
                        | ((i3 as u64) << 30)
                        | ((i2 as u64) << 21)
                        | ((i1 as u64) << 12);
                    let flags = e1 & (PTE_USER | PTE_RW | PTE_NX | PTE_DIRTY);
                    if e1 & PTE_PRESENT == 0 {
                        flush(&mut run_start, run_end, run_flags, out);
                        continue;
                    }
                    match run_start {
                        Some(_) if gva == run_end && flags == run_flags => run_end = gva + PAGE_SIZE,
                        _ => {
                            flush(&mut run_start, run_end, run_flags, out);
                            run_start = Some(gva);
                            run_end = gva + PAGE_SIZE;
                            run_flags = flags;
                        }
                    }
                }
            }
        }
    }
    flush(&mut run_start, run_end, run_flags, out);
}

fn read_table(mem: &VmMemory, gpa: u64) -> Result<[u64; 512]> {
    let bytes = mem.at(gpa, PAGE_SIZE as usize)?;
    let mut table = [0u64; 512];
    for (i, chunk) in bytes.chunks_exact(8).enumerate() {
        table[i] = u64::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VmMemory;

    const MEM: u64 = 16 * 1024 * 1024;

    fn fresh_memory() -> VmMemory {
        VmMemory::new(MEM, false).unwrap()
    }

    #[test]
    fn identity_map_translates() {
        let mem = fresh_memory();
        let mut builder = PageTableBuilder::new(MEM);
        builder
            .map_range(&mem, 0x40_0000, 0x4000, PTE_USER | PTE_RW)
            .unwrap();
        assert_eq!(translate(&mem, 0x40_0000).unwrap(), Some(0x40_0000));
        assert_eq!(translate(&mem, 0x40_1234).unwrap(), Some(0x40_1234));
        assert_eq!(translate(&mem, 0x50_0000).unwrap(), None);
    }

    #[test]
    fn leaf_flags_round_trip() {
        let mem = fresh_memory();
        let mut builder = PageTableBuilder::new(MEM);
        builder
            .map_page(&mem, 0x40_0000, 0x40_0000, PTE_USER | PTE_NX)
            .unwrap();
        let pte = leaf_entry(&mem, 0x40_0000).unwrap().unwrap();
        assert_eq!(pte & PTE_USER, PTE_USER);
        assert_eq!(pte & PTE_NX, PTE_NX);
        assert_eq!(pte & PTE_RW, 0);
        assert_eq!(pte & PTE_ADDR_MASK, 0x40_0000);
    }

    #[test]
    fn set_leaf_redirects_translation() {
        let mem = fresh_memory();
        let mut builder = PageTableBuilder::new(MEM);
        builder
            .map_page(&mem, 0x40_0000, 0x40_0000, PTE_USER | PTE_RW)
            .unwrap();
        set_leaf(&mem, 0x40_0000, 0x80_0000 | PTE_PRESENT | PTE_USER | PTE_RW).unwrap();
        assert_eq!(translate(&mem, 0x40_0040).unwrap(), Some(0x80_0040));
    }

    #[test]
    fn strip_write_respects_bounds() {
        let mem = fresh_memory();
        let mut builder = PageTableBuilder::new(MEM);
        builder
            .map_range(&mem, 0x40_0000, 3 * PAGE_SIZE, PTE_USER | PTE_RW)
            .unwrap();
        let stripped = strip_write_range(&mem, 0x40_0000, 0x40_2000).unwrap();
        assert_eq!(stripped, 2);
        let a = leaf_entry(&mem, 0x40_0000).unwrap().unwrap();
        let c = leaf_entry(&mem, 0x40_2000).unwrap().unwrap();
        assert_eq!(a & PTE_RW, 0);
        assert_eq!(c & PTE_RW, PTE_RW);
    }

    #[test]
    fn unmapped_set_leaf_is_an_error() {
        let mem = fresh_memory();
        let err = set_leaf(&mem, 0x7000_0000, 0).unwrap_err();
        assert!(matches!(err, MachineError::MachineException { .. }));
    }

    #[test]
    fn remote_mapping_uses_spare_tables() {
        let mut mem = fresh_memory();
        let mut builder = PageTableBuilder::new(MEM);
        builder
            .map_page(&mem, 0x40_0000, 0x40_0000, PTE_USER | PTE_RW)
            .unwrap();
        let window_gva = crate::layout::REMOTE_WINDOW_BASE + 0x40_0000;
        map_remote_page(
            &mut mem,
            window_gva,
            0x90_0000 | PTE_PRESENT | PTE_USER,
        )
        .unwrap();
        assert_eq!(translate(&mem, window_gva).unwrap(), Some(0x90_0000));
        // The original low mapping is untouched.
        assert_eq!(translate(&mem, 0x40_0000).unwrap(), Some(0x40_0000));
    }
}
