//! The copy-on-write memory bank.
//!
//! A [`MemoryBank`] is a monotonically-growing pool of 4 KiB pages backing
//! the private copies a prepared or forked machine produces on write
//! faults.  The pool is one anonymous slab installed as its own KVM memory
//! slot just above main guest memory; pages are handed out in allocation
//! order and only reclaimed wholesale by [`MemoryBank::reset`].
//!
//! Each banked page records the guest virtual address it shadows and the
//! page-table entry it replaced, which is exactly the information a reset
//! needs to unmap the copies in reverse allocation order.

use crate::error::{MachineError, Result};
use crate::layout::PAGE_SIZE;
use crate::memory::anon_memory;
use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap};

/// One page handed out by the bank.
#[derive(Debug, Clone, Copy)]
pub struct BankPage {
    /// Guest virtual address this page shadows.
    pub gva: u64,
    /// Guest physical address of the banked copy (inside the bank slot).
    pub gpa: u64,
    /// The leaf PTE value that was replaced when the copy was installed.
    pub original_pte: u64,
}

/// Pool of page-aligned slabs backing copy-on-write duplicates.
#[derive(Debug)]
pub struct MemoryBank {
    mem: GuestMemoryMmap,
    bank_gpa: u64,
    capacity_pages: u64,
    pages: Vec<BankPage>,
}

impl MemoryBank {
    /// Create a bank of `max_cow_mem` bytes, installed at guest physical
    /// address `bank_gpa`.
    pub fn new(bank_gpa: u64, max_cow_mem: u64, hugepages: bool) -> Result<Self> {
        if max_cow_mem == 0 || max_cow_mem % PAGE_SIZE != 0 {
            return Err(MachineError::Config(format!(
                "max_cow_mem must be a non-zero multiple of {PAGE_SIZE} bytes, got {max_cow_mem}"
            )));
        }
        let mem = anon_memory(bank_gpa, max_cow_mem as usize, hugepages)?;
        Ok(Self {
            mem,
            bank_gpa,
            capacity_pages: max_cow_mem / PAGE_SIZE,
            pages: Vec::new(),
        })
    }

    /// Allocate the next free page for `gva`, remembering the PTE it
    /// replaces.  Fails with the memory exception when the configured
    /// working-memory ceiling is reached.
    pub fn allocate(&mut self, gva: u64, original_pte: u64) -> Result<BankPage> {
        if self.pages.len() as u64 >= self.capacity_pages {
            return Err(MachineError::MemoryException {
                msg: "memory bank exhausted",
                addr: gva,
                size: self.capacity_pages * PAGE_SIZE,
            });
        }
        let page = BankPage {
            gva,
            gpa: self.bank_gpa + self.pages.len() as u64 * PAGE_SIZE,
            original_pte,
        };
        self.pages.push(page);
        Ok(page)
    }

    /// Pages currently handed out.
    #[inline]
    pub fn pages_in_use(&self) -> usize {
        self.pages.len()
    }

    /// Banked pages in allocation order.
    #[inline]
    pub fn pages(&self) -> &[BankPage] {
        &self.pages
    }

    /// Take the allocation list, leaving the bank empty but keeping the
    /// slab.  Used by the reset walk, which restores mappings in reverse.
    pub fn take_pages(&mut self) -> Vec<BankPage> {
        std::mem::take(&mut self.pages)
    }

    /// Rewind the bank.  When `free_work_mem` is set the slab is returned
    /// to the OS with `MADV_DONTNEED`; otherwise it is reused as-is (every
    /// future allocation rewrites its page in full before the guest sees
    /// it).
    pub fn reset(&mut self, free_work_mem: bool) {
        self.pages.clear();
        if free_work_mem {
            let ptr = self.host_address() as *mut libc::c_void;
            let len = (self.capacity_pages * PAGE_SIZE) as usize;
            // SAFETY: the slab is a private anonymous mapping owned by
            // `self.mem`; dropping its contents is the point.
            unsafe {
                libc::madvise(ptr, len, libc::MADV_DONTNEED);
            }
        }
    }

    /// Guest physical address of the first bank page.
    #[inline]
    pub fn gpa(&self) -> u64 {
        self.bank_gpa
    }

    /// Capacity in bytes.
    #[inline]
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_pages * PAGE_SIZE
    }

    /// Whether `gpa` falls inside the bank's slot.
    #[inline]
    pub fn contains_gpa(&self, gpa: u64) -> bool {
        gpa >= self.bank_gpa && gpa < self.bank_gpa + self.capacity_bytes()
    }

    /// The backing memory object (one region at [`Self::gpa`]).
    #[inline]
    pub fn memory(&self) -> &GuestMemoryMmap {
        &self.mem
    }

    /// Host virtual address of the slab, for KVM slot registration.
    pub fn host_address(&self) -> u64 {
        self.mem
            .get_host_address(GuestAddress(self.bank_gpa))
            .expect("bank slab host address must resolve") as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bank(pages: u64) -> MemoryBank {
        MemoryBank::new(0x1000_0000, pages * PAGE_SIZE, false).unwrap()
    }

    #[test]
    fn pages_come_out_in_allocation_order() {
        let mut bank = test_bank(4);
        let a = bank.allocate(0x40_0000, 0xdead).unwrap();
        let b = bank.allocate(0x41_0000, 0xbeef).unwrap();
        assert_eq!(a.gpa, 0x1000_0000);
        assert_eq!(b.gpa, 0x1000_1000);
        assert_eq!(bank.pages_in_use(), 2);
    }

    #[test]
    fn records_gva_and_original_pte() {
        let mut bank = test_bank(1);
        let page = bank.allocate(0x42_3000, 0x42_3005).unwrap();
        assert_eq!(page.gva, 0x42_3000);
        assert_eq!(page.original_pte, 0x42_3005);
    }

    #[test]
    fn exhaustion_raises_memory_exception() {
        let mut bank = test_bank(1);
        bank.allocate(0x40_0000, 0).unwrap();
        let err = bank.allocate(0x40_1000, 0).unwrap_err();
        assert!(matches!(err, MachineError::MemoryException { .. }));
    }

    #[test]
    fn reset_rewinds_without_losing_capacity() {
        let mut bank = test_bank(2);
        bank.allocate(0x40_0000, 0).unwrap();
        bank.allocate(0x40_1000, 0).unwrap();
        bank.reset(false);
        assert_eq!(bank.pages_in_use(), 0);
        // Full capacity is available again, from the start of the slab.
        let again = bank.allocate(0x50_0000, 0).unwrap();
        assert_eq!(again.gpa, 0x1000_0000);
    }

    #[test]
    fn reset_with_free_work_mem_releases_pages() {
        let mut bank = test_bank(2);
        bank.allocate(0x40_0000, 0).unwrap();
        bank.reset(true);
        assert_eq!(bank.pages_in_use(), 0);
    }

    #[test]
    fn rejects_unaligned_capacity() {
        let err = MemoryBank::new(0x1000_0000, PAGE_SIZE + 1, false).unwrap_err();
        assert!(matches!(err, MachineError::Config(_)));
    }

    #[test]
    fn gpa_containment() {
        let bank = test_bank(2);
        assert!(bank.contains_gpa(0x1000_0000));
        assert!(bank.contains_gpa(0x1000_1fff));
        assert!(!bank.contains_gpa(0x1000_2000));
        assert!(!bank.contains_gpa(0x0fff_ffff));
    }
}
