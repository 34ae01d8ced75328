//! Guest memory ownership, translation and the copy-on-write fabric.
//!
//! [`VmMemory`] owns every host-backed allocation a machine installs into
//! KVM and routes guest physical ranges to host slices across them:
//!
//! - **main** — the contiguous guest physical space `[0, max_mem)`.  For
//!   a fork this is a cheap clone of the parent's mapping (the regions
//!   are `Arc`-shared), installed read-only below the shared boundary.
//! - **kernel copy** — a fork's private copy of `[0, kernel_end)`:
//!   descriptor tables, interrupt stubs and, crucially, the page tables,
//!   so a fork can remap leaves without disturbing its parent.
//! - **bank** — the [`MemoryBank`] backing copy-on-write duplicates.
//!
//! Writes from the host go through the same copy-on-write discipline as
//! guest writes: on a prepared machine, `copy_to_guest` faults pages into
//! the bank instead of touching the pristine image.

use crate::bank::MemoryBank;
use crate::error::{MachineError, Result};
use crate::layout::{kernel_end as layout_kernel_end, PAGE_SIZE, PT_BASE, REMOTE_SPARE_TABLES};
use crate::pagetables::{self, PTE_ADDR_MASK, PTE_DIRTY, PTE_NX, PTE_PRESENT, PTE_RW, PTE_USER};
use kvm_bindings::{kvm_userspace_memory_region, KVM_MEM_READONLY};
use kvm_ioctls::VmFd;
use log::debug;
use vm_memory::{
    Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestRegionMmap, MmapRegion,
};

// ─── KVM slot layout ─────────────────────────────────────────────────

/// Whole guest physical space, pre-prepare.
pub const SLOT_MAIN: u32 = 0;
/// Kernel region `[0, kernel_end)` after prepare (private per fork).
pub const SLOT_KERNEL: u32 = 0;
/// Image region `[kernel_end, boundary)`, read-only after prepare.
pub const SLOT_IMAGE: u32 = 1;
/// Shared scratch `[boundary, max_mem)`, writable, not CoW-tracked.
pub const SLOT_SHARED: u32 = 2;
/// The memory bank slot.
pub const SLOT_BANK: u32 = 3;
/// First slot used for remote-window projections.
pub const SLOT_REMOTE_BASE: u32 = 16;

/// Guest physical base where a remote machine's memory is projected.
pub const REMOTE_GPA_BASE: u64 = 0x80_0000_0000;

/// Allocate an anonymous, zeroed guest memory object of `size` bytes at
/// guest physical `gpa`.  With `hugepages` a 2 MiB-backed mapping is
/// attempted first, falling back to normal pages.
pub(crate) fn anon_memory(gpa: u64, size: usize, hugepages: bool) -> Result<GuestMemoryMmap> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    let region = if hugepages {
        MmapRegion::build(None, size, prot, flags | libc::MAP_HUGETLB).or_else(|_| {
            debug!("hugepage backing unavailable, falling back to 4 KiB pages");
            MmapRegion::build(None, size, prot, flags)
        })
    } else {
        MmapRegion::build(None, size, prot, flags)
    }
    .map_err(|_| MachineError::MemoryCreate { size })?;

    let region = GuestRegionMmap::new(region, GuestAddress(gpa))
        .ok_or(MachineError::MemoryCreate { size })?;
    GuestMemoryMmap::from_regions(vec![region]).map_err(|_| MachineError::MemoryCreate { size })
}

/// Descriptor for a host-backed memory range registered with KVM.
#[derive(Debug, Clone, Copy)]
pub struct VirtualMem {
    pub gpa: u64,
    pub size: u64,
    pub host_addr: u64,
}

/// One installed KVM memory slot, as this machine tracks it.
#[derive(Debug, Clone, Copy)]
pub struct MemSlot {
    pub slot: u32,
    pub vmem: VirtualMem,
    pub read_only: bool,
}

// ─── Remote window ───────────────────────────────────────────────────

/// A non-owning, read-mostly projection of another machine's memory.
///
/// Built by `Machine::remote_connect`; holds raw host addresses into the
/// remote's allocations, so the remote must outlive the window.
#[derive(Debug)]
pub struct RemoteWindow {
    /// The remote's main memory, as installed into this machine's
    /// physical space at [`REMOTE_GPA_BASE`].
    pub vmem: VirtualMem,
    pub remote_max: u64,
}

impl RemoteWindow {
    /// Read a `u64` from the remote's guest physical memory.
    fn read_u64(&self, remote_gpa: u64) -> Result<u64> {
        if remote_gpa.checked_add(8).is_none_or(|end| end > self.remote_max) {
            return Err(MachineError::MemoryException {
                msg: "protection violation",
                addr: remote_gpa,
                size: 8,
            });
        }
        // SAFETY: bounds-checked above; the host mapping is valid for the
        // lifetime of the remote machine, which the connect contract
        // requires to outlive this window.
        Ok(unsafe {
            ((self.vmem.host_addr + remote_gpa) as *const u64).read_unaligned()
        })
    }

    /// Walk the remote's page tables. Returns the remote leaf PTE for
    /// `remote_gva`, if mapped.
    pub fn translate(&self, remote_gva: u64) -> Result<Option<u64>> {
        let mut table = PT_BASE;
        for level in (1..=3).rev() {
            let idx = (remote_gva >> (12 + 9 * level)) & 0x1ff;
            let entry = self.read_u64(table + idx * 8)?;
            if entry & PTE_PRESENT == 0 {
                return Ok(None);
            }
            table = entry & PTE_ADDR_MASK;
        }
        let leaf = self.read_u64(table + ((remote_gva >> 12) & 0x1ff) * 8)?;
        if leaf & PTE_PRESENT == 0 {
            return Ok(None);
        }
        Ok(Some(leaf))
    }
}

// ─── VmMemory ────────────────────────────────────────────────────────

/// The guest memory subsystem of one machine.
#[derive(Debug)]
pub struct VmMemory {
    main: GuestMemoryMmap,
    kernel_copy: Option<GuestMemoryMmap>,
    bank: Option<MemoryBank>,
    remote: Option<RemoteWindow>,

    max_mem: u64,
    kernel_end: u64,
    /// Guest virtual addresses below this are CoW-tracked once prepared.
    boundary: u64,
    cow_enabled: bool,
    hugepages: bool,

    /// Next spare page-table page for remote-window mappings.
    spare_table_next: u64,
    spare_table_limit: u64,

    slots: Vec<MemSlot>,
}

impl VmMemory {
    /// Allocate the main guest physical space `[0, max_mem)`.
    pub fn new(max_mem: u64, hugepages: bool) -> Result<Self> {
        if max_mem == 0 || max_mem % PAGE_SIZE != 0 {
            return Err(MachineError::Config(format!(
                "max_mem must be a non-zero multiple of {PAGE_SIZE} bytes, got {max_mem}"
            )));
        }
        let kernel_end = layout_kernel_end(max_mem);
        if kernel_end >= max_mem {
            return Err(MachineError::Config(format!(
                "max_mem of {max_mem} bytes leaves no room above the {kernel_end}-byte kernel region"
            )));
        }
        let main = anon_memory(0, max_mem as usize, hugepages)?;
        Ok(Self {
            main,
            kernel_copy: None,
            bank: None,
            remote: None,
            max_mem,
            kernel_end,
            boundary: max_mem,
            cow_enabled: false,
            hugepages,
            spare_table_next: kernel_end - REMOTE_SPARE_TABLES * PAGE_SIZE,
            spare_table_limit: kernel_end,
            slots: Vec::new(),
        })
    }

    // ─── Accessors ───────────────────────────────────────────────────

    #[inline]
    pub fn max_mem(&self) -> u64 {
        self.max_mem
    }

    #[inline]
    pub fn kernel_end(&self) -> u64 {
        self.kernel_end
    }

    /// The shared-memory boundary (equals `max_mem` when everything is
    /// CoW-tracked).
    #[inline]
    pub fn boundary(&self) -> u64 {
        self.boundary
    }

    #[inline]
    pub fn is_cow(&self) -> bool {
        self.cow_enabled
    }

    #[inline]
    pub fn is_fork(&self) -> bool {
        self.kernel_copy.is_some()
    }

    /// Pages currently duplicated into the bank.
    pub fn banked_pages(&self) -> usize {
        self.bank.as_ref().map_or(0, MemoryBank::pages_in_use)
    }

    pub fn remote_window(&self) -> Option<&RemoteWindow> {
        self.remote.as_ref()
    }

    /// The slots currently registered with the hypervisor.
    pub fn installed_slots(&self) -> &[MemSlot] {
        &self.slots
    }

    /// The main memory object, for components that work directly with
    /// `vm-memory` types (e.g. the ELF loader).
    #[inline]
    pub(crate) fn main_memory(&self) -> &GuestMemoryMmap {
        &self.main
    }

    /// Host virtual address of main guest physical address 0.
    pub fn host_address(&self) -> u64 {
        self.main
            .get_host_address(GuestAddress(0))
            .expect("main guest memory host address must resolve") as u64
    }

    // ─── Physical routing ────────────────────────────────────────────

    fn object_for(&self, gpa: u64) -> Option<&GuestMemoryMmap> {
        if gpa < self.kernel_end {
            if let Some(kc) = &self.kernel_copy {
                return Some(kc);
            }
        }
        if gpa < self.max_mem {
            return Some(&self.main);
        }
        if let Some(bank) = &self.bank {
            if bank.contains_gpa(gpa) {
                return Some(bank.memory());
            }
        }
        None
    }

    fn host_ptr(&self, gpa: u64, len: usize) -> Result<*mut u8> {
        let violation = || MachineError::MemoryException {
            msg: "protection violation",
            addr: gpa,
            size: len as u64,
        };
        let mem = self.object_for(gpa).ok_or_else(violation)?;
        if !mem.check_range(GuestAddress(gpa), len) {
            return Err(violation());
        }
        mem.get_host_address(GuestAddress(gpa)).map_err(|_| violation())
    }

    /// Borrow `[gpa, gpa + len)` as a host slice.  Fails with the
    /// protection-violation memory exception when the range is not fully
    /// inside one installed allocation.
    pub fn at(&self, gpa: u64, len: usize) -> Result<&[u8]> {
        let ptr = self.host_ptr(gpa, len)?;
        // SAFETY: host_ptr bounds-checked the range within one mapping.
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
    }

    /// Mutable variant of [`Self::at`].
    pub fn at_mut(&mut self, gpa: u64, len: usize) -> Result<&mut [u8]> {
        let ptr = self.host_ptr(gpa, len)?;
        // SAFETY: as in `at`, plus exclusive access through `&mut self`.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    pub fn read_obj_phys<T: vm_memory::ByteValued>(&self, gpa: u64) -> Result<T> {
        let mem = self.object_for(gpa).ok_or(MachineError::MemoryException {
            msg: "protection violation",
            addr: gpa,
            size: std::mem::size_of::<T>() as u64,
        })?;
        mem.read_obj(GuestAddress(gpa))
            .map_err(|_| MachineError::MemoryException {
                msg: "protection violation",
                addr: gpa,
                size: std::mem::size_of::<T>() as u64,
            })
    }

    pub fn write_obj_phys<T: vm_memory::ByteValued>(&self, gpa: u64, val: T) -> Result<()> {
        let mem = self.object_for(gpa).ok_or(MachineError::MemoryException {
            msg: "protection violation",
            addr: gpa,
            size: std::mem::size_of::<T>() as u64,
        })?;
        mem.write_obj(val, GuestAddress(gpa))
            .map_err(|_| MachineError::MemoryException {
                msg: "protection violation",
                addr: gpa,
                size: std::mem::size_of::<T>() as u64,
            })
    }

    pub fn write_phys(&self, gpa: u64, data: &[u8]) -> Result<()> {
        let mem = self.object_for(gpa).ok_or(MachineError::MemoryException {
            msg: "protection violation",
            addr: gpa,
            size: data.len() as u64,
        })?;
        mem.write_slice(data, GuestAddress(gpa))
            .map_err(|_| MachineError::MemoryException {
                msg: "protection violation",
                addr: gpa,
                size: data.len() as u64,
            })
    }

    pub fn read_phys(&self, gpa: u64, data: &mut [u8]) -> Result<()> {
        let mem = self.object_for(gpa).ok_or(MachineError::MemoryException {
            msg: "protection violation",
            addr: gpa,
            size: data.len() as u64,
        })?;
        mem.read_slice(data, GuestAddress(gpa))
            .map_err(|_| MachineError::MemoryException {
                msg: "protection violation",
                addr: gpa,
                size: data.len() as u64,
            })
    }

    // ─── Virtual addressing ──────────────────────────────────────────

    /// Translate a guest virtual address by walking the page tables.
    pub fn translate(&self, gva: u64) -> Result<Option<u64>> {
        pagetables::translate(self, gva)
    }

    /// Guarantee a writable backing page at `gva`.
    ///
    /// On a copy-on-write machine whose mapping is read-only, the next
    /// bank page is allocated, filled with the original contents (or
    /// zeroes when `zero` is set), and the leaf PTE is swapped to point at
    /// it.  The vCPU is paused in the fault handler while this runs, so
    /// the swap is atomic from the guest's point of view.
    pub fn get_writable_page(&mut self, gva: u64, flags: u64, zero: bool) -> Result<()> {
        let page = gva & !(PAGE_SIZE - 1);
        if page < self.kernel_end {
            return Err(MachineError::machine("Security violation", gva));
        }
        let pte = pagetables::leaf_entry(self, page)?.unwrap_or(0);
        if pte & PTE_PRESENT == 0 {
            return Err(MachineError::MemoryException {
                msg: "unmapped virtual address",
                addr: gva,
                size: PAGE_SIZE,
            });
        }
        if pte & PTE_RW != 0 {
            return Ok(());
        }
        if !self.cow_enabled {
            return Err(MachineError::MemoryException {
                msg: "write to protected page",
                addr: gva,
                size: PAGE_SIZE,
            });
        }

        let bank = self.bank.as_mut().expect("cow machine always has a bank");
        let banked = bank.allocate(page, pte)?;

        if zero {
            self.write_phys(banked.gpa, &[0u8; PAGE_SIZE as usize])?;
        } else {
            let mut buf = [0u8; PAGE_SIZE as usize];
            self.read_phys(pte & PTE_ADDR_MASK, &mut buf)?;
            self.write_phys(banked.gpa, &buf)?;
        }

        // Keep the original no-execute bit: a data page's private copy
        // stays non-executable.
        let new_pte =
            banked.gpa | flags | PTE_PRESENT | PTE_DIRTY | (pte & PTE_NX);
        pagetables::set_leaf(self, page, new_pte)?;
        debug!(
            "cow: gva 0x{:x} -> bank gpa 0x{:x} ({} pages in use)",
            page,
            banked.gpa,
            self.banked_pages()
        );
        Ok(())
    }

    fn ensure_writable(&mut self, gva: u64, zero: bool) -> Result<()> {
        let page = gva & !(PAGE_SIZE - 1);
        if !self.cow_enabled || page < self.kernel_end || page >= self.boundary {
            return Ok(());
        }
        match pagetables::leaf_entry(self, page)? {
            Some(pte) if pte & PTE_PRESENT != 0 && pte & PTE_RW == 0 => {
                self.get_writable_page(page, PTE_USER | PTE_RW, zero)
            }
            _ => Ok(()),
        }
    }

    /// Copy host bytes into the guest at virtual address `gva`.
    ///
    /// With `zeroes`, freshly banked pages are zero-filled instead of
    /// duplicated — appropriate when the caller overwrites whole pages of
    /// scratch data and the original contents are irrelevant.
    pub fn copy_to_guest(&mut self, gva: u64, buf: &[u8], zeroes: bool) -> Result<()> {
        let mut off = 0usize;
        while off < buf.len() {
            let va = gva + off as u64;
            let in_page = (PAGE_SIZE - (va & (PAGE_SIZE - 1))) as usize;
            let chunk = in_page.min(buf.len() - off);
            self.ensure_writable(va, zeroes)?;
            let gpa = self
                .translate(va)?
                .ok_or(MachineError::machine("unmapped virtual address", va))?;
            self.write_phys(gpa, &buf[off..off + chunk])?;
            off += chunk;
        }
        Ok(())
    }

    /// Copy guest bytes out, starting at virtual address `gva`.
    pub fn copy_from_guest(&self, buf: &mut [u8], gva: u64) -> Result<()> {
        let mut off = 0usize;
        while off < buf.len() {
            let va = gva + off as u64;
            let in_page = (PAGE_SIZE - (va & (PAGE_SIZE - 1))) as usize;
            let chunk = in_page.min(buf.len() - off);
            let gpa = self
                .translate(va)?
                .ok_or(MachineError::machine("unmapped virtual address", va))?;
            self.read_phys(gpa, &mut buf[off..off + chunk])?;
            off += chunk;
        }
        Ok(())
    }

    /// Produce host slices covering the guest virtual range, one per run
    /// of physically contiguous pages.
    pub fn gather_buffers_from_range(&self, gva: u64, len: usize) -> Result<Vec<&[u8]>> {
        let parts = self.range_parts(gva, len, false)?;
        // SAFETY: each part was bounds-checked by host_ptr and distinct
        // guest pages never alias distinct host pages.
        Ok(parts
            .into_iter()
            .map(|(ptr, plen)| unsafe { std::slice::from_raw_parts(ptr, plen) })
            .collect())
    }

    /// Writable variant of [`Self::gather_buffers_from_range`]; pre-faults
    /// every page through the copy-on-write path.
    pub fn writable_buffers_from_range(
        &mut self,
        gva: u64,
        len: usize,
    ) -> Result<Vec<&mut [u8]>> {
        let mut off = 0usize;
        while off < len {
            self.ensure_writable(gva + off as u64, false)?;
            off += (PAGE_SIZE - ((gva + off as u64) & (PAGE_SIZE - 1))) as usize;
        }
        let parts = self.range_parts(gva, len, true)?;
        // SAFETY: disjoint pages, exclusive access through `&mut self`.
        Ok(parts
            .into_iter()
            .map(|(ptr, plen)| unsafe { std::slice::from_raw_parts_mut(ptr, plen) })
            .collect())
    }

    fn range_parts(&self, gva: u64, len: usize, writable: bool) -> Result<Vec<(*mut u8, usize)>> {
        let mut parts: Vec<(*mut u8, usize)> = Vec::new();
        let mut off = 0usize;
        while off < len {
            let va = gva + off as u64;
            let in_page = (PAGE_SIZE - (va & (PAGE_SIZE - 1))) as usize;
            let chunk = in_page.min(len - off);
            let pte = pagetables::leaf_entry(self, va & !(PAGE_SIZE - 1))?
                .filter(|pte| pte & PTE_PRESENT != 0)
                .ok_or(MachineError::MemoryException {
                    msg: "protection violation",
                    addr: va,
                    size: chunk as u64,
                })?;
            if writable && pte & PTE_RW == 0 {
                return Err(MachineError::MemoryException {
                    msg: "protection violation",
                    addr: va,
                    size: chunk as u64,
                });
            }
            let gpa = (pte & PTE_ADDR_MASK) | (va & (PAGE_SIZE - 1));
            let ptr = self.host_ptr(gpa, chunk)?;
            match parts.last_mut() {
                Some((last_ptr, last_len))
                    if (*last_ptr as usize + *last_len) == ptr as usize =>
                {
                    *last_len += chunk;
                }
                _ => parts.push((ptr, chunk)),
            }
            off += chunk;
        }
        Ok(parts)
    }

    // ─── KVM slot management ─────────────────────────────────────────

    /// Register `vmem` with the hypervisor in `slot`.
    pub fn install(
        &mut self,
        vm: &VmFd,
        slot: u32,
        vmem: VirtualMem,
        read_only: bool,
    ) -> Result<()> {
        let flags = if read_only { KVM_MEM_READONLY } else { 0 };
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: vmem.gpa,
            memory_size: vmem.size,
            userspace_addr: vmem.host_addr,
            flags,
        };
        // SAFETY: vmem describes a live mapping owned by this machine (or,
        // for remote slots, one the caller contractually keeps alive).
        unsafe { vm.set_user_memory_region(region) }
            .map_err(|source| MachineError::SetMemoryRegion { slot, source })?;
        self.slots.retain(|s| s.slot != slot);
        self.slots.push(MemSlot {
            slot,
            vmem,
            read_only,
        });
        Ok(())
    }

    /// Unregister `slot` from the hypervisor.
    pub fn delete(&mut self, vm: &VmFd, slot: u32) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: 0,
            memory_size: 0,
            userspace_addr: 0,
            flags: 0,
        };
        // SAFETY: a zero-sized region removes the slot.
        unsafe { vm.set_user_memory_region(region) }
            .map_err(|source| MachineError::SetMemoryRegion { slot, source })?;
        self.slots.retain(|s| s.slot != slot);
        Ok(())
    }

    /// Install the single pre-prepare slot covering all of main memory.
    pub fn install_main(&mut self, vm: &VmFd) -> Result<()> {
        let vmem = VirtualMem {
            gpa: 0,
            size: self.max_mem,
            host_addr: self.host_address(),
        };
        self.install(vm, SLOT_MAIN, vmem, false)
    }

    // ─── Copy-on-write lifecycle ─────────────────────────────────────

    /// Turn this machine into a copy-on-write template (and user): leaf
    /// PTEs below `boundary` lose their write bit, the image slot is
    /// reinstalled read-only, and a bank of `max_cow_mem` bytes starts
    /// catching write faults.
    pub fn prepare_cow(
        &mut self,
        vm: &VmFd,
        max_cow_mem: u64,
        boundary: Option<u64>,
    ) -> Result<()> {
        if self.cow_enabled {
            return Err(MachineError::Config(
                "machine is already prepared for copy-on-write".into(),
            ));
        }
        let boundary = boundary
            .map(|b| (b & !(PAGE_SIZE - 1)).clamp(self.kernel_end, self.max_mem))
            .unwrap_or(self.max_mem);

        let stripped = pagetables::strip_write_range(self, self.kernel_end, boundary)?;
        debug!("prepare_cow: stripped write access from {stripped} pages below 0x{boundary:x}");

        self.bank = Some(MemoryBank::new(self.max_mem, max_cow_mem, self.hugepages)?);
        self.boundary = boundary;
        self.cow_enabled = true;
        self.reinstall_cow_slots(vm)
    }

    fn reinstall_cow_slots(&mut self, vm: &VmFd) -> Result<()> {
        let main_host = self.host_address();
        let kernel_host = match &self.kernel_copy {
            Some(kc) => kc
                .get_host_address(GuestAddress(0))
                .expect("kernel copy host address must resolve") as u64,
            None => main_host,
        };
        let (kernel_end, boundary, max_mem) = (self.kernel_end, self.boundary, self.max_mem);

        self.delete(vm, SLOT_MAIN)?;
        self.install(
            vm,
            SLOT_KERNEL,
            VirtualMem {
                gpa: 0,
                size: kernel_end,
                host_addr: kernel_host,
            },
            false,
        )?;
        if boundary > kernel_end {
            self.install(
                vm,
                SLOT_IMAGE,
                VirtualMem {
                    gpa: kernel_end,
                    size: boundary - kernel_end,
                    host_addr: main_host + kernel_end,
                },
                true,
            )?;
        }
        if boundary < max_mem {
            self.install(
                vm,
                SLOT_SHARED,
                VirtualMem {
                    gpa: boundary,
                    size: max_mem - boundary,
                    host_addr: main_host + boundary,
                },
                false,
            )?;
        }
        let bank = self.bank.as_ref().expect("bank exists after prepare");
        let bank_vmem = VirtualMem {
            gpa: bank.gpa(),
            size: bank.capacity_bytes(),
            host_addr: bank.host_address(),
        };
        self.install(vm, SLOT_BANK, bank_vmem, false)
    }

    /// Build a fork's memory from a prepared parent: shared main mapping,
    /// private kernel-region copy (including page tables), empty bank.
    pub fn fork_from(parent: &VmMemory, vm: &VmFd, max_cow_mem: u64) -> Result<Self> {
        let kernel_copy = anon_memory(0, parent.kernel_end as usize, false)?;
        let kernel_bytes = parent.at(0, parent.kernel_end as usize)?;
        kernel_copy
            .write_slice(kernel_bytes, GuestAddress(0))
            .map_err(|_| MachineError::MemoryCreate {
                size: parent.kernel_end as usize,
            })?;

        let mut mem = Self {
            main: parent.main.clone(),
            kernel_copy: Some(kernel_copy),
            bank: Some(MemoryBank::new(parent.max_mem, max_cow_mem, parent.hugepages)?),
            remote: None,
            max_mem: parent.max_mem,
            kernel_end: parent.kernel_end,
            boundary: parent.boundary,
            cow_enabled: true,
            hugepages: parent.hugepages,
            spare_table_next: parent.spare_table_next,
            spare_table_limit: parent.spare_table_limit,
            slots: Vec::new(),
        };
        mem.reinstall_cow_slots(vm)?;
        Ok(mem)
    }

    /// Rewind the copy-on-write state: walk the bank in reverse allocation
    /// order restoring original leaf PTEs, then truncate the bank.
    ///
    /// This is the hot path between calls; nothing is deallocated unless
    /// `free_work_mem` asks for it.
    pub fn reset_cow(&mut self, free_work_mem: bool) -> Result<()> {
        let Some(bank) = self.bank.as_mut() else {
            return Ok(());
        };
        let pages = bank.take_pages();
        for page in pages.iter().rev() {
            pagetables::set_leaf(self, page.gva, page.original_pte)?;
        }
        self.bank
            .as_mut()
            .expect("bank still present")
            .reset(free_work_mem);
        Ok(())
    }

    // ─── Remote window ───────────────────────────────────────────────

    pub(crate) fn set_remote(&mut self, window: RemoteWindow) {
        self.remote = Some(window);
    }

    pub(crate) fn alloc_spare_table(&mut self) -> Result<u64> {
        if self.spare_table_next >= self.spare_table_limit {
            return Err(MachineError::MemoryException {
                msg: "remote window page tables exhausted",
                addr: self.spare_table_next,
                size: PAGE_SIZE,
            });
        }
        let gpa = self.spare_table_next;
        self.spare_table_next += PAGE_SIZE;
        Ok(gpa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagetables::{PageTableBuilder, PTE_RW, PTE_USER};

    const MEM: u64 = 16 * 1024 * 1024;

    fn mapped_memory() -> VmMemory {
        let mem = VmMemory::new(MEM, false).unwrap();
        let mut builder = PageTableBuilder::new(MEM);
        builder
            .map_range(&mem, 0x40_0000, 0x10_0000, PTE_USER | PTE_RW)
            .unwrap();
        mem
    }

    #[test]
    fn rejects_memory_smaller_than_kernel_region() {
        let err = VmMemory::new(0x8000, false).unwrap_err();
        assert!(matches!(err, MachineError::Config(_)));
    }

    #[test]
    fn at_rejects_out_of_range() {
        let mem = VmMemory::new(MEM, false).unwrap();
        assert!(mem.at(0, 16).is_ok());
        let err = mem.at(MEM - 8, 16).unwrap_err();
        assert!(matches!(
            err,
            MachineError::MemoryException {
                msg: "protection violation",
                ..
            }
        ));
    }

    #[test]
    fn phys_obj_round_trip() {
        let mem = VmMemory::new(MEM, false).unwrap();
        mem.write_obj_phys(0x40_0000, 0xdead_beef_u32).unwrap();
        let val: u32 = mem.read_obj_phys(0x40_0000).unwrap();
        assert_eq!(val, 0xdead_beef);
    }

    #[test]
    fn guest_copy_round_trip() {
        let mut mem = mapped_memory();
        let data: Vec<u8> = (0..=255).cycle().take(3 * 4096 + 17).collect();
        mem.copy_to_guest(0x40_0123, &data, false).unwrap();
        let mut out = vec![0u8; data.len()];
        mem.copy_from_guest(&mut out, 0x40_0123).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn copy_to_unmapped_address_fails() {
        let mut mem = mapped_memory();
        let err = mem.copy_to_guest(0x90_0000, b"xyz", false).unwrap_err();
        assert!(matches!(err, MachineError::MachineException { .. }));
    }

    #[test]
    fn gather_buffers_merges_contiguous_pages() {
        let mut mem = mapped_memory();
        mem.copy_to_guest(0x40_0000, &[0xa5; 8192], false).unwrap();
        // Identity-mapped pages are physically contiguous: one buffer.
        let bufs = mem.gather_buffers_from_range(0x40_0800, 4096).unwrap();
        assert_eq!(bufs.len(), 1);
        assert_eq!(bufs[0].len(), 4096);
        assert!(bufs[0].iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn writable_buffers_refuse_read_only_pages() {
        let mut mem = VmMemory::new(MEM, false).unwrap();
        let mut builder = PageTableBuilder::new(MEM);
        builder
            .map_range(&mem, 0x40_0000, 0x10_0000, PTE_USER | PTE_RW)
            .unwrap();
        builder.map_page(&mem, 0x60_0000, 0x60_0000, PTE_USER).unwrap();
        let err = mem.writable_buffers_from_range(0x60_0000, 64).unwrap_err();
        assert!(matches!(err, MachineError::MemoryException { .. }));
    }

    #[test]
    fn get_writable_page_on_kernel_space_is_a_security_violation() {
        let mut mem = mapped_memory();
        let err = mem.get_writable_page(0x2000, PTE_USER | PTE_RW, false).unwrap_err();
        assert!(matches!(
            err,
            MachineError::MachineException {
                msg: "Security violation",
                ..
            }
        ));
    }

    #[test]
    fn writable_page_is_a_no_op_on_writable_mappings() {
        let mut mem = mapped_memory();
        mem.get_writable_page(0x40_0000, PTE_USER | PTE_RW, false)
            .unwrap();
        assert_eq!(mem.banked_pages(), 0);
    }
}
