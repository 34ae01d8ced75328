//! The machine: guest memory, one vCPU, and the call/fork/reset protocol.
//!
//! A [`Machine`] is built from a statically linked guest executable.  The
//! constructor loads the image, writes the long-mode kernel environment
//! (GDT, TSS, IDT, interrupt stubs, exit trampoline, page tables) and
//! configures the vCPU so the guest starts in 64-bit user mode.
//!
//! Calls follow the System V AMD64 convention: [`Machine::vmcall`] puts
//! arguments into RDI..R9 and XMM0..XMM7, spills the rest onto the guest
//! stack, pushes the exit trampoline as the return address, and runs the
//! vCPU until the guest stops or a timeout fires.  RAX is the return
//! value.
//!
//! [`Machine::prepare_copy_on_write`] freezes the image; forks built with
//! [`Machine::fork`] then share every page read-only and duplicate only
//! what they write, which [`Machine::reset_to`] undoes between requests.

use crate::error::{exception_has_code, exception_name, MachineError, Result};
use crate::gdt::{gdt_entry, idt_gate, kvm_segment_from_gdt, tss_descriptor};
use crate::layout::{
    page_align_up, EXIT_ASM_ADDR, GDT_ADDR, GDT_ENTRY_COUNT, GDT_FLAGS_KERNEL_CODE,
    GDT_FLAGS_KERNEL_DATA, GDT_FLAGS_TSS, GDT_FLAGS_USER_CODE, GDT_FLAGS_USER_DATA, IDT_ADDR,
    IDT_ENTRIES, INTR_ASM_ADDR, KERNEL_CS, KERNEL_STACK_ADDR, KERNEL_STACK_TOP, PAGE_SIZE,
    PT_BASE, REMOTE_GVA_MASK, STUB_STRIDE, TSS_ADDR, TSS_SEL, USER_CS, USER_DS,
};
use crate::loader::{self, LoadedImage, PF_W, PF_X};
use crate::memory::{RemoteWindow, VirtualMem, VmMemory, REMOTE_GPA_BASE, SLOT_REMOTE_BASE};
use crate::pagetables::{
    self, PageTableBuilder, PTE_ADDR_MASK, PTE_NX, PTE_PRESENT, PTE_RW, PTE_USER,
};
use crate::registry::Registry;
use crate::stubs;
use crate::timer;
use crate::vcpu::{Vcpu, VcpuEvent};
use kvm_bindings::{kvm_fpu, kvm_regs, kvm_segment, kvm_sregs};
use kvm_ioctls::{Kvm, VmFd};
use log::{info, warn};
use std::any::Any;
use std::sync::Arc;

// x86_64 control register flags
const X86_CR0_PE: u64 = 1 << 0;
const X86_CR0_MP: u64 = 1 << 1;
const X86_CR0_ET: u64 = 1 << 4;
const X86_CR0_NE: u64 = 1 << 5;
const X86_CR0_WP: u64 = 1 << 16;
const X86_CR0_AM: u64 = 1 << 18;
const X86_CR0_PG: u64 = 1 << 31;
const X86_CR4_PAE: u64 = 1 << 5;
const X86_CR4_OSFXSR: u64 = 1 << 9;
const X86_CR4_OSXMMEXCPT: u64 = 1 << 10;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const EFER_NXE: u64 = 1 << 11;

/// RFLAGS for a guest call: reserved bit, interrupts enabled, IOPL 3 so
/// ring-3 code may execute the `out`-based call protocol.
const RFLAGS_CALL: u64 = 0x2 | 0x200 | 0x3000;

/// Integer argument registers, in System V order.
const INT_ARG_REGS: usize = 6;

/// How machine state is printed on fatal paths.  Shared (and cloned into
/// forks), so it is reference-counted rather than boxed.
pub type Printer = Arc<dyn Fn(&str) + Send + Sync>;

fn default_printer() -> Printer {
    Arc::new(|s| eprint!("{s}"))
}

fn default_fpu() -> kvm_fpu {
    kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    }
}

/// Configuration for creating a [`Machine`].
#[derive(Clone)]
pub struct MachineOptions {
    /// Guest physical memory size in bytes.
    pub max_mem: u64,
    /// Memory-bank capacity for copy-on-write duplicates.
    pub max_cow_mem: u64,
    /// Initial stack size; the stack grows down from the top of memory.
    pub stack_size: u64,
    /// Guest virtual address above which pages are not CoW-tracked and
    /// stay shared writable across forks. `None` tracks everything.
    pub shared_memory_boundary: Option<u64>,
    /// Request 2 MiB backing pages for guest memory.
    pub hugepages: bool,
    /// Release bank memory to the OS on every reset instead of reusing it.
    pub reset_free_work_mem: bool,
    /// Host callback tables shared by this machine and its forks.
    pub registry: Arc<Registry>,
    /// Where register dumps and fault diagnostics go; stderr when `None`.
    pub printer: Option<Printer>,
    /// Extend register dumps with R8–R15 and control-register decoding.
    pub verbose_registers: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            max_mem: 64 * 1024 * 1024,
            max_cow_mem: 16 * 1024 * 1024,
            stack_size: 2 * 1024 * 1024,
            shared_memory_boundary: None,
            hugepages: false,
            reset_free_work_mem: false,
            registry: Arc::new(Registry::new()),
            printer: None,
            verbose_registers: false,
        }
    }
}

/// One argument of a guest call.
#[derive(Debug, Clone, Copy)]
pub enum VmArg<'a> {
    U64(u64),
    I64(i64),
    /// Copied onto the guest stack NUL-terminated; the pointer takes the
    /// argument slot.
    Str(&'a str),
    /// Copied onto the guest stack; the pointer takes the argument slot.
    Bytes(&'a [u8]),
    F32(f32),
    F64(f64),
}

/// Maximum program break growth above the image end.
pub const BRK_MAX: u64 = 0x10_0000;

/// A KVM-backed virtual machine called like a function.
pub struct Machine {
    #[allow(dead_code)]
    kvm: Kvm,
    vm: VmFd,
    pub(crate) memory: VmMemory,
    vcpu: Vcpu,
    registry: Arc<Registry>,
    printer: Printer,
    image: LoadedImage,

    stack_address: u64,
    stack_size: u64,
    heap_address: u64,
    mmap_cursor: u64,
    mm_maps: Vec<(u64, u64)>,

    max_cow_mem: u64,
    shared_memory_boundary: Option<u64>,
    verbose_registers: bool,
    prepared: bool,
    forked: bool,
    cached_sregs: Option<kvm_sregs>,
    userdata: Option<Box<dyn Any + Send>>,
}

impl Machine {
    /// Create a machine from a static ELF64 executable.
    pub fn new(binary: &[u8], options: &MachineOptions) -> Result<Self> {
        timer::install_signal_handler();
        let kvm = Kvm::new().map_err(MachineError::KvmCreate)?;
        let vm = kvm.create_vm().map_err(MachineError::VmCreate)?;

        let mut memory = VmMemory::new(options.max_mem, options.hugepages)?;
        memory.install_main(&vm)?;
        let image = loader::load_elf(&memory, binary)?;

        let stack_size = page_align_up(options.stack_size.max(PAGE_SIZE));
        let stack_address = options.max_mem;
        let heap_address = image.image_end;
        if heap_address + BRK_MAX >= stack_address - stack_size {
            return Err(MachineError::Config(format!(
                "no room between heap at 0x{heap_address:x} and a 0x{stack_size:x}-byte stack"
            )));
        }

        Self::write_kernel_structures(&memory)?;
        Self::build_page_tables(&memory, &image, options.max_mem)?;

        let vcpu = Vcpu::new(&kvm, &vm)?;
        let machine = Self {
            kvm,
            vm,
            memory,
            vcpu,
            registry: Arc::clone(&options.registry),
            printer: options.printer.clone().unwrap_or_else(default_printer),
            stack_address,
            stack_size,
            heap_address,
            mmap_cursor: heap_address + BRK_MAX,
            mm_maps: Vec::new(),
            max_cow_mem: options.max_cow_mem,
            shared_memory_boundary: options.shared_memory_boundary,
            verbose_registers: options.verbose_registers,
            prepared: false,
            forked: false,
            cached_sregs: None,
            userdata: None,
            image,
        };
        machine.setup_long_mode()?;

        info!(
            "machine created: {} MiB, entry 0x{:x}, heap 0x{:x}, stack 0x{:x}",
            options.max_mem >> 20,
            machine.image.entry,
            machine.heap_address,
            machine.stack_address
        );
        Ok(machine)
    }

    /// Fork a prepared parent: the child shares every parent page
    /// read-only and duplicates pages into its own bank as it writes.
    ///
    /// The parent must be pristine (`banked_memory_pages() == 0`) so the
    /// child copies the prepared page tables, not live banked state.
    pub fn fork(parent: &Machine, options: &MachineOptions) -> Result<Machine> {
        if !parent.prepared {
            return Err(MachineError::Config(
                "fork requires a parent prepared for copy-on-write".into(),
            ));
        }
        if parent.banked_memory_pages() != 0 {
            return Err(MachineError::Config(
                "fork requires a pristine parent (reset it first)".into(),
            ));
        }
        timer::install_signal_handler();
        let kvm = Kvm::new().map_err(MachineError::KvmCreate)?;
        let vm = kvm.create_vm().map_err(MachineError::VmCreate)?;
        let memory = VmMemory::fork_from(&parent.memory, &vm, options.max_cow_mem)?;
        let vcpu = Vcpu::new(&kvm, &vm)?;

        let sregs = parent
            .cached_sregs
            .expect("prepared machines cache special registers");
        vcpu.set_special_registers(&sregs)?;
        vcpu.set_registers(&parent.vcpu.registers()?)?;
        vcpu.set_fpu(&parent.vcpu.get_fpu()?)?;

        Ok(Machine {
            kvm,
            vm,
            memory,
            vcpu,
            registry: Arc::clone(&parent.registry),
            printer: options
                .printer
                .clone()
                .unwrap_or_else(|| Arc::clone(&parent.printer)),
            image: parent.image.clone(),
            stack_address: parent.stack_address,
            stack_size: parent.stack_size,
            heap_address: parent.heap_address,
            mmap_cursor: parent.mmap_cursor,
            mm_maps: parent.mm_maps.clone(),
            max_cow_mem: options.max_cow_mem,
            shared_memory_boundary: parent.shared_memory_boundary,
            verbose_registers: options.verbose_registers || parent.verbose_registers,
            prepared: false,
            forked: true,
            cached_sregs: Some(sregs),
            userdata: None,
        })
    }

    // ─── Long-mode environment ───────────────────────────────────────

    fn write_kernel_structures(memory: &VmMemory) -> Result<()> {
        // GDT: null, kernel code/data, user code/data, 16-byte TSS.
        let (tss_low, tss_high) = tss_descriptor(GDT_FLAGS_TSS, TSS_ADDR, 103);
        let gdt: [u64; GDT_ENTRY_COUNT] = [
            0,
            gdt_entry(GDT_FLAGS_KERNEL_CODE, 0, 0xfffff),
            gdt_entry(GDT_FLAGS_KERNEL_DATA, 0, 0xfffff),
            gdt_entry(GDT_FLAGS_USER_CODE, 0, 0xfffff),
            gdt_entry(GDT_FLAGS_USER_DATA, 0, 0xfffff),
            tss_low,
            tss_high,
        ];
        for (i, entry) in gdt.iter().enumerate() {
            memory.write_obj_phys(GDT_ADDR + i as u64 * 8, *entry)?;
        }

        // TSS: only rsp0 (kernel stack on CPL3→0 switch) and the I/O map
        // base (no I/O bitmap) matter.
        memory.write_phys(TSS_ADDR, &[0u8; 104])?;
        memory.write_obj_phys(TSS_ADDR + 4, KERNEL_STACK_TOP)?;
        memory.write_obj_phys(TSS_ADDR + 102, 104u16)?;

        // IDT: one interrupt gate per exception vector into the stub page.
        for vector in 0..IDT_ENTRIES as u64 {
            let gate = idt_gate(INTR_ASM_ADDR + vector * STUB_STRIDE, KERNEL_CS, 0);
            memory.write_phys(IDT_ADDR + vector * 16, &gate)?;
        }

        memory.write_phys(INTR_ASM_ADDR, &stubs::interrupt_stubs())?;
        memory.write_phys(EXIT_ASM_ADDR, &stubs::exit_trampoline())?;
        Ok(())
    }

    fn build_page_tables(memory: &VmMemory, image: &LoadedImage, max_mem: u64) -> Result<()> {
        let mut builder = PageTableBuilder::new(max_mem);

        // Kernel region. The zero page stays unmapped to trap null
        // dereferences.
        builder.map_page(memory, 0x1000, 0x1000, PTE_RW | PTE_NX)?;
        builder.map_page(memory, INTR_ASM_ADDR, INTR_ASM_ADDR, 0)?;
        builder.map_page(memory, EXIT_ASM_ADDR, EXIT_ASM_ADDR, PTE_USER)?;
        builder.map_page(memory, KERNEL_STACK_ADDR, KERNEL_STACK_ADDR, PTE_RW | PTE_NX)?;
        builder.map_range(
            memory,
            PT_BASE,
            memory.kernel_end() - PT_BASE,
            PTE_RW | PTE_NX,
        )?;

        // User image, W^X per program header; pages shared between
        // segments take the union of permissions.
        let mut page_flags: std::collections::BTreeMap<u64, u64> = std::collections::BTreeMap::new();
        for seg in &image.segments {
            let mut flags = PTE_USER | PTE_NX;
            if seg.flags & PF_W != 0 {
                flags |= PTE_RW;
            }
            if seg.flags & PF_X != 0 {
                flags &= !PTE_NX;
            }
            let mut page = seg.vaddr & !(PAGE_SIZE - 1);
            while page < seg.vaddr + seg.memsz {
                let entry = page_flags.entry(page).or_insert(PTE_USER | PTE_NX);
                *entry |= flags & PTE_RW;
                if flags & PTE_NX == 0 {
                    *entry &= !PTE_NX;
                }
                page += PAGE_SIZE;
            }
        }
        for (page, flags) in &page_flags {
            builder.map_page(memory, *page, *page, *flags)?;
        }

        // Heap, mmap region and stack: user read-write.
        builder.map_range(
            memory,
            image.image_end,
            max_mem - image.image_end,
            PTE_USER | PTE_RW | PTE_NX,
        )?;
        Ok(())
    }

    fn setup_long_mode(&self) -> Result<()> {
        let mut sregs = self.vcpu.get_special_registers()?;

        sregs.cr3 = PT_BASE;
        sregs.cr4 = X86_CR4_PAE | X86_CR4_OSFXSR | X86_CR4_OSXMMEXCPT;
        sregs.cr0 =
            X86_CR0_PE | X86_CR0_MP | X86_CR0_ET | X86_CR0_NE | X86_CR0_WP | X86_CR0_AM | X86_CR0_PG;
        sregs.efer = EFER_LME | EFER_LMA | EFER_NXE;

        sregs.gdt.base = GDT_ADDR;
        sregs.gdt.limit = (GDT_ENTRY_COUNT as u16) * 8 - 1;
        sregs.idt.base = IDT_ADDR;
        sregs.idt.limit = (IDT_ENTRIES as u16) * 16 - 1;

        // The guest runs in ring 3; only the interrupt stubs execute at
        // ring 0, entered through the IDT.
        sregs.cs = kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_USER_CODE, 0, 0xfffff), USER_CS);
        let data = kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_USER_DATA, 0, 0xfffff), USER_DS);
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;
        sregs.tr = kvm_segment {
            base: TSS_ADDR,
            limit: 103,
            selector: TSS_SEL,
            type_: 11, // 64-bit TSS, busy
            present: 1,
            ..Default::default()
        };

        self.vcpu.set_special_registers(&sregs)?;
        self.vcpu.set_fpu(&default_fpu())
    }

    // ─── Addresses ───────────────────────────────────────────────────

    /// The ELF entry point.
    pub fn entry_address(&self) -> u64 {
        self.image.entry
    }

    /// Alias kept for symmetry with the call API.
    pub fn start_address(&self) -> u64 {
        self.image.entry
    }

    /// The user-mode exit trampoline; pushed as the synthetic return
    /// address so a guest `ret` terminates the call.
    pub fn exit_address(&self) -> u64 {
        EXIT_ASM_ADDR
    }

    pub fn stack_address(&self) -> u64 {
        self.stack_address
    }

    pub fn set_stack_address(&mut self, addr: u64) {
        self.stack_address = addr;
    }

    pub fn heap_address(&self) -> u64 {
        self.heap_address
    }

    pub fn kernel_end_address(&self) -> u64 {
        self.memory.kernel_end()
    }

    pub fn max_address(&self) -> u64 {
        self.memory.max_mem()
    }

    pub fn mmap_start(&self) -> u64 {
        self.heap_address + BRK_MAX
    }

    /// Current end of the mmap region (next allocation address).
    pub fn mmap_current(&self) -> u64 {
        self.mmap_cursor
    }

    /// Bump-allocate `size` bytes (page-rounded) from the mmap region.
    /// Fails deterministically once the region (bounded by the stack) is
    /// exhausted.
    pub fn mmap_allocate(&mut self, size: u64) -> Result<u64> {
        let start = page_align_up(self.mmap_cursor);
        let size = page_align_up(size.max(1));
        let limit = self.stack_address - self.stack_size;
        let end = start.checked_add(size).filter(|&e| e <= limit).ok_or(
            MachineError::MemoryException {
                msg: "mmap region exhausted",
                addr: start,
                size,
            },
        )?;
        self.mmap_cursor = end;
        self.mm_maps.push((start, size));
        Ok(start)
    }

    /// Translate a guest virtual address; 0 when unmapped.
    pub fn translate(&self, gva: u64) -> u64 {
        match self.memory.translate(gva) {
            Ok(Some(gpa)) => gpa,
            _ => 0,
        }
    }

    // ─── Memory access ───────────────────────────────────────────────

    /// Copy into guest memory at `addr`.  With `zeroes`, pages newly
    /// duplicated by copy-on-write are zero-filled instead of copied.
    pub fn copy_to_guest(&mut self, addr: u64, buf: &[u8], zeroes: bool) -> Result<()> {
        self.memory.copy_to_guest(addr, buf, zeroes)
    }

    pub fn copy_from_guest(&self, buf: &mut [u8], addr: u64) -> Result<()> {
        self.memory.copy_from_guest(buf, addr)
    }

    /// Copy guest bytes out without walking every page: `addr` is
    /// translated once and the rest of the range is read as if it were
    /// physically contiguous.
    ///
    /// That holds for any range that stays on one page and for
    /// identity-mapped ranges no copy-on-write duplicate has broken up;
    /// a range that is not contiguous yields the bytes of whatever sits
    /// behind the first page's frame, not a fault.  Diagnostics use this
    /// to read exception frames off the guest stack.
    pub fn unsafe_copy_from_guest(&self, buf: &mut [u8], addr: u64) -> Result<()> {
        let gpa = self
            .memory
            .translate(addr)?
            .ok_or(MachineError::machine("unmapped virtual address", addr))?;
        buf.copy_from_slice(self.memory.at(gpa, buf.len())?);
        Ok(())
    }

    /// Copy a range from another machine's guest memory into this one.
    pub fn copy_from_machine(
        &mut self,
        dst: u64,
        src: &Machine,
        src_addr: u64,
        len: usize,
    ) -> Result<()> {
        let mut buf = vec![0u8; len];
        src.memory.copy_from_guest(&mut buf, src_addr)?;
        self.memory.copy_to_guest(dst, &buf, false)
    }

    /// Borrow a physically contiguous guest range read-only.
    pub fn memory_at(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let mut bufs = self.memory.gather_buffers_from_range(addr, len)?;
        if bufs.len() != 1 {
            return Err(MachineError::MemoryException {
                msg: "non-contiguous guest range",
                addr,
                size: len as u64,
            });
        }
        Ok(bufs.remove(0))
    }

    /// Borrow a physically contiguous guest range writable, faulting
    /// pages through copy-on-write first.
    pub fn rw_memory_at(&mut self, addr: u64, len: usize) -> Result<&mut [u8]> {
        let mut bufs = self.memory.writable_buffers_from_range(addr, len)?;
        if bufs.len() != 1 {
            return Err(MachineError::MemoryException {
                msg: "non-contiguous guest range",
                addr,
                size: len as u64,
            });
        }
        Ok(bufs.remove(0))
    }

    /// Whether `[addr, addr + len)` is fully mapped.
    pub fn memory_safe_at(&self, addr: u64, len: usize) -> bool {
        self.memory.gather_buffers_from_range(addr, len).is_ok()
    }

    pub fn gather_buffers_from_range(&self, addr: u64, len: usize) -> Result<Vec<&[u8]>> {
        self.memory.gather_buffers_from_range(addr, len)
    }

    pub fn writable_buffers_from_range(&mut self, addr: u64, len: usize) -> Result<Vec<&mut [u8]>> {
        self.memory.writable_buffers_from_range(addr, len)
    }

    /// Register extra host memory with the hypervisor.
    pub fn install_memory(&mut self, slot: u32, vmem: VirtualMem, read_only: bool) -> Result<()> {
        self.memory.install(&self.vm, slot, vmem, read_only)
    }

    /// Unregister a slot previously installed with
    /// [`Self::install_memory`].
    pub fn delete_memory(&mut self, slot: u32) -> Result<()> {
        self.memory.delete(&self.vm, slot)
    }

    /// Pages duplicated into the bank since the last reset.
    pub fn banked_memory_pages(&self) -> usize {
        self.memory.banked_pages()
    }

    /// The guest memory subsystem (read-only view).
    pub fn main_memory(&self) -> &VmMemory {
        &self.memory
    }

    // ─── Registers ───────────────────────────────────────────────────

    pub fn registers(&self) -> Result<kvm_regs> {
        self.vcpu.registers()
    }

    pub fn set_registers(&self, regs: &kvm_regs) -> Result<()> {
        self.vcpu.set_registers(regs)
    }

    pub fn get_special_registers(&self) -> Result<kvm_sregs> {
        self.vcpu.get_special_registers()
    }

    pub fn set_special_registers(&self, sregs: &kvm_sregs) -> Result<()> {
        self.vcpu.set_special_registers(sregs)
    }

    /// The FS and GS segment bases (thread-local storage anchors).
    pub fn get_fsgs(&self) -> Result<(u64, u64)> {
        let sregs = self.vcpu.get_special_registers()?;
        Ok((sregs.fs.base, sregs.gs.base))
    }

    pub fn set_tls_base(&self, base: u64) -> Result<()> {
        let mut sregs = self.vcpu.get_special_registers()?;
        sregs.fs.base = base;
        self.vcpu.set_special_registers(&sregs)
    }

    /// RAX after the last call.
    pub fn return_value(&self) -> Result<i64> {
        Ok(self.vcpu.registers()?.rax as i64)
    }

    pub fn stop(&mut self) {
        self.vcpu.stopped = true;
    }

    pub fn stopped(&self) -> bool {
        self.vcpu.stopped
    }

    // ─── Guest calls ─────────────────────────────────────────────────

    /// Push raw bytes onto the guest stack (8-byte aligned); returns the
    /// guest address of the pushed data.
    pub fn stack_push_bytes(&mut self, sp: &mut u64, data: &[u8]) -> Result<u64> {
        *sp = (*sp - data.len() as u64) & !7;
        self.memory.copy_to_guest(*sp, data, false)?;
        Ok(*sp)
    }

    /// Push a NUL-terminated string onto the guest stack.
    pub fn stack_push_cstr(&mut self, sp: &mut u64, s: &str) -> Result<u64> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.stack_push_bytes(sp, &bytes)
    }

    /// Push a 64-bit value onto the guest stack.
    pub fn stack_push(&mut self, sp: &mut u64, value: u64) -> Result<u64> {
        self.stack_push_bytes(sp, &value.to_le_bytes())
    }

    /// Fill `regs` for a call to `addr` with `args` on the stack at
    /// `stack`, per the System V AMD64 convention.  Also loads XMM
    /// registers when floating-point arguments are present.
    pub fn setup_call(
        &mut self,
        regs: &mut kvm_regs,
        addr: u64,
        stack: u64,
        args: &[VmArg],
    ) -> Result<()> {
        let mut sp = stack;
        let mut ints: Vec<u64> = Vec::new();
        let mut xmm: Vec<[u8; 16]> = Vec::new();

        for arg in args {
            match arg {
                VmArg::U64(v) => ints.push(*v),
                VmArg::I64(v) => ints.push(*v as u64),
                VmArg::Str(s) => {
                    let ptr = self.stack_push_cstr(&mut sp, s)?;
                    ints.push(ptr);
                }
                VmArg::Bytes(b) => {
                    let ptr = self.stack_push_bytes(&mut sp, b)?;
                    ints.push(ptr);
                }
                VmArg::F32(f) => {
                    let mut reg = [0u8; 16];
                    reg[..4].copy_from_slice(&f.to_le_bytes());
                    xmm.push(reg);
                }
                VmArg::F64(f) => {
                    let mut reg = [0u8; 16];
                    reg[..8].copy_from_slice(&f.to_le_bytes());
                    xmm.push(reg);
                }
            }
        }
        if xmm.len() > 8 {
            return Err(MachineError::Config(
                "at most 8 floating-point arguments go in XMM registers".into(),
            ));
        }

        // Spilled integer arguments, right to left, leaving RSP ≡ 0
        // (mod 16) before the synthetic return address goes on.
        let spill = ints.len().saturating_sub(INT_ARG_REGS);
        sp &= !0xf;
        if spill % 2 == 1 {
            sp -= 8;
        }
        for value in ints.iter().skip(INT_ARG_REGS).rev() {
            sp -= 8;
            self.memory.copy_to_guest(sp, &value.to_le_bytes(), false)?;
        }
        sp -= 8;
        let exit_address = self.exit_address();
        self.memory
            .copy_to_guest(sp, &exit_address.to_le_bytes(), false)?;

        let mut int_regs = ints.into_iter();
        regs.rdi = int_regs.next().unwrap_or(0);
        regs.rsi = int_regs.next().unwrap_or(0);
        regs.rdx = int_regs.next().unwrap_or(0);
        regs.rcx = int_regs.next().unwrap_or(0);
        regs.r8 = int_regs.next().unwrap_or(0);
        regs.r9 = int_regs.next().unwrap_or(0);
        regs.rip = addr;
        regs.rsp = sp;
        regs.rbp = sp;
        regs.rflags = RFLAGS_CALL;

        if !xmm.is_empty() {
            let mut fpu = self.vcpu.get_fpu()?;
            for (i, reg) in xmm.iter().enumerate() {
                fpu.xmm[i] = *reg;
            }
            self.vcpu.set_fpu(&fpu)?;
        }
        Ok(())
    }

    /// Call a guest function and return RAX.
    pub fn vmcall(&mut self, addr: u64, args: &[VmArg]) -> Result<i64> {
        self.timed_vmcall(addr, 0, args)
    }

    /// [`Self::vmcall`] with an execution deadline in milliseconds.
    pub fn timed_vmcall(&mut self, addr: u64, timeout_ms: u32, args: &[VmArg]) -> Result<i64> {
        self.timed_vmcall_stack(addr, timeout_ms, self.stack_address, args)
    }

    /// [`Self::timed_vmcall`] with an explicit stack pointer.
    pub fn timed_vmcall_stack(
        &mut self,
        addr: u64,
        timeout_ms: u32,
        stack: u64,
        args: &[VmArg],
    ) -> Result<i64> {
        let mut regs = kvm_regs::default();
        self.setup_call(&mut regs, addr, stack, args)?;
        self.vcpu.set_registers(&regs)?;
        self.run_vcpu(timeout_ms)?;
        self.return_value()
    }

    /// Build the process-entry stack (`argc`, `argv`, `envp`, empty
    /// auxv) and point the vCPU at the ELF entry.  Follow with
    /// [`Self::run`].
    pub fn setup_argv(&mut self, args: &[&str], env: &[&str]) -> Result<()> {
        let mut sp = self.stack_address;
        let mut argv_ptrs = Vec::with_capacity(args.len());
        for arg in args {
            argv_ptrs.push(self.stack_push_cstr(&mut sp, arg)?);
        }
        let mut env_ptrs = Vec::with_capacity(env.len());
        for var in env {
            env_ptrs.push(self.stack_push_cstr(&mut sp, var)?);
        }

        let mut vector: Vec<u64> = Vec::new();
        vector.push(args.len() as u64);
        vector.extend_from_slice(&argv_ptrs);
        vector.push(0);
        vector.extend_from_slice(&env_ptrs);
        vector.push(0);
        vector.push(0); // AT_NULL
        vector.push(0);

        sp &= !0xf;
        if vector.len() % 2 == 1 {
            sp -= 8;
        }
        for value in vector.iter().rev() {
            sp -= 8;
            self.memory.copy_to_guest(sp, &value.to_le_bytes(), false)?;
        }

        let regs = kvm_regs {
            rip: self.image.entry,
            rsp: sp,
            rbp: sp,
            rdi: args.len() as u64,
            rsi: sp + 8,
            rflags: RFLAGS_CALL,
            ..Default::default()
        };
        self.vcpu.set_registers(&regs)
    }

    /// Run from the state prepared by [`Self::setup_argv`] (or whatever
    /// the registers currently say) until the guest stops.
    pub fn run(&mut self, timeout_ms: u32) -> Result<()> {
        self.run_vcpu(timeout_ms)
    }

    // ─── The exit loop ───────────────────────────────────────────────

    fn run_vcpu(&mut self, timeout_ms: u32) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let guard = self.vcpu.arm(timeout_ms);
        self.vcpu.stopped = false;
        loop {
            let event = match self.vcpu.run_once(&registry, &guard, timeout_ms) {
                Ok(event) => event,
                Err(e) => {
                    self.report_fatal(&e);
                    return Err(e);
                }
            };
            match event {
                VcpuEvent::Stopped => break,
                VcpuEvent::Continue => {}
                VcpuEvent::Debug => break,
                VcpuEvent::Syscall(number) => self.dispatch_syscall(&registry, number)?,
                VcpuEvent::IoOut { port, value } => match registry.output() {
                    Some(handler) => handler(self, port, value)?,
                    None => warn!("unhandled out to port 0x{port:x} (value 0x{value:x})"),
                },
                VcpuEvent::Breakpoint => {
                    if let Some(handler) = registry.breakpoint() {
                        handler(self)?;
                    }
                }
                VcpuEvent::PageFault { addr, rdi } => {
                    self.handle_page_fault(&registry, addr, rdi)?
                }
                VcpuEvent::CpuFault { vector } => return Err(self.raise_cpu_exception(vector)),
            }
            if self.vcpu.stopped {
                break;
            }
        }
        Ok(())
    }

    fn dispatch_syscall(&mut self, registry: &Registry, number: u32) -> Result<()> {
        if let Some(handler) = registry.syscall(number) {
            return handler(self, number);
        }
        if let Some(handler) = registry.unhandled_syscall() {
            return handler(self, number);
        }
        warn!("unhandled syscall {number}, stopping the call");
        self.stop();
        Ok(())
    }

    fn handle_page_fault(&mut self, registry: &Registry, addr: u64, rdi: u64) -> Result<()> {
        if rdi & (1 << 63) != 0 {
            if let Some(handler) = registry.remote() {
                return handler(self, rdi & REMOTE_GVA_MASK);
            }
            return self.map_remote_fault(rdi & !(PAGE_SIZE - 1));
        }
        self.memory.get_writable_page(addr, PTE_USER | PTE_RW, false)
    }

    // ─── Fork / reset ────────────────────────────────────────────────

    /// Freeze this machine as a copy-on-write template.  Writes below the
    /// shared boundary — its own and its forks' — land in memory banks
    /// from here on; the underlying image pages stay pristine.
    pub fn prepare_copy_on_write(&mut self) -> Result<()> {
        self.memory
            .prepare_cow(&self.vm, self.max_cow_mem, self.shared_memory_boundary)?;
        self.cached_sregs = Some(self.vcpu.get_special_registers()?);
        self.prepared = true;
        info!(
            "prepared for copy-on-write: boundary 0x{:x}, bank {} KiB",
            self.memory.boundary(),
            self.max_cow_mem >> 10
        );
        Ok(())
    }

    pub fn is_forkable(&self) -> bool {
        self.prepared
    }

    pub fn is_forked(&self) -> bool {
        self.forked
    }

    /// Restore this machine to the parent's post-prepare state: bank
    /// rewound, mappings restored, special registers re-cached, FPU
    /// reset.  General-purpose registers are not restored — the next call
    /// sets them.
    pub fn reset_to(&mut self, parent: &Machine, options: &MachineOptions) -> Result<()> {
        if !parent.prepared {
            return Err(MachineError::Config(
                "reset_to requires a prepared parent".into(),
            ));
        }
        if !self.memory.is_cow() {
            return Err(MachineError::Config(
                "reset_to requires a copy-on-write machine".into(),
            ));
        }
        self.memory.reset_cow(options.reset_free_work_mem)?;
        let sregs = parent
            .cached_sregs
            .expect("prepared machines cache special registers");
        self.vcpu.set_special_registers(&sregs)?;
        self.vcpu.set_fpu(&default_fpu())?;
        self.cached_sregs = Some(sregs);
        self.mmap_cursor = parent.mmap_cursor;
        self.mm_maps.clone_from(&parent.mm_maps);
        Ok(())
    }

    // ─── Remote window ───────────────────────────────────────────────

    /// Project `remote`'s memory at the high-address window.  Guest
    /// dereferences of window addresses fault with the bit-63 tag and are
    /// resolved through the remote's page tables.
    ///
    /// # Safety
    ///
    /// The window holds raw pointers into the remote's allocations: the
    /// remote machine must outlive this connection, and must not be a
    /// fork (its memory layout would not be self-contained).
    pub unsafe fn remote_connect(&mut self, remote: &Machine) -> Result<()> {
        if remote.memory.is_fork() {
            return Err(MachineError::Config(
                "remote machine must not be a fork".into(),
            ));
        }
        let vmem = VirtualMem {
            gpa: REMOTE_GPA_BASE,
            size: remote.memory.max_mem(),
            host_addr: remote.memory.host_address(),
        };
        self.memory.install(&self.vm, SLOT_REMOTE_BASE, vmem, false)?;
        self.memory.set_remote(RemoteWindow {
            vmem,
            remote_max: remote.memory.max_mem(),
        });
        info!(
            "remote window connected: {} MiB at 0x{:x}",
            vmem.size >> 20,
            REMOTE_GPA_BASE
        );
        Ok(())
    }

    fn map_remote_fault(&mut self, window_addr: u64) -> Result<()> {
        let pte = {
            let window = self
                .memory
                .remote_window()
                .ok_or(MachineError::machine("Security violation", window_addr))?;
            let remote_gva = window_addr & REMOTE_GVA_MASK;
            let leaf = window.translate(remote_gva)?.ok_or(MachineError::machine(
                "unmapped remote virtual address",
                remote_gva,
            ))?;
            // An already-present local mapping means the fault was a
            // write to a read-only remote page.
            if pagetables::leaf_entry(&self.memory, window_addr)?
                .is_some_and(|p| p & PTE_PRESENT != 0)
            {
                return Err(MachineError::machine("Security violation", window_addr));
            }
            let remote_phys = leaf & PTE_ADDR_MASK;
            (REMOTE_GPA_BASE + remote_phys)
                | PTE_PRESENT
                | PTE_USER
                | (leaf & (PTE_RW | PTE_NX))
        };
        pagetables::map_remote_page(&mut self.memory, window_addr, pte)
    }

    // ─── Debugging ───────────────────────────────────────────────────

    /// Execute one guest instruction (single-step).  Recoverable events
    /// (page faults, syscalls) are serviced before returning.
    pub fn step_one(&mut self) -> Result<VcpuEvent> {
        self.vcpu.set_single_step(true)?;
        let result = self.run_debug_once();
        self.vcpu.set_single_step(false)?;
        result
    }

    /// Run until one of up to four hardware breakpoints (zero entries are
    /// unused) or another event.
    pub fn run_with_breakpoints(&mut self, breakpoints: &[u64; 4]) -> Result<VcpuEvent> {
        self.vcpu.set_hw_breakpoints(breakpoints)?;
        self.run_debug_once()
    }

    fn run_debug_once(&mut self) -> Result<VcpuEvent> {
        let registry = Arc::clone(&self.registry);
        let guard = self.vcpu.arm(0);
        let event = self.vcpu.run_once(&registry, &guard, 0)?;
        drop(guard);
        match event {
            VcpuEvent::Syscall(number) => self.dispatch_syscall(&registry, number)?,
            VcpuEvent::PageFault { addr, rdi } => self.handle_page_fault(&registry, addr, rdi)?,
            VcpuEvent::CpuFault { vector } => return Err(self.raise_cpu_exception(vector)),
            _ => {}
        }
        Ok(event)
    }

    /// Re-create the vCPU timer on the calling thread.  Required after
    /// moving the machine to another OS thread.
    pub fn migrate_to_this_thread(&mut self) -> Result<()> {
        self.vcpu.migrate_timer()
    }

    // ─── Diagnostics ─────────────────────────────────────────────────

    pub fn set_printer(&mut self, printer: Printer) {
        self.printer = printer;
    }

    pub fn print(&self, s: &str) {
        (self.printer)(s)
    }

    pub fn print_registers(&self) {
        let printer = &self.printer;
        self.vcpu
            .print_registers(&|s| printer(s), self.verbose_registers);
    }

    pub fn print_pagetables(&self) {
        let printer = &self.printer;
        pagetables::dump_pagetables(&self.memory, &mut |s| printer(s));
    }

    fn report_fatal(&self, error: &MachineError) {
        if matches!(error, MachineError::MachineException { .. }) {
            self.print(&format!("{error}\n"));
            self.print_registers();
        }
    }

    /// Print diagnostics for an unrecovered guest exception and build the
    /// error that surfaces it.
    fn raise_cpu_exception(&mut self, vector: u8) -> MachineError {
        let regs = match self.vcpu.registers() {
            Ok(regs) => regs,
            Err(e) => return e,
        };
        let has_code = exception_has_code(vector);
        let mut error_code = None;
        let frame_base = if has_code {
            let mut buf = [0u8; 8];
            if self.unsafe_copy_from_guest(&mut buf, regs.rsp).is_ok() {
                error_code = Some(u64::from_le_bytes(buf));
            }
            regs.rsp + 8
        } else {
            regs.rsp
        };

        self.print(&format!(
            "*** CPU EXCEPTION: {} (vector {})\n",
            exception_name(vector),
            vector
        ));
        if vector == 14 {
            if let Some(code) = error_code {
                self.print(&format!(
                    "Error code: 0x{:x} ({})\n",
                    code,
                    if code & 0x02 != 0 { "memory write" } else { "memory read" }
                ));
                self.print(if code & 0x01 != 0 {
                    "* Protection violation\n"
                } else {
                    "* Page not present\n"
                });
                if code & 0x04 != 0 {
                    self.print("* CPL=3 page fault\n");
                }
                if code & 0x08 != 0 {
                    self.print("* Page contains invalid (reserved) bits\n");
                }
                if code & 0x10 != 0 {
                    self.print("* Instruction fetch failed (NX-bit was set)\n");
                }
            }
        }

        let mut frame = [0u8; 40];
        if self.unsafe_copy_from_guest(&mut frame, frame_base).is_ok() {
            let word = |i: usize| u64::from_le_bytes(frame[i * 8..(i + 1) * 8].try_into().unwrap());
            self.print(&format!("Failing RIP: 0x{:x}\n", word(0)));
            self.print(&format!("Failing CS:  0x{:x}\n", word(1)));
            self.print(&format!("Fail RFLAGS: 0x{:x}\n", word(2)));
            self.print(&format!("Failing RSP: 0x{:x}\n", word(3)));
            self.print(&format!("Failing SS:  0x{:x}\n", word(4)));
        }
        self.print_registers();

        MachineError::CpuException { vector, error_code }
    }

    // ─── Userdata ────────────────────────────────────────────────────

    /// Attach host-side context readable from syscall handlers.
    pub fn set_userdata<T: Any + Send>(&mut self, data: T) {
        self.userdata = Some(Box::new(data));
    }

    pub fn userdata<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.userdata.as_mut()?.downcast_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::REMOTE_WINDOW_BASE;
    use crate::testelf;

    const BASE: u64 = 0x40_0000;
    const ENTRY: u64 = BASE + testelf::CODE_OFFSET;
    const DATA_ADDR: u64 = BASE + testelf::DATA_OFFSET;
    /// First heap page of a two-segment image (code + data).
    const HEAP1: u64 = BASE + 0x3000;
    const HEAP2: u64 = BASE + 0x4000;

    fn kvm_available() -> bool {
        Kvm::new().is_ok()
    }

    macro_rules! require_kvm {
        () => {
            if !kvm_available() {
                eprintln!("KVM not available, skipping");
                return;
            }
        };
    }

    /// `mov eax, 42 ; ret`
    fn ret42_code() -> Vec<u8> {
        vec![0xb8, 42, 0, 0, 0, 0xc3]
    }

    /// `mov byte [abs32], imm8`
    fn write_byte(addr: u64, value: u8) -> Vec<u8> {
        let mut code = vec![0xc6, 0x04, 0x25];
        code.extend_from_slice(&(addr as u32).to_le_bytes());
        code.push(value);
        code
    }

    fn machine_for(code: &[u8], data: &[u8]) -> Machine {
        let elf = testelf::static_executable(BASE, code, data);
        Machine::new(&elf, &MachineOptions::default()).unwrap()
    }

    #[test]
    fn construction_invariants() {
        require_kvm!();
        let vm = machine_for(&ret42_code(), &[]);
        let entry = vm.entry_address();
        assert!(entry >= BASE + testelf::CODE_OFFSET && entry < BASE + testelf::CODE_OFFSET + 0x1000);
        assert_eq!(vm.stack_address() % PAGE_SIZE, 0);
        assert!(vm.stack_address() > vm.heap_address());
        assert_ne!(vm.translate(entry), 0);
        assert_eq!(vm.mmap_start(), vm.heap_address() + BRK_MAX);
    }

    #[test]
    fn hello_return() {
        require_kvm!();
        let mut vm = machine_for(&ret42_code(), &[]);
        let ret = vm.vmcall(ENTRY, &[]).unwrap();
        assert_eq!(ret, 42);
    }

    #[test]
    fn copy_round_trip() {
        require_kvm!();
        let mut vm = machine_for(&ret42_code(), &[0u8; 16]);
        let data: Vec<u8> = (0u8..=255).cycle().take(2 * 4096 + 100).collect();
        vm.copy_to_guest(vm.heap_address() + 3, &data, false).unwrap();
        let mut out = vec![0u8; data.len()];
        vm.copy_from_guest(&mut out, vm.heap_address() + 3).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn unsafe_copy_matches_checked_copy_on_contiguous_ranges() {
        require_kvm!();
        let mut vm = machine_for(&ret42_code(), &[0u8; 16]);
        let data: Vec<u8> = (0u8..=255).collect();
        vm.copy_to_guest(vm.heap_address() + 8, &data, false).unwrap();

        let mut checked = vec![0u8; data.len()];
        let mut fast = vec![0u8; data.len()];
        vm.copy_from_guest(&mut checked, vm.heap_address() + 8).unwrap();
        vm.unsafe_copy_from_guest(&mut fast, vm.heap_address() + 8)
            .unwrap();
        assert_eq!(checked, fast);

        // Unmapped addresses still fail cleanly.
        assert!(vm.unsafe_copy_from_guest(&mut fast, 0x10).is_err());
    }

    #[test]
    fn options_printer_receives_fault_diagnostics() {
        require_kvm!();
        // `ud2` raises an invalid-opcode exception (vector 6, no error
        // code).
        let elf = testelf::static_executable(BASE, &[0x0f, 0x0b], &[]);
        let captured = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = Arc::clone(&captured);
        let options = MachineOptions {
            printer: Some(Arc::new(move |s: &str| sink.lock().unwrap().push_str(s))),
            verbose_registers: true,
            ..Default::default()
        };
        let mut vm = Machine::new(&elf, &options).unwrap();

        let err = vm.vmcall(ENTRY, &[]).unwrap_err();
        assert!(matches!(err, MachineError::CpuException { vector: 6, .. }));
        let out = captured.lock().unwrap();
        assert!(out.contains("Invalid opcode"));
        assert!(out.contains("R15"), "verbose dump must include R8-R15");
    }

    #[test]
    fn timeout_fires_and_reset_recovers() {
        require_kvm!();
        // spin: `jmp .` ; at +2: `mov eax, 42 ; ret`
        let mut code = vec![0xeb, 0xfe];
        code.extend_from_slice(&ret42_code());
        let elf = testelf::static_executable(BASE, &code, &[]);
        let options = MachineOptions::default();
        let mut parent = Machine::new(&elf, &options).unwrap();
        parent.prepare_copy_on_write().unwrap();
        let mut fork = Machine::fork(&parent, &options).unwrap();

        let started = std::time::Instant::now();
        let err = fork.timed_vmcall(ENTRY, 50, &[]).unwrap_err();
        assert!(matches!(err, MachineError::Timeout { millis: 50 }));
        assert!(
            started.elapsed() < std::time::Duration::from_secs(1),
            "timeout took {:?}",
            started.elapsed()
        );

        fork.reset_to(&parent, &options).unwrap();
        assert_eq!(fork.vmcall(ENTRY + 2, &[]).unwrap(), 42);
    }

    #[test]
    fn cow_fork_isolation_and_reset() {
        require_kvm!();
        let elf = testelf::static_executable(BASE, &ret42_code(), &[0u8; 8]);
        let options = MachineOptions::default();
        let mut parent = Machine::new(&elf, &options).unwrap();
        parent.prepare_copy_on_write().unwrap();
        assert!(parent.is_forkable());

        let mut fork = Machine::fork(&parent, &options).unwrap();
        assert!(fork.is_forked());
        fork.copy_to_guest(DATA_ADDR, &[0x5a], false).unwrap();

        let mut byte = [0u8; 1];
        parent.copy_from_guest(&mut byte, DATA_ADDR).unwrap();
        assert_eq!(byte[0], 0x00, "parent page must stay pristine");
        fork.copy_from_guest(&mut byte, DATA_ADDR).unwrap();
        assert_eq!(byte[0], 0x5a);
        assert_eq!(fork.banked_memory_pages(), 1);

        fork.reset_to(&parent, &options).unwrap();
        fork.copy_from_guest(&mut byte, DATA_ADDR).unwrap();
        assert_eq!(byte[0], 0x00);
        assert_eq!(fork.banked_memory_pages(), 0);
    }

    #[test]
    fn double_reset_is_idempotent() {
        require_kvm!();
        let elf = testelf::static_executable(BASE, &ret42_code(), &[0u8; 8]);
        let options = MachineOptions::default();
        let mut parent = Machine::new(&elf, &options).unwrap();
        parent.prepare_copy_on_write().unwrap();
        let mut fork = Machine::fork(&parent, &options).unwrap();

        fork.copy_to_guest(DATA_ADDR, &[0x77], false).unwrap();
        fork.reset_to(&parent, &options).unwrap();
        fork.reset_to(&parent, &options).unwrap();
        let mut byte = [0u8; 1];
        fork.copy_from_guest(&mut byte, DATA_ADDR).unwrap();
        assert_eq!(byte[0], 0);
        assert_eq!(fork.banked_memory_pages(), 0);
    }

    #[test]
    fn guest_write_is_banked_and_isolated() {
        require_kvm!();
        let mut code = write_byte(DATA_ADDR, 0x5a);
        code.push(0xc3);
        let elf = testelf::static_executable(BASE, &code, &[0u8; 8]);
        let options = MachineOptions::default();
        let mut parent = Machine::new(&elf, &options).unwrap();
        parent.prepare_copy_on_write().unwrap();
        let mut fork = Machine::fork(&parent, &options).unwrap();

        fork.vmcall(ENTRY, &[]).unwrap();

        let mut byte = [0u8; 1];
        parent.copy_from_guest(&mut byte, DATA_ADDR).unwrap();
        assert_eq!(byte[0], 0x00);
        fork.copy_from_guest(&mut byte, DATA_ADDR).unwrap();
        assert_eq!(byte[0], 0x5a);
        // The data page plus the stack page the call frame touched.
        assert!(fork.banked_memory_pages() >= 1);
    }

    fn double_rdi(machine: &mut Machine, _number: u32) -> Result<()> {
        let mut regs = machine.registers()?;
        regs.rax = regs.rdi * 2;
        machine.set_registers(&regs)
    }

    #[test]
    fn syscall_dispatch() {
        require_kvm!();
        // mov eax, 9 ; out 0, eax ; ret
        let code = vec![0xb8, 9, 0, 0, 0, 0xe7, 0x00, 0xc3];
        let elf = testelf::static_executable(BASE, &code, &[]);
        let mut registry = Registry::new();
        registry.install_syscall_handler(9, double_rdi);
        let options = MachineOptions {
            registry: Arc::new(registry),
            ..Default::default()
        };
        let mut vm = Machine::new(&elf, &options).unwrap();
        let ret = vm.vmcall(ENTRY, &[VmArg::U64(21)]).unwrap();
        assert_eq!(ret, 42);
    }

    #[test]
    fn mmio_write_is_fatal_with_address() {
        require_kvm!();
        let mut code = write_byte(HEAP1, 1);
        code.push(0xc3);
        let elf = testelf::static_executable(BASE, &code, &[0u8; 8]);
        let mut vm = Machine::new(&elf, &MachineOptions::default()).unwrap();

        // Point the heap page at a guest physical address no slot backs.
        let fake_gpa: u64 = 0x2_0000_0000;
        pagetables::set_leaf(
            &vm.memory,
            HEAP1,
            fake_gpa | PTE_PRESENT | PTE_RW | PTE_USER | PTE_NX,
        )
        .unwrap();

        let err = vm.vmcall(ENTRY, &[]).unwrap_err();
        match err {
            MachineError::MachineException { msg, data } => {
                assert!(msg.contains("outside physical memory"));
                assert_eq!(data & !(PAGE_SIZE - 1), fake_gpa);
            }
            other => panic!("expected machine exception, got {other}"),
        }
    }

    #[test]
    fn bank_exhaustion_fails_then_reset_recovers() {
        require_kvm!();
        // f1 (entry):      write HEAP1 ; ret
        // f2 (entry + 9):  write HEAP1 ; write HEAP2 ; ret
        let mut code = write_byte(HEAP1, 1);
        code.push(0xc3);
        let f2 = code.len() as u64;
        code.extend_from_slice(&write_byte(HEAP1, 1));
        code.extend_from_slice(&write_byte(HEAP2, 1));
        code.push(0xc3);
        let elf = testelf::static_executable(BASE, &code, &[0u8; 8]);

        // Two bank pages: one for the call stack, one for a data page.
        let options = MachineOptions {
            max_cow_mem: 2 * PAGE_SIZE,
            ..Default::default()
        };
        let mut parent = Machine::new(&elf, &options).unwrap();
        parent.prepare_copy_on_write().unwrap();
        let mut fork = Machine::fork(&parent, &options).unwrap();

        let err = fork.timed_vmcall(ENTRY + f2, 1000, &[]).unwrap_err();
        assert!(matches!(
            err,
            MachineError::MemoryException {
                msg: "memory bank exhausted",
                ..
            }
        ));

        fork.reset_to(&parent, &options).unwrap();
        assert_eq!(fork.banked_memory_pages(), 0);
        fork.vmcall(ENTRY, &[]).unwrap();
        assert_eq!(fork.banked_memory_pages(), 2);
    }

    #[test]
    fn mmap_allocate_exhausts_deterministically() {
        require_kvm!();
        let elf = testelf::static_executable(BASE, &ret42_code(), &[]);
        let options = MachineOptions {
            max_mem: 16 * 1024 * 1024,
            stack_size: 1024 * 1024,
            ..Default::default()
        };
        let mut vm = Machine::new(&elf, &options).unwrap();

        let first = vm.mmap_allocate(1024 * 1024).unwrap();
        assert_eq!(first, vm.mmap_start());
        let mut allocations = 1;
        loop {
            match vm.mmap_allocate(1024 * 1024) {
                Ok(addr) => {
                    assert_eq!(addr % PAGE_SIZE, 0);
                    allocations += 1;
                    assert!(allocations < 64, "allocator failed to exhaust");
                }
                Err(MachineError::MemoryException { msg, .. }) => {
                    assert_eq!(msg, "mmap region exhausted");
                    break;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        // Exhaustion is sticky.
        assert!(vm.mmap_allocate(1024 * 1024).is_err());
    }

    #[test]
    fn install_then_delete_slot_is_invisible() {
        require_kvm!();
        let mut vm = machine_for(&ret42_code(), &[]);
        let vmem = VirtualMem {
            gpa: 0x1_0000_0000,
            size: PAGE_SIZE,
            host_addr: vm.memory.host_address(),
        };
        vm.install_memory(10, vmem, true).unwrap();
        vm.delete_memory(10).unwrap();
        assert_eq!(vm.vmcall(ENTRY, &[]).unwrap(), 42);
    }

    #[test]
    fn call_stack_is_sysv_aligned() {
        require_kvm!();
        let mut vm = machine_for(&ret42_code(), &[]);
        let mut regs = kvm_regs::default();
        vm.setup_call(&mut regs, ENTRY, vm.stack_address(), &[]).unwrap();
        assert_eq!(regs.rsp % 16, 8, "entry RSP must be 8 mod 16 after the call push");

        let args = [VmArg::U64(1); 9];
        let mut regs = kvm_regs::default();
        vm.setup_call(&mut regs, ENTRY, vm.stack_address(), &args).unwrap();
        assert_eq!(regs.rsp % 16, 8);
        assert_eq!(regs.rdi, 1);
    }

    #[test]
    fn float_args_land_in_xmm() {
        require_kvm!();
        let mut vm = machine_for(&ret42_code(), &[]);
        let mut regs = kvm_regs::default();
        vm.setup_call(
            &mut regs,
            ENTRY,
            vm.stack_address(),
            &[VmArg::F64(1.5), VmArg::F32(2.0)],
        )
        .unwrap();
        let fpu = vm.vcpu.get_fpu().unwrap();
        assert_eq!(fpu.xmm[0][..8], 1.5f64.to_le_bytes());
        assert_eq!(fpu.xmm[1][..4], 2.0f32.to_le_bytes());
    }

    #[test]
    fn string_args_are_pushed_with_pointers() {
        require_kvm!();
        let mut vm = machine_for(&ret42_code(), &[]);
        let mut regs = kvm_regs::default();
        vm.setup_call(&mut regs, ENTRY, vm.stack_address(), &[VmArg::Str("hello")])
            .unwrap();
        let mut buf = [0u8; 6];
        vm.copy_from_guest(&mut buf, regs.rdi).unwrap();
        assert_eq!(&buf, b"hello\0");
    }

    #[test]
    fn argv_run_reads_argc() {
        require_kvm!();
        // _start has no return address, so the guest parks argc in RBX
        // (the stop `out` needs EAX) and terminates through port 0.
        let code = vec![
            0x48, 0x8b, 0x04, 0x24, // mov rax, [rsp]
            0x48, 0x89, 0xc3, // mov rbx, rax
            0xb8, 0xff, 0xff, 0x00, 0x00, // mov eax, 0xFFFF
            0xe7, 0x00, // out 0, eax
        ];
        let elf = testelf::static_executable(BASE, &code, &[]);
        let mut vm = Machine::new(&elf, &MachineOptions::default()).unwrap();
        vm.setup_argv(&["prog", "arg1"], &["KEY=value"]).unwrap();
        vm.run(1000).unwrap();
        assert_eq!(vm.registers().unwrap().rbx, 2);
    }

    #[test]
    fn remote_window_read() {
        require_kvm!();
        // Remote machine holds 0x77 in its data page.
        let remote_elf =
            testelf::static_executable(BASE, &ret42_code(), &[0x77, 0, 0, 0, 0, 0, 0, 0]);
        let remote = Machine::new(&remote_elf, &MachineOptions::default()).unwrap();

        // Local guest: mov rax, [moffs64 window] ; ret
        let window_addr = REMOTE_WINDOW_BASE + DATA_ADDR;
        let mut code = vec![0x48, 0xa1];
        code.extend_from_slice(&window_addr.to_le_bytes());
        code.push(0xc3);
        let elf = testelf::static_executable(BASE, &code, &[]);
        let mut vm = Machine::new(&elf, &MachineOptions::default()).unwrap();
        // SAFETY: `remote` outlives the call below.
        unsafe { vm.remote_connect(&remote).unwrap() };

        let value = vm.vmcall(ENTRY, &[]).unwrap();
        assert_eq!(value & 0xff, 0x77);
    }

    #[test]
    fn fork_requires_prepared_pristine_parent() {
        require_kvm!();
        let options = MachineOptions::default();
        let parent = machine_for(&ret42_code(), &[]);
        assert!(Machine::fork(&parent, &options).is_err());
    }
}
