//! Guest-physical memory layout for the vmfork monitor.
//!
//! All guest-visible kernel structures live at fixed, well-known offsets in
//! low guest-physical memory.  Guest virtual addresses are identity-mapped
//! onto guest physical addresses, so these constants double as guest
//! virtual addresses.
//!
//! # Guest Physical Memory Layout
//!
//! ```text
//! 0x0000_0000  ┌───────────────────────────────┐
//!              │  unmapped (null-deref trap)    │
//! 0x0000_1000  ├───────────────────────────────┤
//!              │  GDT / TSS / IDT page          │
//! 0x0000_2000  ├───────────────────────────────┤
//!              │  Interrupt stub code           │
//! 0x0000_3000  ├───────────────────────────────┤
//!              │  Exit trampoline (user, x)     │
//! 0x0000_4000  ├───────────────────────────────┤
//!              │  Kernel interrupt stack        │
//! 0x0000_5000  ├───────────────────────────────┤
//!              │  Page tables (PML4 first)      │
//! kernel_end   ├───────────────────────────────┤
//!              │  User image (ELF PT_LOADs)     │
//!              │  Heap (brk), mmap region ...   │
//!              │  Stack (grows down from top)   │
//! max_mem      ├───────────────────────────────┤
//!              │  MemoryBank slot (forks)       │
//!              └───────────────────────────────┘
//! ```

/// Size of a guest page.
pub const PAGE_SIZE: u64 = 0x1000;

/// Offset of the boot GDT in guest physical memory.
///
/// Seven 8-byte descriptor slots: NULL, kernel CODE64, kernel DATA,
/// user CODE64, user DATA, and a 16-byte TSS descriptor.
pub const GDT_ADDR: u64 = 0x1600;

/// Offset of the 64-bit TSS structure (104 bytes).
///
/// Only `rsp0` matters: it is the kernel stack the CPU switches to when an
/// exception arrives from user mode.
pub const TSS_ADDR: u64 = 0x1700;

/// Offset of the IDT: [`IDT_ENTRIES`] 16-byte interrupt gates.
pub const IDT_ADDR: u64 = 0x1800;

/// Guest-physical address of the interrupt stub code page.
///
/// Every IDT gate points into this page; each vector's stub routes the
/// exception to the host via an `out` to port `0x80 + vector`.
pub const INTR_ASM_ADDR: u64 = 0x2000;

/// Guest-physical address of the user-mode exit trampoline.
///
/// A synthetic return address pushed by call setup; a guest `ret` lands
/// here and the trampoline writes the stop value to port 0.
pub const EXIT_ASM_ADDR: u64 = 0x3000;

/// Kernel interrupt stack page. `TSS.rsp0` points at the top of it.
pub const KERNEL_STACK_ADDR: u64 = 0x4000;

/// Top of the kernel interrupt stack (exclusive).
pub const KERNEL_STACK_TOP: u64 = KERNEL_STACK_ADDR + PAGE_SIZE;

/// Physical address of the PML4 — the page-table root loaded into CR3.
///
/// Further table pages are allocated upward from here; the region ends at
/// [`kernel_end`].
pub const PT_BASE: u64 = 0x5000;

/// Number of IDT gates written (CPU exception vectors 0–31).
pub const IDT_ENTRIES: usize = 32;

/// Byte stride between per-vector interrupt stubs in the stub page.
pub const STUB_STRIDE: u64 = 32;

// ─── Segment selectors ───────────────────────────────────────────────

/// Kernel 64-bit code selector (GDT index 1, ring 0).
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector (GDT index 2, ring 0).
pub const KERNEL_DS: u16 = 0x10;
/// User 64-bit code selector (GDT index 3, RPL 3).
pub const USER_CS: u16 = 0x18 | 3;
/// User data selector (GDT index 4, RPL 3).
pub const USER_DS: u16 = 0x20 | 3;
/// TSS selector (GDT indices 5–6; 16-byte system descriptor).
pub const TSS_SEL: u16 = 0x28;

/// Number of 8-byte GDT slots written (the TSS descriptor uses two).
pub const GDT_ENTRY_COUNT: usize = 7;

// ─── GDT descriptor flags ────────────────────────────────────────────
//
// flags[7:0] is the access byte, flags[15:12] the granularity nibble,
// packed the same way the raw descriptor stores them.

/// Ring-0 64-bit code segment (present, exec-read, L=1).
pub const GDT_FLAGS_KERNEL_CODE: u16 = 0xa09b;
/// Ring-0 data segment (present, read-write).
pub const GDT_FLAGS_KERNEL_DATA: u16 = 0xc093;
/// Ring-3 64-bit code segment (present, DPL=3, exec-read, L=1).
pub const GDT_FLAGS_USER_CODE: u16 = 0xa0fb;
/// Ring-3 data segment (present, DPL=3, read-write).
pub const GDT_FLAGS_USER_DATA: u16 = 0xc0f3;
/// 64-bit TSS descriptor (present, type=1011 busy).
pub const GDT_FLAGS_TSS: u16 = 0x808b;

// ─── Host↔guest I/O protocol ─────────────────────────────────────────

/// OUT to this port carries a 32-bit system-call number.
pub const SYSCALL_PORT: u16 = 0x0;

/// Syscall-port value that terminates the current call.
pub const STOP_VALUE: u32 = 0xFFFF;

/// First exception-report port: vector `v` traps as port `0x80 + v`.
pub const EXCEPTION_PORT_BASE: u16 = 0x80;

/// One past the last exception-report port.
pub const EXCEPTION_PORT_END: u16 = 0x100;

// ─── Remote window ───────────────────────────────────────────────────

/// Base of the high-address window projecting a remote machine.
///
/// Bit 63 of a faulting address doubles as the remote-call tag; the
/// remainder (below bit 47) is the remote guest virtual address.
pub const REMOTE_WINDOW_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Mask recovering a remote guest virtual address from a window address.
pub const REMOTE_GVA_MASK: u64 = 0x0000_7FFF_FFFF_FFFF;

/// Spare page-table pages reserved for mapping the remote window.
pub const REMOTE_SPARE_TABLES: u64 = 8;

// ─── Derived layout ──────────────────────────────────────────────────

/// Number of page-table pages needed to identity-map `max_mem` bytes with
/// 4 KiB leaves, plus the remote-window spares.
pub const fn page_table_pages(max_mem: u64) -> u64 {
    let leaves = max_mem.div_ceil(2 * 1024 * 1024);
    let dirs = max_mem.div_ceil(1024 * 1024 * 1024);
    // PML4 + PDPT + directories + leaf tables + remote spares.
    1 + 1 + dirs + leaves + REMOTE_SPARE_TABLES
}

/// End of the kernel region (exclusive): everything below this address is
/// supervisor-only and privately copied into each fork.
pub const fn kernel_end(max_mem: u64) -> u64 {
    PT_BASE + page_table_pages(max_mem) * PAGE_SIZE
}

/// Align `addr` down to a page boundary.
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Align `addr` up to a page boundary.
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
