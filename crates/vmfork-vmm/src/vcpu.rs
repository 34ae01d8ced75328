//! One hardware vCPU and the classification of its exits.
//!
//! [`Vcpu`] owns the KVM vCPU file descriptor (and with it the mmap'd
//! run-state page kvm-ioctls manages), the per-vCPU interval timer, and
//! the cached values the kernel-integrity check compares against after
//! every exit.
//!
//! [`Vcpu::run_once`] performs one `KVM_RUN` and interprets the hardware
//! exit into a semantic [`VcpuEvent`].  The machine's run loop owns the
//! dispatch: page faults go to the memory subsystem, syscalls and I/O to
//! the registry, everything fatal is raised as an error here.

use crate::error::{MachineError, Result};
use crate::layout::{
    EXCEPTION_PORT_BASE, EXCEPTION_PORT_END, GDT_ADDR, IDT_ADDR, INTR_ASM_ADDR, PAGE_SIZE,
    PT_BASE, STOP_VALUE, SYSCALL_PORT,
};
use crate::registry::Registry;
use crate::timer::{self, TimerGuard, VcpuTimer};
use kvm_bindings::{
    kvm_fpu, kvm_guest_debug, kvm_regs, kvm_sregs, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP,
    KVM_GUESTDBG_USE_HW_BP, KVM_MAX_CPUID_ENTRIES,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use log::error;

/// Mask recovering the page-aligned fault address from the RDI channel:
/// bit 63 is the remote-call tag, the low bits are the page offset.
const FAULT_ADDR_MASK: u64 = !0x8000_0000_0000_0FFF;

/// A semantic event decoded from one KVM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuEvent {
    /// The guest terminated the call (stop value on the syscall port).
    Stopped,
    /// Nothing to dispatch; re-enter the guest.
    Continue,
    /// `KVM_EXIT_DEBUG` — single-step or hardware breakpoint; returned to
    /// the caller driving the stepping.
    Debug,
    /// Numbered system call from the guest.
    Syscall(u32),
    /// Guest debug trap (vector 1) routed through the interrupt stubs.
    Breakpoint,
    /// Recoverable guest page fault. `addr` is page-aligned with the tag
    /// bit cleared; `rdi` is the raw fault channel including the tag.
    PageFault { addr: u64, rdi: u64 },
    /// An unrecovered CPU exception; the machine raises it after printing
    /// diagnostics.
    CpuFault { vector: u8 },
    /// `out` to a port outside the reserved protocol ranges.
    IoOut { port: u16, value: u32 },
}

enum RawExit {
    Resume,
    Hlt,
    Debug,
    Mmio(u64),
    FailEntry(u64),
    Shutdown,
    InternalError,
    Unknown,
    IoOut { port: u16, value: u32 },
}

/// One hardware vCPU bound to its file descriptor, run-state page and
/// interval timer.
pub struct Vcpu {
    fd: VcpuFd,
    timer: VcpuTimer,
    pub(crate) stopped: bool,
    expected_cr3: u64,
    expected_gdt_base: u64,
    expected_idt_base: u64,
}

impl Vcpu {
    /// Create vCPU 0 for `vm`, with the host-supported CPUID applied and
    /// a timer bound to the calling thread.
    pub(crate) fn new(kvm: &Kvm, vm: &VmFd) -> Result<Self> {
        let fd = vm.create_vcpu(0).map_err(MachineError::VcpuCreate)?;
        let cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(MachineError::SetCpuid)?;
        fd.set_cpuid2(&cpuid).map_err(MachineError::SetCpuid)?;
        Ok(Self {
            fd,
            timer: VcpuTimer::new()?,
            stopped: true,
            expected_cr3: PT_BASE,
            expected_gdt_base: GDT_ADDR,
            expected_idt_base: IDT_ADDR,
        })
    }

    /// Arm the execution timeout for one run. `millis == 0` disables it.
    pub(crate) fn arm(&self, millis: u32) -> TimerGuard {
        self.timer.arm(millis)
    }

    /// Re-create the timer on the calling thread (machine migration).
    pub(crate) fn migrate_timer(&mut self) -> Result<()> {
        self.timer = VcpuTimer::new()?;
        Ok(())
    }

    // ─── Register access ─────────────────────────────────────────────

    pub fn registers(&self) -> Result<kvm_regs> {
        self.fd.get_regs().map_err(MachineError::GetRegisters)
    }

    pub fn set_registers(&self, regs: &kvm_regs) -> Result<()> {
        self.fd.set_regs(regs).map_err(MachineError::SetRegisters)
    }

    pub fn get_special_registers(&self) -> Result<kvm_sregs> {
        self.fd.get_sregs().map_err(MachineError::GetSregs)
    }

    pub fn set_special_registers(&self, sregs: &kvm_sregs) -> Result<()> {
        self.fd.set_sregs(sregs).map_err(MachineError::SetSregs)
    }

    pub fn get_fpu(&self) -> Result<kvm_fpu> {
        self.fd.get_fpu().map_err(MachineError::GetFpu)
    }

    pub fn set_fpu(&self, fpu: &kvm_fpu) -> Result<()> {
        self.fd.set_fpu(fpu).map_err(MachineError::SetFpu)
    }

    // ─── Guest debug ─────────────────────────────────────────────────

    pub(crate) fn set_single_step(&self, enable: bool) -> Result<()> {
        let mut dbg = kvm_guest_debug::default();
        if enable {
            dbg.control = KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP;
        }
        self.fd
            .set_guest_debug(&dbg)
            .map_err(MachineError::SetGuestDebug)
    }

    pub(crate) fn set_hw_breakpoints(&self, breakpoints: &[u64; 4]) -> Result<()> {
        let mut dbg = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_HW_BP,
            ..Default::default()
        };
        for (i, bp) in breakpoints.iter().enumerate() {
            dbg.arch.debugreg[i] = *bp;
            if *bp != 0 {
                dbg.arch.debugreg[7] |= 0x3 << (2 * i);
            }
        }
        self.fd
            .set_guest_debug(&dbg)
            .map_err(MachineError::SetGuestDebug)
    }

    // ─── Exit loop ───────────────────────────────────────────────────

    /// One iteration of the exit loop: enter the guest, interpret the
    /// exit.  `guard` is the armed (or unarmed) timeout for this run and
    /// `timeout_ms` the deadline it carries, reported in the timeout
    /// error.
    pub(crate) fn run_once(
        &mut self,
        registry: &Registry,
        guard: &TimerGuard,
        timeout_ms: u32,
    ) -> Result<VcpuEvent> {
        let raw = match self.fd.run() {
            Err(e) => {
                if e.errno() == libc::EINTR {
                    if guard.armed() || timer::fired() {
                        return Err(MachineError::Timeout { millis: timeout_ms });
                    }
                    // Spurious signal with no timer armed: re-enter the
                    // guest rather than surfacing a host artefact.
                    RawExit::Resume
                } else {
                    return Err(MachineError::VcpuRun(e));
                }
            }
            Ok(exit) => match exit {
                VcpuExit::IoOut(port, data) => {
                    let mut bytes = [0u8; 4];
                    let n = data.len().min(4);
                    bytes[..n].copy_from_slice(&data[..n]);
                    RawExit::IoOut {
                        port,
                        value: u32::from_le_bytes(bytes),
                    }
                }
                VcpuExit::IoIn(port, data) => {
                    // The reply must be written while the exit frame is
                    // live, hence the registry access from in here.
                    let value = registry.input(port).to_le_bytes();
                    let n = data.len().min(4);
                    data[..n].copy_from_slice(&value[..n]);
                    RawExit::Resume
                }
                VcpuExit::Hlt => RawExit::Hlt,
                VcpuExit::Debug(_) => RawExit::Debug,
                VcpuExit::MmioRead(addr, _) => RawExit::Mmio(addr),
                VcpuExit::MmioWrite(addr, _) => RawExit::Mmio(addr),
                VcpuExit::FailEntry(reason, _) => RawExit::FailEntry(reason),
                VcpuExit::Shutdown => RawExit::Shutdown,
                VcpuExit::InternalError => RawExit::InternalError,
                other => {
                    error!("unexpected KVM exit: {other:?}");
                    RawExit::Unknown
                }
            },
        };

        // The signal may have landed after the guest re-entered; the
        // thread-local flag catches what the EINTR path missed.
        if guard.armed() && timer::fired() {
            return Err(MachineError::Timeout { millis: timeout_ms });
        }

        // Validate the integrity of the guest's kernel space.
        let sregs = self.get_special_registers()?;
        if sregs.cr3 != self.expected_cr3
            || sregs.gdt.base != self.expected_gdt_base
            || sregs.idt.base != self.expected_idt_base
        {
            return Err(MachineError::machine(
                "Kernel integrity loss detected",
                sregs.cr3,
            ));
        }

        match raw {
            RawExit::Resume => Ok(VcpuEvent::Continue),
            RawExit::Debug => Ok(VcpuEvent::Debug),
            RawExit::Hlt => Err(MachineError::machine("Halt from kernel space", 5)),
            RawExit::FailEntry(reason) => Err(MachineError::machine(
                "Failed to start guest, misconfigured?",
                reason,
            )),
            RawExit::Shutdown => Err(MachineError::machine("Shutdown! Triple fault?", 32)),
            RawExit::InternalError => Err(MachineError::machine("KVM internal error", 0)),
            RawExit::Unknown => Err(MachineError::machine("Unexpected KVM exit reason", 0)),
            RawExit::Mmio(addr) => Err(MachineError::machine(
                "Memory access outside physical memory",
                addr,
            )),
            RawExit::IoOut { port, value } => self.classify_io_out(&sregs, port, value),
        }
    }

    fn classify_io_out(&mut self, sregs: &kvm_sregs, port: u16, value: u32) -> Result<VcpuEvent> {
        if port == SYSCALL_PORT {
            if value == STOP_VALUE {
                self.stopped = true;
                return Ok(VcpuEvent::Stopped);
            }
            return Ok(VcpuEvent::Syscall(value));
        }
        if (EXCEPTION_PORT_BASE..EXCEPTION_PORT_END).contains(&port) {
            let vector = (port - EXCEPTION_PORT_BASE) as u8;
            return match vector {
                1 => Ok(VcpuEvent::Breakpoint),
                14 => {
                    let regs = self.registers()?;
                    // Only the sanctioned stub, in kernel ring, may
                    // report a recoverable page fault.
                    let in_stub =
                        regs.rip >= INTR_ASM_ADDR && regs.rip < INTR_ASM_ADDR + PAGE_SIZE;
                    if !in_stub || sregs.cs.dpl != 0 || sregs.ss.dpl != 0 {
                        return Err(MachineError::machine("Security violation", vector as u64));
                    }
                    Ok(VcpuEvent::PageFault {
                        addr: regs.rdi & FAULT_ADDR_MASK,
                        rdi: regs.rdi,
                    })
                }
                vector => Ok(VcpuEvent::CpuFault { vector }),
            };
        }
        Ok(VcpuEvent::IoOut { port, value })
    }

    /// Format a register dump through `print`, one line at a time.
    /// `verbose` adds R8–R15 and control-register flag decoding.
    pub fn print_registers(&self, print: &dyn Fn(&str), verbose: bool) {
        let Ok(sregs) = self.get_special_registers() else {
            print("register state unavailable\n");
            return;
        };
        let Ok(regs) = self.registers() else {
            print("register state unavailable\n");
            return;
        };
        print(&format!(
            "CR0: 0x{:X}  CR3: 0x{:X}\nCR2: 0x{:X}  CR4: 0x{:X}\n",
            sregs.cr0, sregs.cr3, sregs.cr2, sregs.cr4
        ));
        print(&format!(
            "RAX: 0x{:X}  RBX: 0x{:X}  RCX: 0x{:X}\nRDX: 0x{:X}  RSI: 0x{:X}  RDI: 0x{:X}\n",
            regs.rax, regs.rbx, regs.rcx, regs.rdx, regs.rsi, regs.rdi
        ));
        print(&format!(
            "RIP: 0x{:X}  RBP: 0x{:X}  RSP: 0x{:X}\n",
            regs.rip, regs.rbp, regs.rsp
        ));
        print(&format!(
            "SS: 0x{:X}  CS: 0x{:X}  DS: 0x{:X}  FS: 0x{:X}  GS: 0x{:X}\n",
            sregs.ss.selector,
            sregs.cs.selector,
            sregs.ds.selector,
            sregs.fs.selector,
            sregs.gs.selector
        ));
        if verbose {
            print(&format!(
                "R8:  0x{:X}  R9:  0x{:X}  R10: 0x{:X}  R11: 0x{:X}\n",
                regs.r8, regs.r9, regs.r10, regs.r11
            ));
            print(&format!(
                "R12: 0x{:X}  R13: 0x{:X}  R14: 0x{:X}  R15: 0x{:X}\n",
                regs.r12, regs.r13, regs.r14, regs.r15
            ));
            print(&format!(
                "CR0 PE={} MP={} EM={} WP={}\n",
                sregs.cr0 & 1,
                (sregs.cr0 >> 1) & 1,
                (sregs.cr0 >> 2) & 1,
                (sregs.cr0 >> 16) & 1
            ));
            print(&format!(
                "CR4 PAE={} OSFXSR={} OSXMMEXCPT={}\n",
                (sregs.cr4 >> 5) & 1,
                (sregs.cr4 >> 9) & 1,
                (sregs.cr4 >> 10) & 1
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kvm_available() -> bool {
        Kvm::new().is_ok()
    }

    #[test]
    fn vcpu_creation_and_register_round_trip() {
        if !kvm_available() {
            eprintln!("KVM not available, skipping");
            return;
        }
        let kvm = Kvm::new().unwrap();
        let vm = kvm.create_vm().unwrap();
        let vcpu = Vcpu::new(&kvm, &vm).unwrap();

        let mut regs = vcpu.registers().unwrap();
        regs.rax = 0x1234;
        regs.rbx = 0x5678;
        vcpu.set_registers(&regs).unwrap();
        let back = vcpu.registers().unwrap();
        assert_eq!(back.rax, 0x1234);
        assert_eq!(back.rbx, 0x5678);
    }

    #[test]
    fn fresh_vcpu_is_stopped() {
        if !kvm_available() {
            eprintln!("KVM not available, skipping");
            return;
        }
        let kvm = Kvm::new().unwrap();
        let vm = kvm.create_vm().unwrap();
        let vcpu = Vcpu::new(&kvm, &vm).unwrap();
        assert!(vcpu.stopped);
    }
}
