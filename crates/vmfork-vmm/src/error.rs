//! Error taxonomy for the vmfork monitor.
//!
//! Four semantic failure classes surface out of guest execution:
//!
//! - [`MachineError::MachineException`] — programmer or configuration
//!   fault (kernel integrity loss, MMIO write, failed entry, shutdown,
//!   security violation).  Fatal for the machine.
//! - [`MachineError::Timeout`] — the per-vCPU interval timer fired.
//! - [`MachineError::MemoryException`] — memory bank exhausted or a
//!   protection violation during a host-initiated copy.
//! - [`MachineError::CpuException`] — a guest fault the monitor does not
//!   recover (e.g. #GP, #UD), with the vector name and optional error
//!   code.
//!
//! The remaining variants wrap setup failures from KVM, the memory
//! backend and the ELF loader.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = MachineError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error("Failed to open /dev/kvm: {0}")]
    KvmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU: {0}")]
    VcpuCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to set CPUID on vCPU: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("Failed to set user memory region (slot {slot}): {source}")]
    SetMemoryRegion {
        slot: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to get vCPU registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("Failed to get vCPU special registers: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU special registers: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to get vCPU FPU state: {0}")]
    GetFpu(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU FPU state: {0}")]
    SetFpu(#[source] kvm_ioctls::Error),

    #[error("Failed to set guest debug state: {0}")]
    SetGuestDebug(#[source] kvm_ioctls::Error),

    #[error("KVM_RUN failed: {0}")]
    VcpuRun(#[source] kvm_ioctls::Error),

    #[error("Failed to create guest memory region of {size} bytes")]
    MemoryCreate { size: usize },

    #[error("Failed to create vCPU interval timer: {0}")]
    TimerCreate(#[source] std::io::Error),

    #[error("Failed to load guest ELF: {0}")]
    ElfLoad(#[source] linux_loader::loader::Error),

    #[error("Invalid guest binary: {0}")]
    InvalidBinary(String),

    #[error("Invalid machine configuration: {0}")]
    Config(String),

    /// Fatal monitor-level fault. `data` carries a fault address or an
    /// exit/diagnostic code depending on `msg`.
    #[error("Machine exception: {msg} (data: 0x{data:x})")]
    MachineException { msg: &'static str, data: u64 },

    /// The execution timeout fired. Carries the configured deadline.
    #[error("Timeout exception: execution exceeded {millis} ms")]
    Timeout { millis: u32 },

    #[error("Memory exception: {msg} (addr: 0x{addr:x}, size: {size})")]
    MemoryException {
        msg: &'static str,
        addr: u64,
        size: u64,
    },

    /// A guest CPU exception surfaced to the host unrecovered.
    #[error("CPU exception: {name} (vector {vector}{code})",
        name = exception_name(*vector),
        code = match error_code {
            Some(c) => format!(", error code 0x{c:x}"),
            None => String::new(),
        })]
    CpuException {
        vector: u8,
        error_code: Option<u64>,
    },
}

impl MachineError {
    /// Shorthand used by the run loop for fatal monitor faults.
    pub(crate) fn machine(msg: &'static str, data: u64) -> Self {
        MachineError::MachineException { msg, data }
    }
}

/// Name of an x86_64 CPU exception vector.
pub fn exception_name(vector: u8) -> &'static str {
    const NAMES: [&str; 32] = [
        "Divide-by-zero error",
        "Debug",
        "Non-maskable interrupt",
        "Breakpoint",
        "Overflow",
        "Bound range exceeded",
        "Invalid opcode",
        "Device not available",
        "Double fault",
        "Coprocessor segment overrun",
        "Invalid TSS",
        "Segment not present",
        "Stack-segment fault",
        "General protection fault",
        "Page fault",
        "Reserved",
        "x87 floating-point exception",
        "Alignment check",
        "Machine check",
        "SIMD floating-point exception",
        "Virtualization exception",
        "Control protection exception",
        "Reserved",
        "Reserved",
        "Reserved",
        "Reserved",
        "Reserved",
        "Reserved",
        "Hypervisor injection exception",
        "VMM communication exception",
        "Security exception",
        "Reserved",
    ];
    NAMES.get(vector as usize).copied().unwrap_or("Unknown")
}

/// Whether the CPU pushes an error code for `vector`.
pub fn exception_has_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21 | 29 | 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_fault_name() {
        assert_eq!(exception_name(14), "Page fault");
    }

    #[test]
    fn unknown_vector_name() {
        assert_eq!(exception_name(200), "Unknown");
    }

    #[test]
    fn error_code_vectors() {
        assert!(exception_has_code(13));
        assert!(exception_has_code(14));
        assert!(!exception_has_code(6));
        assert!(!exception_has_code(1));
    }

    #[test]
    fn timeout_display_carries_deadline() {
        let err = MachineError::Timeout { millis: 50 };
        assert!(err.to_string().contains("50 ms"));
    }

    #[test]
    fn cpu_exception_display() {
        let err = MachineError::CpuException {
            vector: 13,
            error_code: Some(0x10),
        };
        let s = err.to_string();
        assert!(s.contains("General protection fault"));
        assert!(s.contains("0x10"));
    }
}
