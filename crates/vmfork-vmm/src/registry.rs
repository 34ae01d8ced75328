//! Host callback registries: system calls, I/O ports, breakpoints.
//!
//! Handlers are plain function pointers collected into a [`Registry`]
//! that is threaded into machines at construction time via
//! `MachineOptions` — registration happens once during startup, after
//! which every read is a lock-free load through the shared `Arc`.
//!
//! A system-call handler receives the machine and the call number and may
//! read and write guest registers and memory, or stop the call.  The
//! input-port handler is deliberately narrower: it must produce the value
//! *before* the vCPU re-enters, while the exit frame is still borrowed,
//! so it only sees the port number.

use crate::error::Result;
use crate::machine::Machine;

/// Upper bound on numbered system calls.
pub const MAX_SYSCALLS: usize = 512;

/// Handles one numbered system call.
pub type SyscallHandler = fn(&mut Machine, u32) -> Result<()>;

/// Handles an `out` to a port outside the reserved protocol ranges.
pub type OutputHandler = fn(&mut Machine, u16, u32) -> Result<()>;

/// Produces the 32-bit value an `in` from `port` reads.
pub type InputHandler = fn(u16) -> u32;

/// Invoked on a guest debug trap (vector 1).
pub type BreakpointHandler = fn(&mut Machine) -> Result<()>;

/// Handles a remote-call page fault (bit 63 tag); receives the remote
/// guest virtual address.
pub type RemoteHandler = fn(&mut Machine, u64) -> Result<()>;

/// Write-once table of host callbacks.
pub struct Registry {
    syscalls: [Option<SyscallHandler>; MAX_SYSCALLS],
    unhandled_syscall: Option<SyscallHandler>,
    on_output: Option<OutputHandler>,
    on_input: Option<InputHandler>,
    on_breakpoint: Option<BreakpointHandler>,
    on_remote: Option<RemoteHandler>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            syscalls: [None; MAX_SYSCALLS],
            unhandled_syscall: None,
            on_output: None,
            on_input: None,
            on_breakpoint: None,
            on_remote: None,
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler for syscall number `idx`.
    ///
    /// # Panics
    ///
    /// Panics when `idx` is at or beyond [`MAX_SYSCALLS`] — registration
    /// is init-time code where a bad number is a programming error.
    pub fn install_syscall_handler(&mut self, idx: usize, handler: SyscallHandler) {
        self.syscalls[idx] = Some(handler);
    }

    /// Fallback for syscall numbers with no registered handler.
    pub fn install_unhandled_syscall_handler(&mut self, handler: SyscallHandler) {
        self.unhandled_syscall = Some(handler);
    }

    pub fn install_output_handler(&mut self, handler: OutputHandler) {
        self.on_output = Some(handler);
    }

    pub fn install_input_handler(&mut self, handler: InputHandler) {
        self.on_input = Some(handler);
    }

    pub fn install_breakpoint_handler(&mut self, handler: BreakpointHandler) {
        self.on_breakpoint = Some(handler);
    }

    pub fn install_remote_handler(&mut self, handler: RemoteHandler) {
        self.on_remote = Some(handler);
    }

    #[inline]
    pub fn syscall(&self, idx: u32) -> Option<SyscallHandler> {
        self.syscalls.get(idx as usize).copied().flatten()
    }

    #[inline]
    pub fn unhandled_syscall(&self) -> Option<SyscallHandler> {
        self.unhandled_syscall
    }

    #[inline]
    pub fn output(&self) -> Option<OutputHandler> {
        self.on_output
    }

    /// The value an `in` from `port` reads; defaults to 0.
    #[inline]
    pub fn input(&self, port: u16) -> u32 {
        match self.on_input {
            Some(handler) => handler(port),
            None => 0,
        }
    }

    #[inline]
    pub fn breakpoint(&self) -> Option<BreakpointHandler> {
        self.on_breakpoint
    }

    #[inline]
    pub fn remote(&self) -> Option<RemoteHandler> {
        self.on_remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_syscall(_m: &mut Machine, _n: u32) -> Result<()> {
        Ok(())
    }

    #[test]
    fn empty_registry_has_no_handlers() {
        let reg = Registry::new();
        assert!(reg.syscall(0).is_none());
        assert!(reg.syscall(511).is_none());
        assert!(reg.unhandled_syscall().is_none());
        assert!(reg.output().is_none());
        assert!(reg.breakpoint().is_none());
    }

    #[test]
    fn installed_syscall_is_returned() {
        let mut reg = Registry::new();
        reg.install_syscall_handler(9, nop_syscall);
        assert!(reg.syscall(9).is_some());
        assert!(reg.syscall(10).is_none());
    }

    #[test]
    fn out_of_range_lookup_is_none() {
        let reg = Registry::new();
        assert!(reg.syscall(MAX_SYSCALLS as u32).is_none());
        assert!(reg.syscall(u32::MAX).is_none());
    }

    #[test]
    #[should_panic]
    fn out_of_range_install_panics() {
        let mut reg = Registry::new();
        reg.install_syscall_handler(MAX_SYSCALLS, nop_syscall);
    }

    #[test]
    fn default_input_reads_zero() {
        let reg = Registry::new();
        assert_eq!(reg.input(0x42), 0);
    }

    #[test]
    fn input_handler_sees_the_port() {
        let mut reg = Registry::new();
        reg.install_input_handler(|port| port as u32 + 1);
        assert_eq!(reg.input(0x10), 0x11);
    }
}
