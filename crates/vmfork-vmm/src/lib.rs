//! vmfork — forkable KVM micro-VMs called like functions.
//!
//! A [`Machine`] loads a statically linked x86_64 executable into an
//! isolated guest address space, builds the minimal long-mode
//! environment it needs, and exposes a request/response harness: the
//! guest is invoked like a function ([`Machine::vmcall`]), runs until it
//! voluntarily stops or a timeout fires, and its side effects (I/O
//! ports, system calls, memory writes) surface through host callbacks.
//!
//! The interesting machinery is the copy-on-write fabric: after
//! [`Machine::prepare_copy_on_write`], a machine becomes a template that
//! [`Machine::fork`] clones cheaply.  Forks share every page read-only
//! and duplicate only what they write into a private [`bank`]; between
//! requests, [`Machine::reset_to`] rewinds the duplicates in
//! microseconds instead of rebuilding the VM.
//!
//! # Architecture
//!
//! - [`machine`] — public host API: calls, forks, resets, the exit loop
//! - [`vcpu`] — one hardware vCPU; exit classification and timeouts
//! - [`memory`] — guest memory slots, translation, copy-on-write
//! - [`bank`] — the page pool backing copy-on-write duplicates
//! - [`pagetables`] — 4-level paging built inside guest memory
//! - [`loader`] — static ELF64 validation and loading
//! - [`registry`] — host syscall / I/O-port callback tables
//! - [`timer`] — per-vCPU POSIX interval timers for deadlines
//! - [`layout`] — the fixed guest-physical kernel layout
//!
//! # Example
//!
//! ```no_run
//! use vmfork_vmm::{Machine, MachineOptions, VmArg};
//!
//! let binary = std::fs::read("guest.elf").unwrap();
//! let options = MachineOptions::default();
//! let mut vm = Machine::new(&binary, &options).unwrap();
//! vm.prepare_copy_on_write().unwrap();
//!
//! let mut fork = Machine::fork(&vm, &options).unwrap();
//! let answer = fork
//!     .timed_vmcall(vm.entry_address(), 50, &[VmArg::U64(21)])
//!     .unwrap();
//! fork.reset_to(&vm, &options).unwrap();
//! println!("guest returned {answer}");
//! ```

pub mod bank;
pub mod error;
pub mod gdt;
pub mod layout;
pub mod loader;
pub mod machine;
pub mod memory;
pub mod pagetables;
pub mod registry;
pub mod stubs;
pub mod testelf;
pub mod timer;
pub mod vcpu;

pub use error::{MachineError, Result};
pub use machine::{Machine, MachineOptions, Printer, VmArg, BRK_MAX};
pub use registry::Registry;
pub use vcpu::VcpuEvent;
