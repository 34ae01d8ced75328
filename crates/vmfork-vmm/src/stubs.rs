//! Hand-assembled guest-side code: the interrupt stubs and the exit
//! trampoline.
//!
//! Every IDT gate points at a small stub in the page at
//! [`INTR_ASM_ADDR`](crate::layout::INTR_ASM_ADDR).  A stub reports its
//! vector to the host with an `out` to port `0x80 + vector`; the port
//! number, not the payload, carries the vector.
//!
//! - **Page fault (14)**: saves the registers it clobbers, moves CR2 into
//!   RDI (where the host fault handler expects it), traps, then restores
//!   and `iretq`s so the faulting instruction re-executes against the
//!   freshly mapped page.
//! - **Debug (1)**: traps and resumes; the host invokes the breakpoint
//!   callback in between.
//! - **Everything else**: traps and never resumes — the host raises the
//!   CPU exception, so the trailing `hlt` is unreachable.
//!
//! The exit trampoline is one user-mode page: call setup pushes its
//! address as the synthetic return address, so a guest `ret` terminates
//! the call by writing the stop value to the syscall port.

use crate::layout::{EXCEPTION_PORT_BASE, IDT_ENTRIES, STOP_VALUE, STUB_STRIDE, SYSCALL_PORT};

/// Stack layout at the moment a page-fault stub traps, relative to RSP.
///
/// The CPU pushed the error code and the interrupt frame; the stub then
/// saved RAX and RDI.
pub mod pf_frame {
    pub const SAVED_RAX: u64 = 0;
    pub const SAVED_RDI: u64 = 8;
    pub const ERROR_CODE: u64 = 16;
    pub const RIP: u64 = 24;
    pub const CS: u64 = 32;
    pub const RFLAGS: u64 = 40;
    pub const RSP: u64 = 48;
    pub const SS: u64 = 56;
}

fn out_vector(code: &mut Vec<u8>, vector: u8) {
    // mov eax, vector ; out 0x80 + vector, eax
    code.push(0xb8);
    code.extend_from_slice(&(vector as u32).to_le_bytes());
    code.push(0xe7);
    code.push(EXCEPTION_PORT_BASE as u8 + vector);
}

fn stub_for(vector: u8) -> Vec<u8> {
    let mut code = Vec::new();
    match vector {
        14 => {
            code.push(0x57); // push rdi
            code.push(0x50); // push rax
            code.extend_from_slice(&[0x0f, 0x20, 0xd7]); // mov rdi, cr2
            out_vector(&mut code, 14);
            code.push(0x58); // pop rax
            code.push(0x5f); // pop rdi
            code.extend_from_slice(&[0x48, 0x83, 0xc4, 0x08]); // add rsp, 8
            code.extend_from_slice(&[0x48, 0xcf]); // iretq
        }
        1 => {
            code.push(0x50); // push rax
            out_vector(&mut code, 1);
            code.push(0x58); // pop rax
            code.extend_from_slice(&[0x48, 0xcf]); // iretq
        }
        _ => {
            out_vector(&mut code, vector);
            code.push(0xf4); // hlt (unreachable)
        }
    }
    code
}

/// The full interrupt stub page: one stub per exception vector at a fixed
/// [`STUB_STRIDE`] so the IDT targets are computable.
pub fn interrupt_stubs() -> Vec<u8> {
    let mut page = vec![0xf4u8; IDT_ENTRIES * STUB_STRIDE as usize];
    for vector in 0..IDT_ENTRIES as u8 {
        let stub = stub_for(vector);
        let off = vector as usize * STUB_STRIDE as usize;
        page[off..off + stub.len()].copy_from_slice(&stub);
    }
    page
}

/// The user-mode exit trampoline.
pub fn exit_trampoline() -> Vec<u8> {
    let mut code = Vec::new();
    // mov eax, STOP_VALUE ; out SYSCALL_PORT, eax
    code.push(0xb8);
    code.extend_from_slice(&STOP_VALUE.to_le_bytes());
    code.push(0xe7);
    code.push(SYSCALL_PORT as u8);
    code.push(0xf4); // unreachable: the host stops the vCPU at the out
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_stub_fits_its_slot() {
        for vector in 0..IDT_ENTRIES as u8 {
            assert!(
                stub_for(vector).len() <= STUB_STRIDE as usize,
                "stub {vector} overflows its slot"
            );
        }
    }

    #[test]
    fn page_fault_stub_preserves_clobbers() {
        let stub = stub_for(14);
        assert_eq!(stub[0], 0x57, "must save rdi first");
        assert_eq!(stub[1], 0x50, "must save rax");
        assert_eq!(&stub[2..5], &[0x0f, 0x20, 0xd7], "mov rdi, cr2");
        assert_eq!(&stub[stub.len() - 2..], &[0x48, 0xcf], "ends in iretq");
    }

    #[test]
    fn page_fault_stub_reports_on_port_0x8e() {
        let stub = stub_for(14);
        let out_pos = stub.iter().position(|&b| b == 0xe7).unwrap();
        assert_eq!(stub[out_pos + 1], 0x8e);
    }

    #[test]
    fn fatal_stubs_end_in_hlt() {
        for vector in [0u8, 6, 13] {
            let stub = stub_for(vector);
            assert_eq!(*stub.last().unwrap(), 0xf4);
        }
    }

    #[test]
    fn stub_page_places_vectors_at_stride() {
        let page = interrupt_stubs();
        // Vector 13's `out` targets port 0x8d.
        let base = 13 * STUB_STRIDE as usize;
        assert_eq!(page[base], 0xb8);
        assert_eq!(page[base + 5], 0xe7);
        assert_eq!(page[base + 6], 0x8d);
    }

    #[test]
    fn exit_trampoline_writes_stop_value() {
        let code = exit_trampoline();
        assert_eq!(code[0], 0xb8);
        assert_eq!(
            u32::from_le_bytes(code[1..5].try_into().unwrap()),
            STOP_VALUE
        );
        assert_eq!(code[5], 0xe7);
        assert_eq!(code[6], SYSCALL_PORT as u8);
    }
}
