//! Descriptor-table construction: GDT entries, the 64-bit TSS and IDT
//! interrupt gates.
//!
//! The `flags` parameter of [`gdt_entry`] packs the access byte and the
//! granularity nibble the same way the raw descriptor stores them:
//!
//! ```text
//! flags[7:0]   → descriptor byte 5  (access: P, DPL, S, Type)
//! flags[15:12] → descriptor byte 6  high nibble (G, D/B, L, AVL)
//! ```

use kvm_bindings::kvm_segment;

/// Construct a raw 8-byte GDT descriptor from flags, base and limit.
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | ((limit as u64 & 0x000f_0000) << 32)
        | ((flags as u64 & 0x00ff) << 40)
        | ((flags as u64 & 0xf000) << 40)
}

/// The 16-byte system descriptor for a 64-bit TSS at `base` with `limit`.
///
/// Returned as two consecutive GDT slots (low, high).
pub fn tss_descriptor(flags: u16, base: u64, limit: u32) -> (u64, u64) {
    let low = gdt_entry(flags, (base & 0xffff_ffff) as u32, limit);
    let high = base >> 32;
    (low, high)
}

/// A 16-byte IDT interrupt gate targeting `handler` through `selector`.
///
/// `dpl` is the gate's descriptor privilege level; CPU-generated
/// exceptions ignore it, so 0 is right for every fault vector.
pub fn idt_gate(handler: u64, selector: u16, dpl: u8) -> [u8; 16] {
    let mut gate = [0u8; 16];
    gate[0..2].copy_from_slice(&(handler as u16).to_le_bytes());
    gate[2..4].copy_from_slice(&selector.to_le_bytes());
    gate[4] = 0; // IST
    gate[5] = 0x8e | ((dpl & 3) << 5); // present, interrupt gate
    gate[6..8].copy_from_slice(&(((handler >> 16) as u16)).to_le_bytes());
    gate[8..12].copy_from_slice(&(((handler >> 32) as u32)).to_le_bytes());
    gate
}

// ─── Field extraction ────────────────────────────────────────────────
//
// Bit layout of an 8-byte segment descriptor:
//
//   Bits 63:56 — Base address [31:24]
//   Bit  55    — Granularity (G)
//   Bit  54    — Default operation size (D/B)
//   Bit  53    — 64-bit code segment (L)
//   Bits 51:48 — Segment limit [19:16]
//   Bit  47    — Present (P)
//   Bits 46:45 — Descriptor Privilege Level (DPL)
//   Bit  44    — Descriptor type: 0=system, 1=code/data (S)
//   Bits 43:40 — Type
//   Bits 39:16 — Base address [23:0]
//   Bits 15:0  — Segment limit [15:0]

fn get_base(entry: u64) -> u64 {
    ((entry >> 32) & 0xff00_0000) | ((entry >> 16) & 0x00ff_ffff)
}

fn get_limit(entry: u64) -> u32 {
    let limit = (((entry >> 32) & 0x000f_0000) | (entry & 0xffff)) as u32;
    if get_g(entry) == 1 {
        (limit << 12) | 0xfff
    } else {
        limit
    }
}

fn get_g(entry: u64) -> u8 {
    ((entry >> 55) & 1) as u8
}

fn get_db(entry: u64) -> u8 {
    ((entry >> 54) & 1) as u8
}

fn get_l(entry: u64) -> u8 {
    ((entry >> 53) & 1) as u8
}

fn get_avl(entry: u64) -> u8 {
    ((entry >> 52) & 1) as u8
}

fn get_p(entry: u64) -> u8 {
    ((entry >> 47) & 1) as u8
}

fn get_dpl(entry: u64) -> u8 {
    ((entry >> 45) & 3) as u8
}

fn get_s(entry: u64) -> u8 {
    ((entry >> 44) & 1) as u8
}

fn get_type(entry: u64) -> u8 {
    ((entry >> 40) & 0xf) as u8
}

/// Convert a raw GDT descriptor into a KVM segment register.
///
/// `selector` is the full selector value including the RPL bits, so user
/// segments carry RPL 3.
pub fn kvm_segment_from_gdt(entry: u64, selector: u16) -> kvm_segment {
    kvm_segment {
        base: get_base(entry),
        limit: get_limit(entry),
        selector,
        type_: get_type(entry),
        present: get_p(entry),
        dpl: get_dpl(entry),
        db: get_db(entry),
        s: get_s(entry),
        l: get_l(entry),
        g: get_g(entry),
        avl: get_avl(entry),
        padding: 0,
        unusable: u8::from(get_p(entry) == 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::*;

    #[test]
    fn null_entry_is_zero() {
        assert_eq!(gdt_entry(0, 0, 0), 0);
    }

    #[test]
    fn kernel_code_is_long_mode_ring0() {
        let entry = gdt_entry(GDT_FLAGS_KERNEL_CODE, 0, 0xfffff);
        assert_eq!(get_l(entry), 1);
        assert_eq!(get_db(entry), 0, "D/B must be 0 when L=1");
        assert_eq!(get_dpl(entry), 0);
        assert_eq!(get_p(entry), 1);
    }

    #[test]
    fn user_segments_are_ring3() {
        for flags in [GDT_FLAGS_USER_CODE, GDT_FLAGS_USER_DATA] {
            let entry = gdt_entry(flags, 0, 0xfffff);
            assert_eq!(get_dpl(entry), 3);
            assert_eq!(get_p(entry), 1);
            assert_eq!(get_s(entry), 1);
        }
    }

    #[test]
    fn tss_is_a_system_segment() {
        let (low, high) = tss_descriptor(GDT_FLAGS_TSS, TSS_ADDR, 103);
        assert_eq!(get_s(low), 0);
        assert_eq!(get_base(low), TSS_ADDR);
        assert_eq!(high, 0, "TSS below 4 GiB has an all-zero high half");
    }

    #[test]
    fn base_address_round_trips() {
        let entry = gdt_entry(GDT_FLAGS_KERNEL_DATA, 0x1234_5678, 0xfffff);
        assert_eq!(get_base(entry), 0x1234_5678);
    }

    #[test]
    fn granular_limit_expands() {
        let entry = gdt_entry(GDT_FLAGS_KERNEL_CODE, 0, 0xfffff);
        assert_eq!(get_limit(entry), 0xffff_ffff);
    }

    #[test]
    fn segment_conversion_user_code() {
        let seg = kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_USER_CODE, 0, 0xfffff), USER_CS);
        assert_eq!(seg.selector, USER_CS);
        assert_eq!(seg.l, 1);
        assert_eq!(seg.dpl, 3);
        assert_eq!(seg.unusable, 0);
    }

    #[test]
    fn absent_segment_is_unusable() {
        let seg = kvm_segment_from_gdt(0, 0);
        assert_eq!(seg.present, 0);
        assert_eq!(seg.unusable, 1);
    }

    #[test]
    fn idt_gate_encodes_target() {
        let gate = idt_gate(0x2040, KERNEL_CS, 0);
        assert_eq!(u16::from_le_bytes(gate[0..2].try_into().unwrap()), 0x2040);
        assert_eq!(u16::from_le_bytes(gate[2..4].try_into().unwrap()), KERNEL_CS);
        assert_eq!(gate[5], 0x8e);
        assert_eq!(u32::from_le_bytes(gate[8..12].try_into().unwrap()), 0);
    }
}
