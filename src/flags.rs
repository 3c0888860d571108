//! Lazy arithmetic-flag recovery, per spec.md §4.6.
//!
//! `Cpu::eflags` holds the authoritative bit for any flag whose
//! `FlagShadow::flags_changed` bit is clear; when set, the flag is instead
//! recomputed from `last_op1`/`last_op2`/`last_add_result`/`last_result`/
//! `last_op_size` on demand. Writing EFLAGS directly (`POPF`, `IRET`, ...)
//! clears `flags_changed` so the written bits become authoritative again.

use crate::registers::{Eflags, FlagShadow, LastOpKind, OpSize};

#[inline]
fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

/// Computes CF from the shadow, per spec.md §4.6:
/// `last_op1 ^ ((last_op1 ^ last_op2) & (last_op2 ^ last_add_result))`,
/// bit `last_op_size`. Shift/rotate ops short-circuit to an explicitly
/// stored bit since their CF does not follow the additive formula.
pub fn compute_cf(shadow: &FlagShadow, explicit: bool) -> bool {
    if explicit {
        return shadow.last_result & 1 != 0;
    }
    let bit = shadow.last_op_size as u32;
    let v = shadow.last_op1 ^ ((shadow.last_op1 ^ shadow.last_op2) & (shadow.last_op2 ^ shadow.last_add_result));
    (v >> bit) & 1 != 0
}

/// Computes OF from the shadow, per spec.md §4.6:
/// `((last_op1 ^ last_add_result) & (last_op2 ^ last_add_result)) >> last_op_size & 1`.
pub fn compute_of(shadow: &FlagShadow, explicit: bool) -> bool {
    if explicit {
        return shadow.last_result & 1 != 0;
    }
    let bit = shadow.last_op_size as u32;
    let v = (shadow.last_op1 ^ shadow.last_add_result) & (shadow.last_op2 ^ shadow.last_add_result);
    (v >> bit) & 1 != 0
}

fn size_for(bit: u8) -> OpSize {
    match bit {
        7 => OpSize::Size8,
        15 => OpSize::Size16,
        _ => OpSize::Size32,
    }
}

/// Computes ZF/SF/PF from `last_result`, masked to the operation width.
pub fn compute_zf(shadow: &FlagShadow) -> bool {
    let mask = size_for(shadow.last_op_size).value_mask();
    shadow.last_result & mask == 0
}

pub fn compute_sf(shadow: &FlagShadow) -> bool {
    let size = size_for(shadow.last_op_size);
    shadow.last_result & size.sign_bit() != 0
}

pub fn compute_pf(shadow: &FlagShadow) -> bool {
    parity(shadow.last_result as u8)
}

/// Computes AF. Approximated from the low nibbles of the two operands and
/// the additive result, matching the x86 "carry out of bit 3" definition;
/// for logical/shift operations AF is undefined architecturally and the
/// stored EFLAGS bit (left untouched by those ops) is used instead.
pub fn compute_af(shadow: &FlagShadow) -> bool {
    match shadow.kind.kind() {
        LastOpKind::Logical | LastOpKind::Shl | LastOpKind::Shr | LastOpKind::Sar => false,
        _ => ((shadow.last_op1 ^ shadow.last_op2 ^ shadow.last_add_result) & 0x10) != 0,
    }
}

/// Recovers the six arithmetic flags into `eflags`, consulting the shadow
/// only for bits still marked stale in `flags_changed`; clears
/// `flags_changed` once resolved, exactly mirroring `spec.md`'s semantics
/// that a direct EFLAGS write makes every bit authoritative again.
pub fn sync_arith_flags(eflags: &mut Eflags, shadow: &FlagShadow) {
    if shadow.flags_changed == 0 {
        return;
    }
    let explicit_bitwise = matches!(
        shadow.kind.kind(),
        LastOpKind::Shl | LastOpKind::Shr | LastOpKind::Sar | LastOpKind::Rcl | LastOpKind::Rcr
    );

    if shadow.flags_changed & Eflags::CF.bits != 0 {
        eflags.set(Eflags::CF, compute_cf(shadow, explicit_bitwise));
    }
    if shadow.flags_changed & Eflags::OF.bits != 0 {
        eflags.set(Eflags::OF, compute_of(shadow, explicit_bitwise));
    }
    if shadow.flags_changed & Eflags::ZF.bits != 0 {
        eflags.set(Eflags::ZF, compute_zf(shadow));
    }
    if shadow.flags_changed & Eflags::SF.bits != 0 {
        eflags.set(Eflags::SF, compute_sf(shadow));
    }
    if shadow.flags_changed & Eflags::PF.bits != 0 {
        eflags.set(Eflags::PF, compute_pf(shadow));
    }
    if shadow.flags_changed & Eflags::AF.bits != 0 {
        eflags.set(Eflags::AF, compute_af(shadow));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::LastOpKindStorage;

    fn add_shadow(op1: u32, op2: u32, size: OpSize) -> FlagShadow {
        let result = op1.wrapping_add(op2);
        FlagShadow {
            last_op1: op1,
            last_op2: op2,
            last_add_result: result,
            last_result: result,
            last_op_size: size.mask_bit() as u8,
            kind: LastOpKindStorage::ADD,
            flags_changed: Eflags::ARITH_MASK.bits,
        }
    }

    #[test]
    fn add_overflow_sets_of_sf_not_zf_not_cf() {
        // 0x7FFFFFFF + 1 = 0x80000000: OF=1, SF=1, ZF=0, CF=0 (scenario 3, spec.md §8)
        let shadow = add_shadow(0x7FFF_FFFF, 1, OpSize::Size32);
        assert!(compute_of(&shadow, false));
        assert!(compute_sf(&shadow));
        assert!(!compute_zf(&shadow));
        assert!(!compute_cf(&shadow, false));
    }

    #[test]
    fn add_carry_out_of_top_bit() {
        let shadow = add_shadow(0xFFFF_FFFF, 1, OpSize::Size32);
        assert!(compute_cf(&shadow, false));
        assert!(compute_zf(&shadow));
        assert!(!compute_of(&shadow, false));
    }

    #[test]
    fn parity_even_ones_set() {
        let shadow = add_shadow(0b0000_0011, 0, OpSize::Size8);
        assert!(compute_pf(&shadow));
        let shadow = add_shadow(0b0000_0111, 0, OpSize::Size8);
        assert!(!compute_pf(&shadow));
    }
}
