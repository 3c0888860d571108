//! Instruction prefixes and operand/address-size resolution, per spec.md
//! §4.4. The opcode tables themselves (two 256-entry primary tables for
//! 16-bit/32-bit default operand size, plus their `0F`-escape counterparts)
//! are built as function-pointer arrays over `Cpu::execute_*` methods in
//! `cpu.rs`, since each handler needs full access to CPU state; this module
//! holds the prefix-accumulation bitfield and size-resolution logic that
//! feeds the decoder ahead of that dispatch, matching spec.md §4.4's
//! "prefix bitfield accumulated before the opcode byte is read" framing.

use crate::registers::{OpSize, SegReg};
use crate::strings::RepKind;

bitflags::bitflags! {
    /// Which prefix bytes preceded the opcode, accumulated one byte at a
    /// time as the decoder walks the instruction stream.
    pub struct PrefixFlags: u16 {
        const LOCK           = 1 << 0;
        const REPNE          = 1 << 1;
        const REP            = 1 << 2;
        const OPSIZE_OVERRIDE  = 1 << 3;
        const ADDRSIZE_OVERRIDE = 1 << 4;
        const SEG_OVERRIDE    = 1 << 5;
        const ESCAPE_0F       = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Prefixes {
    pub flags: PrefixFlags,
    pub segment_override: Option<SegReg>,
    /// Total bytes consumed by the prefix run, so the dispatcher knows
    /// where the opcode byte itself begins.
    pub length: u8,
}

impl Prefixes {
    pub const fn none() -> Self {
        Self { flags: PrefixFlags::empty(), segment_override: None, length: 0 }
    }

    pub fn rep_kind(&self) -> RepKind {
        if self.flags.contains(PrefixFlags::REP) {
            RepKind::Rep
        } else if self.flags.contains(PrefixFlags::REPNE) {
            RepKind::RepNe
        } else {
            RepKind::None
        }
    }
}

/// Classifies a single byte as a legacy prefix, returning the `PrefixFlags`
/// bit(s) it sets and, for segment overrides, which register. Returns
/// `None` for a byte that is not a recognized prefix (the decoder should
/// treat it as the opcode byte itself).
pub fn classify_prefix_byte(byte: u8) -> Option<(PrefixFlags, Option<SegReg>)> {
    match byte {
        0xF0 => Some((PrefixFlags::LOCK, None)),
        0xF2 => Some((PrefixFlags::REPNE, None)),
        0xF3 => Some((PrefixFlags::REP, None)),
        0x66 => Some((PrefixFlags::OPSIZE_OVERRIDE, None)),
        0x67 => Some((PrefixFlags::ADDRSIZE_OVERRIDE, None)),
        0x2E => Some((PrefixFlags::SEG_OVERRIDE, Some(SegReg::Cs))),
        0x36 => Some((PrefixFlags::SEG_OVERRIDE, Some(SegReg::Ss))),
        0x3E => Some((PrefixFlags::SEG_OVERRIDE, Some(SegReg::Ds))),
        0x26 => Some((PrefixFlags::SEG_OVERRIDE, Some(SegReg::Es))),
        0x64 => Some((PrefixFlags::SEG_OVERRIDE, Some(SegReg::Fs))),
        0x65 => Some((PrefixFlags::SEG_OVERRIDE, Some(SegReg::Gs))),
        _ => None,
    }
}

/// Accumulates a run of prefix bytes from a byte source, stopping at the
/// first byte that isn't a recognized prefix (which the caller then
/// re-reads as the opcode). `fetch` is expected to be idempotent-per-call
/// (each call advances one byte); `peek_back` isn't modeled here — callers
/// pass in a closure over their own cursor so they can rewind by one byte
/// once a non-prefix is seen.
pub fn accumulate_prefixes(mut fetch: impl FnMut() -> u8) -> (Prefixes, u8) {
    let mut prefixes = Prefixes::none();
    loop {
        let byte = fetch();
        match classify_prefix_byte(byte) {
            Some((flag, seg)) => {
                prefixes.flags |= flag;
                if let Some(seg) = seg {
                    prefixes.segment_override = Some(seg);
                }
                prefixes.length += 1;
            }
            None => return (prefixes, byte),
        }
    }
}

/// Resolves the effective operand size for the current instruction, given
/// the segment's default (`big`, i.e. CS.D/B) and whether a `0x66` prefix
/// was seen, per spec.md §4.4.
pub fn operand_size(cs_big: bool, prefixes: &Prefixes) -> OpSize {
    let toggled = prefixes.flags.contains(PrefixFlags::OPSIZE_OVERRIDE);
    match (cs_big, toggled) {
        (true, false) | (false, true) => OpSize::Size32,
        (true, true) | (false, false) => OpSize::Size16,
    }
}

/// Resolves the effective address size (32-bit vs 16-bit addressing forms
/// for ModR/M+SIB decoding), per spec.md §4.4.
pub fn address_size_is_32(cs_big: bool, prefixes: &Prefixes) -> bool {
    let toggled = prefixes.flags.contains(PrefixFlags::ADDRSIZE_OVERRIDE);
    cs_big != toggled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_rep_and_segment_override_then_stops_at_opcode() {
        let bytes = [0xF3u8, 0x2E, 0xA4]; // rep cs: movsb
        let mut idx = 0usize;
        let (prefixes, opcode) = accumulate_prefixes(|| {
            let b = bytes[idx];
            idx += 1;
            b
        });
        assert_eq!(opcode, 0xA4);
        assert_eq!(prefixes.length, 2);
        assert!(prefixes.flags.contains(PrefixFlags::REP));
        assert_eq!(prefixes.segment_override, Some(SegReg::Cs));
    }

    #[test]
    fn opsize_override_flips_default_32bit_segment_to_16bit() {
        let mut p = Prefixes::none();
        p.flags |= PrefixFlags::OPSIZE_OVERRIDE;
        assert_eq!(operand_size(true, &p), OpSize::Size16);
        assert_eq!(operand_size(false, &p), OpSize::Size32);
    }

    #[test]
    fn no_prefix_32bit_segment_stays_32bit() {
        let p = Prefixes::none();
        assert_eq!(operand_size(true, &p), OpSize::Size32);
        assert!(address_size_is_32(true, &p));
    }
}
