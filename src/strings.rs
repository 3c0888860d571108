//! String instructions — MOVS/CMPS/STOS/LODS/SCAS/INS/OUTS, with REP/REPE/
//! REPNE prefix handling and a batched fast path, per spec.md §4.7.
//!
//! No teacher analog (silicon executes `rep movsb` as a single instruction);
//! grounded on spec.md §4.7's algorithm and the batching cap
//! (`MAX_COUNT_PER_CYCLE`) it specifies to keep a single `cycle()` call
//! bounded, mirroring how the teacher's own `kernel` event loop avoids
//! unbounded work inside one dispatch (`kernel/src/kernel.rs`'s bounded
//! per-iteration work, read during teacher study).

use crate::registers::{Eflags, Gpr, RegisterFile};

/// Upper bound on iterations a single `rep`-prefixed string op performs
/// before yielding back to the cycle loop, per spec.md §4.7. Keeps one
/// `cycle()` call from blocking for an arbitrarily long copy.
pub const MAX_COUNT_PER_CYCLE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepKind {
    None,
    Rep,
    RepE,
    RepNe,
}

/// One batch of a string operation: how many iterations to run this call,
/// and whether the caller should loop `cycle()` again afterward because
/// the full REP count was not exhausted.
#[derive(Debug, Clone, Copy)]
pub struct StringBatch {
    pub iterations: u32,
    pub remaining_after: u32,
}

/// Computes how many iterations to run in this call given the full
/// requested count (from ECX or CX depending on address size), per
/// spec.md §4.7's batching rule.
pub fn plan_batch(requested: u32) -> StringBatch {
    let iterations = requested.min(MAX_COUNT_PER_CYCLE);
    StringBatch { iterations, remaining_after: requested - iterations }
}

fn step(df: bool, size: u32) -> i32 {
    if df {
        -(size as i32)
    } else {
        size as i32
    }
}

/// A single read/write byte-addressable memory surface the string ops
/// operate against (linear addresses already segment-relative — the
/// dispatcher resolves DS:ESI/ES:EDI through the segment cache before
/// calling into here, per spec.md §4.3's segment-override handling).
pub trait StringMemory {
    fn read8(&mut self, linear: u32) -> u8;
    fn write8(&mut self, linear: u32, val: u8);
    fn read16(&mut self, linear: u32) -> u16;
    fn write16(&mut self, linear: u32, val: u16);
    fn read32(&mut self, linear: u32) -> u32;
    fn write32(&mut self, linear: u32, val: u32);
}

/// MOVSB/MOVSW/MOVSD for one iteration. `src`/`dst` are linear addresses;
/// returns the post-increment linear addresses.
pub fn movs(mem: &mut impl StringMemory, src: u32, dst: u32, size: u32, df: bool) -> (u32, u32) {
    match size {
        1 => {
            let v = mem.read8(src);
            mem.write8(dst, v);
        }
        2 => {
            let v = mem.read16(src);
            mem.write16(dst, v);
        }
        _ => {
            let v = mem.read32(src);
            mem.write32(dst, v);
        }
    }
    let s = step(df, size);
    (src.wrapping_add(s as u32), dst.wrapping_add(s as u32))
}

/// CMPS: returns `(new_src, new_dst, result_for_flags)`. The caller passes
/// `result_for_flags` into `alu::sub` to derive ZF/CF/etc.
pub fn cmps(mem: &mut impl StringMemory, src: u32, dst: u32, size: u32, df: bool) -> (u32, u32, u32, u32) {
    let (a, b) = match size {
        1 => (mem.read8(src) as u32, mem.read8(dst) as u32),
        2 => (mem.read16(src) as u32, mem.read16(dst) as u32),
        _ => (mem.read32(src), mem.read32(dst)),
    };
    let s = step(df, size);
    (src.wrapping_add(s as u32), dst.wrapping_add(s as u32), a, b)
}

pub fn stos(mem: &mut impl StringMemory, dst: u32, value: u32, size: u32, df: bool) -> u32 {
    match size {
        1 => mem.write8(dst, value as u8),
        2 => mem.write16(dst, value as u16),
        _ => mem.write32(dst, value),
    }
    dst.wrapping_add(step(df, size) as u32)
}

pub fn lods(mem: &mut impl StringMemory, src: u32, size: u32, df: bool) -> (u32, u32) {
    let value = match size {
        1 => mem.read8(src) as u32,
        2 => mem.read16(src) as u32,
        _ => mem.read32(src),
    };
    (src.wrapping_add(step(df, size) as u32), value)
}

pub fn scas(mem: &mut impl StringMemory, dst: u32, al_ax_eax: u32, size: u32, df: bool) -> (u32, u32, u32) {
    let mem_val = match size {
        1 => mem.read8(dst) as u32,
        2 => mem.read16(dst) as u32,
        _ => mem.read32(dst),
    };
    (dst.wrapping_add(step(df, size) as u32), al_ax_eax, mem_val)
}

/// INS/OUTS read/write through a port rather than memory on one side; the
/// port I/O itself is supplied by the caller (`ports.rs`) since this module
/// has no bus access.
pub fn ins_step(mem: &mut impl StringMemory, dst: u32, port_value: u32, size: u32, df: bool) -> u32 {
    match size {
        1 => mem.write8(dst, port_value as u8),
        2 => mem.write16(dst, port_value as u16),
        _ => mem.write32(dst, port_value),
    }
    dst.wrapping_add(step(df, size) as u32)
}

pub fn outs_step(mem: &mut impl StringMemory, src: u32, size: u32, df: bool) -> (u32, u32) {
    let value = match size {
        1 => mem.read8(src) as u32,
        2 => mem.read16(src) as u32,
        _ => mem.read32(src),
    };
    (src.wrapping_add(step(df, size) as u32), value)
}

/// Whether a REPE/REPNE-prefixed CMPS/SCAS loop should continue after this
/// iteration's ZF result, per spec.md §4.7.
pub fn rep_should_continue(kind: RepKind, zf: bool) -> bool {
    match kind {
        RepKind::None => false,
        RepKind::Rep => true,
        RepKind::RepE => zf,
        RepKind::RepNe => !zf,
    }
}

/// Decrements ECX/CX according to address size and returns whether it
/// reached zero (REP's loop-termination condition, independent of ZF).
pub fn dec_count(regs: &mut RegisterFile, addr_size_32: bool) -> bool {
    if addr_size_32 {
        let c = regs.read32(Gpr::Ecx).wrapping_sub(1);
        regs.write32(Gpr::Ecx, c);
        c == 0
    } else {
        let c = regs.read16(Gpr::Ecx).wrapping_sub(1);
        regs.write16(Gpr::Ecx, c);
        c == 0
    }
}

pub fn direction_flag(eflags: Eflags) -> bool {
    eflags.contains(Eflags::DF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeMem(HashMap<u32, u8>);
    impl StringMemory for FakeMem {
        fn read8(&mut self, linear: u32) -> u8 {
            *self.0.get(&linear).unwrap_or(&0)
        }
        fn write8(&mut self, linear: u32, val: u8) {
            self.0.insert(linear, val);
        }
        fn read16(&mut self, linear: u32) -> u16 {
            self.read8(linear) as u16 | (self.read8(linear + 1) as u16) << 8
        }
        fn write16(&mut self, linear: u32, val: u16) {
            self.write8(linear, val as u8);
            self.write8(linear + 1, (val >> 8) as u8);
        }
        fn read32(&mut self, linear: u32) -> u32 {
            self.read16(linear) as u32 | (self.read16(linear + 2) as u32) << 16
        }
        fn write32(&mut self, linear: u32, val: u32) {
            self.write16(linear, val as u16);
            self.write16(linear + 2, (val >> 16) as u16);
        }
    }

    #[test]
    fn movsb_with_df_clear_advances_forward() {
        let mut mem = FakeMem(HashMap::new());
        mem.write8(0x100, 0xAB);
        let (src, dst) = movs(&mut mem, 0x100, 0x200, 1, false);
        assert_eq!(src, 0x101);
        assert_eq!(dst, 0x201);
        assert_eq!(mem.read8(0x200), 0xAB);
    }

    #[test]
    fn movsb_with_df_set_advances_backward() {
        let mut mem = FakeMem(HashMap::new());
        let (src, dst) = movs(&mut mem, 0x100, 0x200, 1, true);
        assert_eq!(src, 0xFF);
        assert_eq!(dst, 0x1FF);
    }

    #[test]
    fn plan_batch_caps_at_max_count_per_cycle() {
        let batch = plan_batch(MAX_COUNT_PER_CYCLE * 3);
        assert_eq!(batch.iterations, MAX_COUNT_PER_CYCLE);
        assert_eq!(batch.remaining_after, MAX_COUNT_PER_CYCLE * 2);
    }

    #[test]
    fn repe_stops_when_zf_false() {
        assert!(!rep_should_continue(RepKind::RepE, false));
        assert!(rep_should_continue(RepKind::RepE, true));
        assert!(rep_should_continue(RepKind::RepNe, false));
    }
}
