//! Segment selectors, descriptor-table lookups, segment-register loading,
//! and control transfers (far JMP/CALL/RET, IRET, task switches), per
//! spec.md §3/§4.3.
//!
//! `SegSel`'s bit-layout and accessor style is carried over from the
//! teacher's AMD64 `segmentation::SegSel` almost unchanged (selectors are
//! identical between long mode and protected mode); everything past that —
//! the 8-byte descriptor format, descriptor-cache fields, and the far
//! control-transfer state machine — is IA-32 specific and has no teacher
//! analog, so it is grounded directly on spec.md §4.3's numbered steps.

use crate::error::{CpuException, SelErrCode};
use crate::memory::Memory;
use crate::registers::PrivLvl;

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SegSel(pub u16);

impl SegSel {
    pub const RPL_MASK: u16 = 0b11;
    pub const TABLE_SELECTOR_BIT: u16 = 0b100;
    pub const INDEX_MASK: u16 = 0b11111111_11111000;

    pub const fn new_gdt(rpl: PrivLvl, index: u16) -> Self {
        SegSel((rpl as u16) & Self::RPL_MASK | index << 3)
    }
    pub const fn new_ldt(rpl: PrivLvl, index: u16) -> Self {
        SegSel((rpl as u16) & Self::RPL_MASK | index << 3 | Self::TABLE_SELECTOR_BIT)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }
    pub const fn to_bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn rpl(&self) -> PrivLvl {
        PrivLvl::from_bits((self.0 & Self::RPL_MASK) as u8)
    }
    #[inline]
    pub const fn index(&self) -> u16 {
        self.0 >> 3
    }
    #[inline]
    pub const fn is_ldt(&self) -> bool {
        self.0 & Self::TABLE_SELECTOR_BIT != 0
    }
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 & Self::INDEX_MASK == 0
    }
}

impl core::fmt::Debug for SegSel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SegSel")
            .field("rpl", &self.rpl())
            .field("ldt", &self.is_ldt())
            .field("index", &self.index())
            .finish()
    }
}

bitflags::bitflags! {
    /// Descriptor access byte (byte 5 of an 8-byte GDT/LDT descriptor).
    pub struct Access: u8 {
        const ACCESSED   = 1 << 0;
        /// Data: writable. Code: readable.
        const RW         = 1 << 1;
        /// Data: expand-down. Code: conforming.
        const DC         = 1 << 2;
        /// Set => code segment, clear => data segment (only meaningful
        /// when `S` is set).
        const EXECUTABLE = 1 << 3;
        /// Set => code/data segment, clear => system segment.
        const S          = 1 << 4;
        const DPL_MASK   = 0b11 << 5;
        const PRESENT    = 1 << 7;
    }

    /// Descriptor flags nibble (top nibble of byte 6).
    pub struct Flags: u8 {
        const AVAILABLE  = 1 << 4;
        /// D/B: 1 = 32-bit default operand/address size, 0 = 16-bit.
        const BIG        = 1 << 6;
        /// G: 1 = limit scaled by 4 KiB, 0 = byte-granular.
        const GRANULAR   = 1 << 7;
    }
}

/// System-segment / gate `type` field values (Access low nibble when `S`
/// is clear), per spec.md §4.3/§4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysType {
    Tss16Avail = 1,
    Ldt = 2,
    Tss16Busy = 3,
    CallGate16 = 4,
    TaskGate = 5,
    InterruptGate16 = 6,
    TrapGate16 = 7,
    Tss32Avail = 9,
    Tss32Busy = 11,
    CallGate32 = 12,
    InterruptGate32 = 14,
    TrapGate32 = 15,
    Unknown = 0,
}

impl SysType {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => SysType::Tss16Avail,
            2 => SysType::Ldt,
            3 => SysType::Tss16Busy,
            4 => SysType::CallGate16,
            5 => SysType::TaskGate,
            6 => SysType::InterruptGate16,
            7 => SysType::TrapGate16,
            9 => SysType::Tss32Avail,
            11 => SysType::Tss32Busy,
            12 => SysType::CallGate32,
            14 => SysType::InterruptGate32,
            15 => SysType::TrapGate32,
            _ => SysType::Unknown,
        }
    }
}

/// A raw 8-byte descriptor, decoded into its component fields (spec.md
/// §4.3's descriptor record: base, access byte, flags nibble, limit).
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub base: u32,
    pub limit: u32,
    pub access: Access,
    pub flags: Flags,
    pub raw_type: u8,
}

impl Descriptor {
    pub fn decode(lo: u32, hi: u32) -> Self {
        let limit_low = lo & 0xFFFF;
        let base_low = lo >> 16;
        let base_mid = hi & 0xFF;
        let access = Access::from_bits_truncate(((hi >> 8) & 0xFF) as u8);
        let limit_high = (hi >> 16) & 0xF;
        let flags = Flags::from_bits_truncate(((hi >> 20) & 0xF) as u8);
        let base_high = (hi >> 24) & 0xFF;

        let base = base_low | (base_mid << 16) | (base_high << 24);
        let mut limit = limit_low | (limit_high << 16);
        if flags.contains(Flags::GRANULAR) {
            limit = (limit << 12) | 0xFFF;
        }

        Descriptor {
            base,
            limit,
            access,
            flags,
            raw_type: (access.bits & 0xF),
        }
    }

    pub fn encode(&self) -> (u32, u32) {
        let mut raw_limit = self.limit;
        if self.flags.contains(Flags::GRANULAR) {
            raw_limit >>= 12;
        }
        let lo = (raw_limit & 0xFFFF) | (self.base << 16);
        let hi = ((self.base >> 16) & 0xFF)
            | ((self.access.bits as u32) << 8)
            | (((raw_limit >> 16) & 0xF) << 16)
            | ((self.flags.bits as u32) << 20)
            | (((self.base >> 24) & 0xFF) << 24);
        (lo, hi)
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access.contains(Access::PRESENT)
    }
    #[inline]
    pub fn dpl(&self) -> PrivLvl {
        PrivLvl::from_bits((self.access.bits & Access::DPL_MASK.bits) >> 5)
    }
    #[inline]
    pub fn is_system(&self) -> bool {
        !self.access.contains(Access::S)
    }
    #[inline]
    pub fn is_code(&self) -> bool {
        self.access.contains(Access::S) && self.access.contains(Access::EXECUTABLE)
    }
    #[inline]
    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access.contains(Access::DC)
    }
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.is_code() && self.access.contains(Access::RW)
    }
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.access.contains(Access::S) && !self.access.contains(Access::EXECUTABLE) && self.access.contains(Access::RW)
    }
    #[inline]
    pub fn is_expand_down(&self) -> bool {
        self.access.contains(Access::S) && !self.access.contains(Access::EXECUTABLE) && self.access.contains(Access::DC)
    }
    #[inline]
    pub fn big(&self) -> bool {
        self.flags.contains(Flags::BIG)
    }
    #[inline]
    pub fn sys_type(&self) -> SysType {
        SysType::from_bits(self.raw_type)
    }
}

/// The cached segment-register state used on every memory access — base
/// and limit are pre-computed so address checks never re-walk the
/// descriptor table (spec.md §3 "segment cache").
#[derive(Debug, Clone, Copy)]
pub struct SegCache {
    pub selector: SegSel,
    pub base: u32,
    pub limit: u32,
    pub access: Access,
    pub flags: Flags,
    pub valid: bool,
}

impl SegCache {
    pub const fn null() -> Self {
        Self {
            selector: SegSel(0),
            base: 0,
            limit: 0,
            access: Access::empty(),
            flags: Flags::empty(),
            valid: false,
        }
    }

    /// Real-mode / VM86 segment load: base = selector << 4, 64 KiB limit,
    /// no descriptor lookup (spec.md §4.3).
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector: SegSel(selector),
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            access: Access::PRESENT | Access::S | Access::RW,
            flags: Flags::empty(),
            valid: true,
        }
    }

    pub fn from_descriptor(selector: SegSel, desc: &Descriptor) -> Self {
        Self {
            selector,
            base: desc.base,
            limit: desc.limit,
            access: desc.access,
            flags: desc.flags,
            valid: true,
        }
    }

    pub fn big(&self) -> bool {
        self.flags.contains(Flags::BIG)
    }

    /// Bounds-checks an `(offset, size)` access against the cached limit,
    /// honoring expand-down semantics for stack/data segments.
    pub fn check_bounds(&self, offset: u32, size: u32) -> bool {
        if self.access.contains(Access::S) && !self.access.contains(Access::EXECUTABLE) && self.access.contains(Access::DC) {
            let upper = if self.big() { u32::MAX } else { 0xFFFF };
            offset > self.limit && offset.wrapping_add(size - 1) <= upper
        } else {
            offset.checked_add(size - 1).map(|end| end <= self.limit).unwrap_or(false)
        }
    }
}

/// Which descriptor table a selector's index field names.
pub enum TableKind {
    Gdt,
    Ldt,
}

/// `lookup_segment_selector`, per spec.md §4.3: resolves a selector against
/// the current GDTR/LDTR, returning the decoded descriptor or the
/// appropriate fault.
pub fn lookup_segment_selector(
    memory: &mut Memory,
    gdtr_base: u32,
    gdtr_limit: u32,
    ldtr_base: u32,
    ldtr_limit: u32,
    selector: SegSel,
) -> Result<Descriptor, CpuException> {
    let (table_base, table_limit) = if selector.is_ldt() {
        (ldtr_base, ldtr_limit)
    } else {
        (gdtr_base, gdtr_limit)
    };

    let byte_offset = (selector.index() as u32) * 8;
    if byte_offset + 7 > table_limit {
        return Err(CpuException::GeneralProtection(SelErrCode::from_selector(
            selector.0,
            false,
            selector.is_ldt(),
            false,
        )));
    }

    let addr = table_base + byte_offset;
    let lo = memory.read32(addr);
    let hi = memory.read32(addr + 4);
    Ok(Descriptor::decode(lo, hi))
}

/// Loads a data/stack/extra segment register, applying the privilege and
/// presence checks spec.md §4.3 lists for `MOV Sreg` (real mode, VM86 mode,
/// and protected mode are handled as separate branches, matching the
/// three-way split spec.md's algorithm describes).
pub fn switch_seg(
    memory: &mut Memory,
    real_mode: bool,
    vm86_mode: bool,
    cpl: PrivLvl,
    gdtr_base: u32,
    gdtr_limit: u32,
    ldtr_base: u32,
    ldtr_limit: u32,
    selector: u16,
    is_stack_segment: bool,
) -> Result<SegCache, CpuException> {
    if real_mode || vm86_mode {
        return Ok(SegCache::real_mode(selector));
    }

    let sel = SegSel(selector);

    if sel.is_null() {
        if is_stack_segment {
            return Err(CpuException::GeneralProtection(SelErrCode::from_selector(selector, false, false, false)));
        }
        return Ok(SegCache::null());
    }

    let desc = lookup_segment_selector(memory, gdtr_base, gdtr_limit, ldtr_base, ldtr_limit, sel)?;

    if desc.is_system() {
        return Err(CpuException::GeneralProtection(SelErrCode::from_selector(selector, false, sel.is_ldt(), false)));
    }

    if is_stack_segment {
        if !desc.is_writable() || desc.dpl() != cpl || sel.rpl() != cpl {
            return Err(CpuException::GeneralProtection(SelErrCode::from_selector(selector, false, sel.is_ldt(), false)));
        }
        if !desc.present() {
            return Err(CpuException::StackFault(SelErrCode::from_selector(selector, false, sel.is_ldt(), false)));
        }
    } else {
        let readable_or_data = if desc.is_code() { desc.is_readable() } else { true };
        if !readable_or_data {
            return Err(CpuException::GeneralProtection(SelErrCode::from_selector(selector, false, sel.is_ldt(), false)));
        }
        let access_ok = desc.is_conforming() || (sel.rpl().to_bits().max(cpl.to_bits()) <= desc.dpl().to_bits());
        if !access_ok {
            return Err(CpuException::GeneralProtection(SelErrCode::from_selector(selector, false, sel.is_ldt(), false)));
        }
        if !desc.present() {
            return Err(CpuException::SegmentNotPresent(SelErrCode::from_selector(selector, false, sel.is_ldt(), false)));
        }
    }

    Ok(SegCache::from_descriptor(sel, &desc))
}

/// Loads CS and updates CPL, per spec.md §4.3's direct-CS-load branch (used
/// by far JMP/CALL/RET and IRET, each of which first resolves the target
/// descriptor through [`lookup_segment_selector`] and their own privilege
/// rules before calling this).
pub fn load_code_segment(selector: SegSel, desc: &Descriptor) -> SegCache {
    SegCache::from_descriptor(selector, desc)
}

/// Far-transfer target descriptor classification needed by the dispatcher
/// to route CALL/JMP FAR through the correct state machine branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarTargetKind {
    Conforming,
    NonConforming,
    CallGate,
    TaskGate,
    Tss,
}

pub fn classify_far_target(desc: &Descriptor) -> Option<FarTargetKind> {
    if desc.is_system() {
        match desc.sys_type() {
            SysType::CallGate16 | SysType::CallGate32 => Some(FarTargetKind::CallGate),
            SysType::TaskGate => Some(FarTargetKind::TaskGate),
            SysType::Tss16Avail | SysType::Tss32Avail | SysType::Tss16Busy | SysType::Tss32Busy => Some(FarTargetKind::Tss),
            _ => None,
        }
    } else if desc.is_code() {
        Some(if desc.is_conforming() {
            FarTargetKind::Conforming
        } else {
            FarTargetKind::NonConforming
        })
    } else {
        None
    }
}

/// 32-bit Task State Segment layout, per SPEC_FULL.md §11's supplemented
/// field-offset table (the teacher's `TaskStateSeg` is the AMD64 64-bit
/// layout; this is the distinct IA-32 32-bit layout with per-ring stack
/// pointers and segment selectors rather than an Interrupt Stack Table).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TaskStateSeg32 {
    pub link: u16,
    _link_hi: u16,
    pub esp0: u32,
    pub ss0: u16,
    _ss0_hi: u16,
    pub esp1: u32,
    pub ss1: u16,
    _ss1_hi: u16,
    pub esp2: u32,
    pub ss2: u16,
    _ss2_hi: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    _es_hi: u16,
    pub cs: u16,
    _cs_hi: u16,
    pub ss: u16,
    _ss_hi: u16,
    pub ds: u16,
    _ds_hi: u16,
    pub fs: u16,
    _fs_hi: u16,
    pub gs: u16,
    _gs_hi: u16,
    pub ldt: u16,
    _ldt_hi: u16,
    pub trap: u16,
    pub io_map_base: u16,
}

impl TaskStateSeg32 {
    pub const SIZE: u32 = 104;

    pub fn read_from(memory: &mut Memory, base: u32) -> Self {
        Self {
            link: memory.read16(base),
            _link_hi: 0,
            esp0: memory.read32(base + 4),
            ss0: memory.read16(base + 8),
            _ss0_hi: 0,
            esp1: memory.read32(base + 12),
            ss1: memory.read16(base + 16),
            _ss1_hi: 0,
            esp2: memory.read32(base + 20),
            ss2: memory.read16(base + 24),
            _ss2_hi: 0,
            cr3: memory.read32(base + 28),
            eip: memory.read32(base + 32),
            eflags: memory.read32(base + 36),
            eax: memory.read32(base + 40),
            ecx: memory.read32(base + 44),
            edx: memory.read32(base + 48),
            ebx: memory.read32(base + 52),
            esp: memory.read32(base + 56),
            ebp: memory.read32(base + 60),
            esi: memory.read32(base + 64),
            edi: memory.read32(base + 68),
            es: memory.read16(base + 72),
            _es_hi: 0,
            cs: memory.read16(base + 76),
            _cs_hi: 0,
            ss: memory.read16(base + 80),
            _ss_hi: 0,
            ds: memory.read16(base + 84),
            _ds_hi: 0,
            fs: memory.read16(base + 88),
            _fs_hi: 0,
            gs: memory.read16(base + 92),
            _gs_hi: 0,
            ldt: memory.read16(base + 96),
            _ldt_hi: 0,
            trap: memory.read16(base + 100),
            io_map_base: memory.read16(base + 102),
        }
    }

    pub fn write_to(&self, memory: &mut Memory, base: u32) {
        memory.write16(base, self.link);
        memory.write32(base + 4, self.esp0);
        memory.write16(base + 8, self.ss0);
        memory.write32(base + 12, self.esp1);
        memory.write16(base + 16, self.ss1);
        memory.write32(base + 20, self.esp2);
        memory.write16(base + 24, self.ss2);
        memory.write32(base + 28, self.cr3);
        memory.write32(base + 32, self.eip);
        memory.write32(base + 36, self.eflags);
        memory.write32(base + 40, self.eax);
        memory.write32(base + 44, self.ecx);
        memory.write32(base + 48, self.edx);
        memory.write32(base + 52, self.ebx);
        memory.write32(base + 56, self.esp);
        memory.write32(base + 60, self.ebp);
        memory.write32(base + 64, self.esi);
        memory.write32(base + 68, self.edi);
        memory.write16(base + 72, self.es);
        memory.write16(base + 76, self.cs);
        memory.write16(base + 80, self.ss);
        memory.write16(base + 84, self.ds);
        memory.write16(base + 88, self.fs);
        memory.write16(base + 92, self.gs);
        memory.write16(base + 96, self.ldt);
        memory.write16(base + 100, self.trap);
        memory.write16(base + 102, self.io_map_base);
    }
}

/// Swaps the outgoing task's live register state into its TSS and loads the
/// incoming task's state, per spec.md §4.3's task-switch step list. CR3 is
/// reloaded by the caller (`Cpu::do_task_switch`) since that also requires
/// a full TLB flush, which this module has no access to.
pub fn do_task_switch(
    memory: &mut Memory,
    outgoing_tss_base: u32,
    incoming_tss_base: u32,
    outgoing: TaskStateSeg32,
    nested: bool,
) -> TaskStateSeg32 {
    let mut outgoing_snapshot = outgoing;
    if nested {
        outgoing_snapshot.link = 0;
    }
    outgoing_snapshot.write_to(memory, outgoing_tss_base);
    TaskStateSeg32::read_from(memory, incoming_tss_base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_desc(base: u32, limit: u32, dpl: u8, granular: bool, big: bool) -> (u32, u32) {
        let access = Access::PRESENT | Access::S | Access::EXECUTABLE | Access::RW
            | Access::from_bits_truncate((dpl & 0b11) << 5);
        let mut flags = Flags::empty();
        if granular {
            flags |= Flags::GRANULAR;
        }
        if big {
            flags |= Flags::BIG;
        }
        let desc = Descriptor { base, limit, access, flags, raw_type: access.bits & 0xF };
        desc.encode()
    }

    #[test]
    fn descriptor_round_trips_through_encode_decode() {
        let (lo, hi) = code_desc(0x0010_0000, 0xFFFF, 0, true, true);
        let desc = Descriptor::decode(lo, hi);
        assert_eq!(desc.base, 0x0010_0000);
        assert_eq!(desc.limit, 0xFFFF_FFFF);
        assert!(desc.present());
        assert!(desc.is_code());
        assert!(desc.big());
    }

    #[test]
    fn null_selector_data_segment_load_succeeds() {
        let mut mem = Memory::new(0x1000);
        let cache = switch_seg(&mut mem, false, false, PrivLvl::Ring0, 0, 0xFFFF, 0, 0, 0, false).unwrap();
        assert!(!cache.valid);
    }

    #[test]
    fn null_selector_stack_segment_load_faults() {
        let mut mem = Memory::new(0x1000);
        let err = switch_seg(&mut mem, false, false, PrivLvl::Ring0, 0, 0xFFFF, 0, 0, 0, true).unwrap_err();
        assert!(matches!(err, CpuException::GeneralProtection(_)));
    }

    #[test]
    fn real_mode_segment_base_is_selector_shifted_left_4() {
        let cache = SegCache::real_mode(0x1234);
        assert_eq!(cache.base, 0x12340);
        assert_eq!(cache.limit, 0xFFFF);
    }

    #[test]
    fn tss32_round_trips_through_memory() {
        let mut mem = Memory::new(0x200);
        let tss = TaskStateSeg32 { eax: 0xDEAD_BEEF, eip: 0x1234, cs: 0x08, ..Default::default() };
        tss.write_to(&mut mem, 0x100);
        let back = TaskStateSeg32::read_from(&mut mem, 0x100);
        assert_eq!(back.eax, 0xDEAD_BEEF);
        assert_eq!(back.eip, 0x1234);
        assert_eq!(back.cs, 0x08);
    }
}
