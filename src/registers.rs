//! The IA-32 register file: general-purpose registers with byte/word/dword
//! aliasing, segment selectors, control/debug registers, EFLAGS, and the
//! lazy arithmetic-flag shadow.
//!
//! Bitflag layout follows the teacher's AMD64 `registers` module (`RFLAGS`,
//! `CR0`, `CR4`), narrowed to the fields IA-32 protected mode actually uses —
//! long-mode-only bits (`LME`/`LMA`/`PCIDE`/`LA57`/...) are dropped since
//! spec.md's Non-goals explicitly exclude 64-bit long mode.

bitflags::bitflags! {
    /// EFLAGS. Only CF/PF/AF/ZF/SF/OF (the lazily-evaluated arithmetic flags,
    /// §3/§4.6) are ever stale relative to the shadow; every other bit here
    /// is always authoritative in `eflags`.
    pub struct Eflags: u32 {
        const CF    = 1 << 0;
        const PF    = 1 << 2;
        const AF    = 1 << 4;
        const ZF    = 1 << 6;
        const SF    = 1 << 7;
        const TF    = 1 << 8;
        const IF    = 1 << 9;
        const DF    = 1 << 10;
        const OF    = 1 << 11;
        const IOPL_MASK = 0b11 << 12;
        const NT    = 1 << 14;
        const RF    = 1 << 16;
        const VM    = 1 << 17;
        const AC    = 1 << 18;
        const VIF   = 1 << 19;
        const VIP   = 1 << 20;
        const ID    = 1 << 21;

        /// Bits that are computed from the lazy-flag shadow rather than
        /// stored directly, when the corresponding `flags_changed` bit is set.
        const ARITH_MASK = Self::CF.bits | Self::PF.bits | Self::AF.bits
            | Self::ZF.bits | Self::SF.bits | Self::OF.bits;
    }

    /// Control Register 0.
    pub struct Cr0: u32 {
        /// PE: protected mode enable.
        const PE = 1 << 0;
        /// MP: monitor co-processor.
        const MP = 1 << 1;
        /// EM: emulation (no x87 FPU present).
        const EM = 1 << 2;
        /// TS: task switched.
        const TS = 1 << 3;
        /// ET: extension type (always 1 on 486+).
        const ET = 1 << 4;
        /// NE: numeric error reporting style.
        const NE = 1 << 5;
        /// WP: write-protect — ring 0 writes to read-only user pages fault.
        const WP = 1 << 16;
        /// AM: alignment mask.
        const AM = 1 << 18;
        /// NW: not write-through.
        const NW = 1 << 29;
        /// CD: cache disable.
        const CD = 1 << 30;
        /// PG: paging enable.
        const PG = 1 << 31;
    }

    /// Control Register 4.
    pub struct Cr4: u32 {
        /// VME: virtual-8086 mode extensions.
        const VME = 1 << 0;
        /// PVI: protected-mode virtual interrupts.
        const PVI = 1 << 1;
        /// TSD: time stamp disable.
        const TSD = 1 << 2;
        /// DE: debugging extensions.
        const DE  = 1 << 3;
        /// PSE: page size extension (4 MiB pages).
        const PSE = 1 << 4;
        /// PAE: physical address extension. Accepted for completeness; the
        /// paging walker (`tlb.rs`) implements only the non-PAE two-level
        /// format spec.md §4.2 describes.
        const PAE = 1 << 5;
        /// MCE: machine check exception.
        const MCE = 1 << 6;
        /// PGE: page global enable.
        const PGE = 1 << 7;
        /// PCE: performance-monitoring counter enable.
        const PCE = 1 << 8;
        /// OSFXSR: OS support for FXSAVE/FXRSTOR.
        const OSFXSR = 1 << 9;
        /// OSXMMEXCPT: OS support for unmasked SIMD FP exceptions.
        const OSXMMEXCPT = 1 << 10;
    }
}

/// Ring / privilege level, carried from the teacher's `PrivLvl` (supplemented
/// feature, SPEC_FULL.md §11).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrivLvl {
    Ring0 = 0b00,
    Ring1 = 0b01,
    Ring2 = 0b10,
    Ring3 = 0b11,
}

impl PrivLvl {
    #[inline]
    pub const fn from_bits(from: u8) -> Self {
        match from & 0b11 {
            0b00 => PrivLvl::Ring0,
            0b01 => PrivLvl::Ring1,
            0b10 => PrivLvl::Ring2,
            _ => PrivLvl::Ring3,
        }
    }

    #[inline]
    pub const fn to_bits(self) -> u8 {
        self as u8
    }

    pub const fn is_userland(self) -> bool {
        matches!(self, PrivLvl::Ring3)
    }
}

/// Index into the eight 32-bit general-purpose register slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax, Gpr::Ecx, Gpr::Edx, Gpr::Ebx, Gpr::Esp, Gpr::Ebp, Gpr::Esi, Gpr::Edi,
    ];

    #[inline]
    pub const fn from_bits(bits: u8) -> Self {
        Self::ALL[(bits & 0b111) as usize]
    }
}

/// General-purpose register file. A flat `[u8; 32]` backing store aliased by
/// 32/16/8-bit views, per the Design Note in spec.md §9 ("Typed-array
/// aliasing"): `AH` is byte 1 of the `EAX` slot, `AL` is byte 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    bytes: [u8; 32],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self { bytes: [0; 32] }
    }
}

impl RegisterFile {
    #[inline]
    fn slot(reg: Gpr) -> usize {
        reg as usize * 4
    }

    #[inline]
    pub fn read32(&self, reg: Gpr) -> u32 {
        let s = Self::slot(reg);
        u32::from_le_bytes(self.bytes[s..s + 4].try_into().unwrap())
    }

    #[inline]
    pub fn write32(&mut self, reg: Gpr, val: u32) {
        let s = Self::slot(reg);
        self.bytes[s..s + 4].copy_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn read16(&self, reg: Gpr) -> u16 {
        let s = Self::slot(reg);
        u16::from_le_bytes(self.bytes[s..s + 2].try_into().unwrap())
    }

    #[inline]
    pub fn write16(&mut self, reg: Gpr, val: u16) {
        let s = Self::slot(reg);
        self.bytes[s..s + 2].copy_from_slice(&val.to_le_bytes());
    }

    /// Reads the low byte (AL/CL/DL/BL) for the first four registers.
    #[inline]
    pub fn read8_low(&self, reg: Gpr) -> u8 {
        self.bytes[Self::slot(reg)]
    }

    #[inline]
    pub fn write8_low(&mut self, reg: Gpr, val: u8) {
        self.bytes[Self::slot(reg)] = val;
    }

    /// Reads the high byte (AH/CH/DH/BH); only valid for EAX/ECX/EDX/EBX.
    #[inline]
    pub fn read8_high(&self, reg: Gpr) -> u8 {
        self.bytes[Self::slot(reg) + 1]
    }

    #[inline]
    pub fn write8_high(&mut self, reg: Gpr, val: u8) {
        self.bytes[Self::slot(reg) + 1] = val;
    }

    /// Reads an 8-bit register by the standard ModR/M reg-field encoding
    /// (0-3 low bytes AL/CL/DL/BL, 4-7 high bytes AH/CH/DH/BH).
    pub fn read8(&self, index: u8) -> u8 {
        if index < 4 {
            self.read8_low(Gpr::from_bits(index))
        } else {
            self.read8_high(Gpr::from_bits(index - 4))
        }
    }

    pub fn write8(&mut self, index: u8, val: u8) {
        if index < 4 {
            self.write8_low(Gpr::from_bits(index), val);
        } else {
            self.write8_high(Gpr::from_bits(index - 4), val);
        }
    }

    pub fn get_state(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    pub fn set_state(&mut self, data: &[u8]) {
        self.bytes.copy_from_slice(&data[..32]);
    }
}

/// Segment register identity (also used as the index into `Cpu::segments`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

/// Control register file. Only CR0/CR2/CR3/CR4 carry architectural meaning
/// for IA-32 (spec.md §3); CR1/CR5-CR7 are reserved and kept only as storage
/// so that `MOV CRn` encodings that (incorrectly) name them still have
/// somewhere to write without panicking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRegisters {
    pub cr0: Cr0,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: Cr4,
    pub reserved: [u32; 4],
}

impl Default for Cr0 {
    fn default() -> Self {
        Cr0::ET
    }
}
impl Default for Cr4 {
    fn default() -> Self {
        Cr4::empty()
    }
}

impl Default for ControlRegisters {
    fn default() -> Self {
        Self {
            cr0: Cr0::default(),
            cr2: 0,
            cr3: 0,
            cr4: Cr4::default(),
            reserved: [0; 4],
        }
    }
}

/// Debug register file (DR0-DR7). Breakpoint matching is not implemented
/// (spec.md's Non-goals don't name it, but the testable properties never
/// exercise it either); storage is kept so SW that reads/writes DRs for
/// save/restore purposes round-trips correctly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugRegisters {
    pub dr: [u32; 8],
}

/// Operand width, encoded the way spec.md §4.6 specifies: 0 = 8-bit (mask 7),
/// 1 = 16-bit (mask 15), 2 = 32-bit (mask 31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpSize {
    Size8 = 0,
    Size16 = 1,
    Size32 = 2,
}

impl OpSize {
    #[inline]
    pub const fn mask_bit(self) -> u32 {
        match self {
            OpSize::Size8 => 7,
            OpSize::Size16 => 15,
            OpSize::Size32 => 31,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            OpSize::Size8 => 8,
            OpSize::Size16 => 16,
            OpSize::Size32 => 32,
        }
    }

    #[inline]
    pub const fn value_mask(self) -> u32 {
        match self {
            OpSize::Size8 => 0xFF,
            OpSize::Size16 => 0xFFFF,
            OpSize::Size32 => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub const fn sign_bit(self) -> u32 {
        1 << self.mask_bit()
    }
}

/// Category of the last arithmetic/logic operation, used so flag recovery
/// (`flags.rs`) can pick the right formula per spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastOpKind {
    Add,
    Sub,
    Logical,
    Shl,
    Shr,
    Sar,
    Rcl,
    Rcr,
    Imul,
    Mul,
}

/// `LastOpKind` stored as a small integer so `FlagShadow` can derive
/// `Default`/`Eq` without an `Option<enum>` dance at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastOpKindStorage(pub u8);

impl LastOpKindStorage {
    pub const ADD: Self = Self(0);
    pub const SUB: Self = Self(1);
    pub const LOGICAL: Self = Self(2);
    pub const SHL: Self = Self(3);
    pub const SHR: Self = Self(4);
    pub const SAR: Self = Self(5);
    pub const RCL: Self = Self(6);
    pub const RCR: Self = Self(7);
    pub const IMUL: Self = Self(8);
    pub const MUL: Self = Self(9);

    pub fn kind(self) -> LastOpKind {
        match self.0 {
            0 => LastOpKind::Add,
            1 => LastOpKind::Sub,
            2 => LastOpKind::Logical,
            3 => LastOpKind::Shl,
            4 => LastOpKind::Shr,
            5 => LastOpKind::Sar,
            6 => LastOpKind::Rcl,
            7 => LastOpKind::Rcr,
            8 => LastOpKind::Imul,
            _ => LastOpKind::Mul,
        }
    }
}

impl Default for LastOpKindStorage {
    fn default() -> Self {
        Self::ADD
    }
}

/// Lazy arithmetic-flag shadow: `last_op1`, `last_op2`, `last_add_result`,
/// `last_result`, `last_op_size`, and `flags_changed`, per spec.md §3/§4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagShadow {
    pub last_op1: u32,
    pub last_op2: u32,
    pub last_add_result: u32,
    pub last_result: u32,
    pub last_op_size: u8,
    pub kind: LastOpKindStorage,
    /// Bitmask of which arithmetic flags (`Eflags::CF` etc. bit positions)
    /// are stale and must be recomputed from the shadow.
    pub flags_changed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ah_is_byte_one_of_eax() {
        let mut regs = RegisterFile::default();
        regs.write32(Gpr::Eax, 0x1234_5678);
        assert_eq!(regs.read8_low(Gpr::Eax), 0x78);
        assert_eq!(regs.read8_high(Gpr::Eax), 0x56);
        assert_eq!(regs.read16(Gpr::Eax), 0x5678);
    }

    #[test]
    fn modrm_reg_field_8bit_addressing() {
        let mut regs = RegisterFile::default();
        regs.write32(Gpr::Eax, 0xAABB_CCDD);
        assert_eq!(regs.read8(0), 0xDD); // AL
        assert_eq!(regs.read8(4), 0xBB); // AH
    }

    #[test]
    fn cr0_default_sets_et() {
        assert!(ControlRegisters::default().cr0.contains(Cr0::ET));
    }
}
