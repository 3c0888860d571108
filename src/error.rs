//! CPU exception taxonomy and snapshot error kind.
//!
//! Mirrors the error-code bit layouts the teacher crate defined for AMD64
//! (`SelErrCode`, `PfErrCode` in the old `interrupts` module) narrowed to the
//! IA-32 subset, wrapped in a `thiserror` enum so the outer driver can match
//! on exception kind instead of parsing a vector number back out.

use thiserror::Error;

bitflags::bitflags! {
    /// Selector-referencing error code pushed for #TS, #NP, #SS, #GP.
    pub struct SelErrCode: u32 {
        /// EXT: exception source external to the processor.
        const EXTERNAL = 1 << 0;
        /// IDT: selector-index field references a gate descriptor in the IDT.
        const IDT = 1 << 1;
        /// TI: selector-index field references a descriptor in the LDT (only
        /// meaningful when `IDT` is clear).
        const LDT = 1 << 2;
        const INDEX_MASK = 0b1111_1111_1111_1000;
    }

    /// Page-fault error code pushed for #PF, per spec.md §4.2/§7/§8.
    pub struct PfErrCode: u32 {
        /// P: 0 = not-present page, 1 = protection violation.
        const PRESENT = 1 << 0;
        /// R/W: 0 = read, 1 = write.
        const WRITE = 1 << 1;
        /// U/S: 0 = supervisor access, 1 = user access.
        const USER = 1 << 2;
    }
}

impl SelErrCode {
    /// Builds a selector error code from a raw selector, per spec.md §9's
    /// open question: the "segment selector index" form masks RPL (bits 0:1)
    /// out via `& ~3`, matching the architectural index-field convention
    /// rather than propagating the raw selector with its RPL bits intact.
    pub fn from_selector(selector: u16, from_idt: bool, from_ldt: bool, external: bool) -> Self {
        let mut code = SelErrCode::from_bits_truncate((selector as u32 & !0b11) & Self::INDEX_MASK.bits);
        if from_idt {
            code |= SelErrCode::IDT;
        }
        if from_ldt && !from_idt {
            code |= SelErrCode::LDT;
        }
        if external {
            code |= SelErrCode::EXTERNAL;
        }
        code
    }
}

/// A CPU exception raised by the instruction engine, segmentation unit, or
/// paging MMU. Carries enough information for `Cpu::call_interrupt_vector`
/// to push the architecturally-correct frame and error code (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuException {
    /// #DE: divide error (divide-by-zero or quotient overflow).
    #[error("#DE divide error")]
    DivideError,
    /// #DB: debug exception.
    #[error("#DB debug exception")]
    Debug,
    /// #BP: breakpoint (INT3).
    #[error("#BP breakpoint")]
    Breakpoint,
    /// #OF: overflow (INTO).
    #[error("#OF overflow")]
    Overflow,
    /// #UD: undefined/invalid opcode, or an SSE/MMX opcode trapped as undefined.
    #[error("#UD invalid opcode")]
    InvalidOpcode,
    /// #NM: device not available (FPU op with CR0.EM or CR0.TS set).
    #[error("#NM device not available")]
    DeviceNotAvailable,
    /// #DF: double fault (page-faulting while already unwinding a page fault).
    #[error("#DF double fault")]
    DoubleFault,
    /// #TS: invalid TSS.
    #[error("#TS invalid TSS (selector error {0:?})")]
    InvalidTss(SelErrCode),
    /// #NP: segment not present.
    #[error("#NP segment not present (selector error {0:?})")]
    SegmentNotPresent(SelErrCode),
    /// #SS: stack-segment fault.
    #[error("#SS stack fault (selector error {0:?})")]
    StackFault(SelErrCode),
    /// #GP: general protection fault.
    #[error("#GP general protection fault (selector error {0:?})")]
    GeneralProtection(SelErrCode),
    /// #PF: page fault. `addr` is the value latched into CR2.
    #[error("#PF page fault at {addr:#010x} (code {code:?})")]
    PageFault { addr: u32, code: PfErrCode },
}

impl CpuException {
    /// IDT/IVT vector number, per spec.md §7's error taxonomy table.
    pub const fn vector(self) -> u8 {
        match self {
            CpuException::DivideError => 0,
            CpuException::Debug => 1,
            CpuException::Breakpoint => 3,
            CpuException::Overflow => 4,
            CpuException::InvalidOpcode => 6,
            CpuException::DeviceNotAvailable => 7,
            CpuException::DoubleFault => 8,
            CpuException::InvalidTss(_) => 10,
            CpuException::SegmentNotPresent(_) => 11,
            CpuException::StackFault(_) => 12,
            CpuException::GeneralProtection(_) => 13,
            CpuException::PageFault { .. } => 14,
        }
    }

    /// The error code pushed on the exception frame, if any, widened to 32
    /// bits (truncated to 16 bits by the pusher when the gate is 16-bit).
    pub const fn error_code(self) -> Option<u32> {
        match self {
            CpuException::InvalidTss(c)
            | CpuException::SegmentNotPresent(c)
            | CpuException::StackFault(c)
            | CpuException::GeneralProtection(c) => Some(c.bits),
            CpuException::PageFault { code, .. } => Some(code.bits),
            _ => None,
        }
    }

    /// Whether this vector is a fault (re-executes the faulting instruction)
    /// as opposed to a trap (resumes at the following instruction).
    pub const fn is_fault(self) -> bool {
        !matches!(self, CpuException::Breakpoint | CpuException::Overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_error_code_masks_rpl() {
        let code = SelErrCode::from_selector(0x1B, false, false, false);
        assert_eq!(code.bits & !0b11, code.bits);
        assert_eq!(code.bits, 0x18);
    }

    #[test]
    fn page_fault_vector_is_14() {
        let e = CpuException::PageFault { addr: 0x1000, code: PfErrCode::USER };
        assert_eq!(e.vector(), 14);
        assert_eq!(e.error_code(), Some(PfErrCode::USER.bits));
    }
}
