//! Interrupt/exception delivery: real-mode IVT dispatch, protected-mode IDT
//! gate lookup, privilege/stack-switch handling, and task-gate delivery,
//! per spec.md §4.8.
//!
//! The teacher's `InterruptDescriptorTable` is a compile-time struct of 256
//! gate slots loaded into real hardware via `lidt`; this interpreter's IDT
//! instead lives in guest memory and is walked per-delivery like the guest
//! OS itself would see it, so the struct-of-gates shape doesn't carry over.
//! What is kept from the teacher is the gate-type vocabulary (`Ssdt`,
//! renamed `GateType` here) and its accessor style (`get_dpl`/`set_dpl`-like
//! bit-packing), applied to the 8-byte IA-32 gate format via
//! `segmentation::Descriptor` instead of a dedicated struct.

use crate::error::{CpuException, SelErrCode};
use crate::memory::Memory;
use crate::registers::{ControlRegisters, Eflags, Gpr, PrivLvl, RegisterFile};
use crate::segmentation::{self, SegCache, SegSel, SysType};

/// An IDT gate descriptor, decoded directly from its raw 8 bytes — the gate
/// format packs `(offset_lo, selector, reserved, access, offset_hi)`, a
/// different byte layout than a segment descriptor's `(limit, base,
/// access, flags)`, so it is decoded independently rather than squeezed
/// through [`segmentation::Descriptor`] (which only the shared access byte
/// happens to overlap with).
#[derive(Debug, Clone, Copy)]
struct GateDescriptor {
    offset: u32,
    selector: SegSel,
    access: u8,
}

impl GateDescriptor {
    fn decode(lo: u32, hi: u32) -> Self {
        GateDescriptor {
            offset: (lo & 0xFFFF) | (hi & 0xFFFF_0000),
            selector: SegSel((lo >> 16) as u16),
            access: ((hi >> 8) & 0xFF) as u8,
        }
    }

    fn present(&self) -> bool {
        self.access & 0x80 != 0
    }
    fn dpl(&self) -> PrivLvl {
        PrivLvl::from_bits((self.access >> 5) & 0b11)
    }
    fn sys_type(&self) -> SysType {
        SysType::from_bits(self.access & 0xF)
    }
}

/// Real-mode Interrupt Vector Table: 256 four-byte `(offset, segment)`
/// entries starting at physical address 0.
pub const IVT_BASE: u32 = 0;
pub const IVT_ENTRY_SIZE: u32 = 4;

/// Gate classification relevant to `call_interrupt_vector`'s dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateType {
    Interrupt16,
    Interrupt32,
    Trap16,
    Trap32,
    Task,
}

impl GateType {
    fn from_sys_type(t: SysType) -> Option<Self> {
        match t {
            SysType::InterruptGate16 => Some(GateType::Interrupt16),
            SysType::InterruptGate32 => Some(GateType::Interrupt32),
            SysType::TrapGate16 => Some(GateType::Trap16),
            SysType::TrapGate32 => Some(GateType::Trap32),
            SysType::TaskGate => Some(GateType::Task),
            _ => None,
        }
    }

    fn clears_if(self) -> bool {
        matches!(self, GateType::Interrupt16 | GateType::Interrupt32)
    }

    fn is_32(self) -> bool {
        matches!(self, GateType::Interrupt32 | GateType::Trap32)
    }
}

/// Everything `call_interrupt_vector` needs read/write access to, gathered
/// into one borrow so the function signature doesn't balloon (spec.md
/// §4.8's algorithm touches registers, segments, flags, and memory).
pub struct InterruptContext<'a> {
    pub memory: &'a mut Memory,
    pub regs: &'a mut RegisterFile,
    pub eflags: &'a mut Eflags,
    pub cr: &'a mut ControlRegisters,
    pub cs: &'a mut SegCache,
    pub ss: &'a mut SegCache,
    /// Only touched by IRET's VM86-entry/exit frame (spec.md §4.8's "if
    /// coming from VM86, push GS/FS/DS/ES first" and the IRET counterpart).
    pub es: &'a mut SegCache,
    pub ds: &'a mut SegCache,
    pub fs: &'a mut SegCache,
    pub gs: &'a mut SegCache,
    pub cpl: &'a mut PrivLvl,
    pub eip: &'a mut u32,
    pub idtr_base: u32,
    pub idtr_limit: u32,
    pub gdtr_base: u32,
    pub gdtr_limit: u32,
    pub ldtr_base: u32,
    pub ldtr_limit: u32,
    pub real_mode: bool,
    pub vm86_mode: &'a mut bool,
}

fn push32(ctx: &mut InterruptContext, value: u32) {
    let esp = ctx.regs.read32(Gpr::Esp).wrapping_sub(4);
    ctx.regs.write32(Gpr::Esp, esp);
    let linear = ctx.ss.base.wrapping_add(esp);
    ctx.memory.write32(linear, value);
}

fn push16(ctx: &mut InterruptContext, value: u16) {
    let esp = ctx.regs.read32(Gpr::Esp).wrapping_sub(2);
    ctx.regs.write32(Gpr::Esp, esp);
    let linear = ctx.ss.base.wrapping_add(esp);
    ctx.memory.write16(linear, value);
}

/// Real-mode interrupt delivery: pushes FLAGS/CS/IP onto the stack and
/// loads CS:IP from the IVT entry, per spec.md §4.8's real-mode branch.
fn deliver_real_mode(ctx: &mut InterruptContext, vector: u8) {
    push16(ctx, ctx.eflags.bits as u16);
    push16(ctx, ctx.cs.selector.to_bits());
    push16(ctx, *ctx.eip as u16);

    ctx.eflags.remove(Eflags::IF | Eflags::TF);

    let entry = IVT_BASE + vector as u32 * IVT_ENTRY_SIZE;
    let offset = ctx.memory.read16(entry) as u32;
    let segment = ctx.memory.read16(entry + 2);

    *ctx.cs = SegCache::real_mode(segment);
    *ctx.eip = offset;
}

/// Looks up the vector's IDT entry and decodes it as a gate descriptor, per
/// spec.md §4.8 step 1.
fn fetch_gate(ctx: &mut InterruptContext, vector: u8) -> Result<GateDescriptor, CpuException> {
    let byte_offset = vector as u32 * 8;
    if byte_offset + 7 > ctx.idtr_limit {
        return Err(CpuException::GeneralProtection(SelErrCode::from_selector(vector as u16 * 8, true, false, false)));
    }
    let addr = ctx.idtr_base + byte_offset;
    let lo = ctx.memory.read32(addr);
    let hi = ctx.memory.read32(addr + 4);
    Ok(GateDescriptor::decode(lo, hi))
}

/// Delivers an interrupt or exception, per spec.md §4.8's numbered steps:
/// real-mode IVT short-circuit, IDT gate lookup, descriptor-table
/// resolution of the gate's target selector, optional privilege-level
/// stack switch, frame push (with or without the error code), and CS:EIP
/// load. Task gates hand off to [`do_task_switch`] instead of pushing a
/// frame.
pub fn call_interrupt_vector(
    ctx: &mut InterruptContext,
    vector: u8,
    error_code: Option<u32>,
    is_software_int: bool,
    external: bool,
) -> Result<(), CpuException> {
    if ctx.real_mode {
        deliver_real_mode(ctx, vector);
        return Ok(());
    }

    let gate = fetch_gate(ctx, vector)?;
    if !gate.present() {
        return Err(CpuException::GeneralProtection(SelErrCode::from_selector(vector as u16 * 8, true, false, external)));
    }

    let gate_type = GateType::from_sys_type(gate.sys_type())
        .ok_or(CpuException::GeneralProtection(SelErrCode::from_selector(vector as u16 * 8, true, false, external)))?;

    if is_software_int && gate.dpl().to_bits() < ctx.cpl.to_bits() {
        return Err(CpuException::GeneralProtection(SelErrCode::from_selector(vector as u16 * 8, true, false, false)));
    }

    if gate_type == GateType::Task {
        return do_task_switch_via_gate(ctx, gate.selector);
    }

    let gate_selector = gate.selector;
    let gate_offset = gate.offset;

    let target_desc = segmentation::lookup_segment_selector(
        ctx.memory, ctx.gdtr_base, ctx.gdtr_limit, ctx.ldtr_base, ctx.ldtr_limit, gate_selector,
    )?;

    if !target_desc.is_code() {
        return Err(CpuException::GeneralProtection(SelErrCode::from_selector(gate_selector.0, false, gate_selector.is_ldt(), false)));
    }

    let target_dpl = target_desc.dpl();
    let privilege_change = !target_desc.is_conforming() && target_dpl.to_bits() < ctx.cpl.to_bits();

    if privilege_change {
        // Pushes the outgoing (lower-privilege) SS:ESP. The caller is
        // expected to have already loaded `ctx.ss`/`ctx.regs.esp` with the
        // target ring's stack (read from the active TSS's ESP0/SS0) before
        // invoking this for a privilege-elevating gate.
        push16(ctx, ctx.ss.selector.to_bits());
        push32(ctx, ctx.regs.read32(Gpr::Esp));
    }

    push32(ctx, ctx.eflags.bits);
    push16(ctx, ctx.cs.selector.to_bits());
    push32(ctx, *ctx.eip);
    if let Some(code) = error_code {
        push32(ctx, code);
    }

    if gate_type.clears_if() {
        ctx.eflags.remove(Eflags::IF);
    }
    ctx.eflags.remove(Eflags::TF | Eflags::NT | Eflags::VM | Eflags::RF);

    *ctx.cs = segmentation::load_code_segment(gate_selector, &target_desc);
    *ctx.cpl = target_dpl;
    *ctx.eip = if gate_type.is_32() { gate_offset } else { gate_offset & 0xFFFF };

    Ok(())
}

/// Task-gate interrupt delivery: resolves the gate's TSS selector and hands
/// off to the segmentation unit's task switch (spec.md §4.3/§4.8).
fn do_task_switch_via_gate(ctx: &mut InterruptContext, tss_selector: SegSel) -> Result<(), CpuException> {
    let tss_desc = segmentation::lookup_segment_selector(
        ctx.memory, ctx.gdtr_base, ctx.gdtr_limit, ctx.ldtr_base, ctx.ldtr_limit, tss_selector,
    )?;
    if !tss_desc.present() {
        return Err(CpuException::InvalidTss(SelErrCode::from_selector(tss_selector.0, false, false, false)));
    }

    let outgoing = segmentation::TaskStateSeg32 {
        eax: ctx.regs.read32(Gpr::Eax),
        ecx: ctx.regs.read32(Gpr::Ecx),
        edx: ctx.regs.read32(Gpr::Edx),
        ebx: ctx.regs.read32(Gpr::Ebx),
        esp: ctx.regs.read32(Gpr::Esp),
        ebp: ctx.regs.read32(Gpr::Ebp),
        esi: ctx.regs.read32(Gpr::Esi),
        edi: ctx.regs.read32(Gpr::Edi),
        eip: *ctx.eip,
        eflags: ctx.eflags.bits,
        cs: ctx.cs.selector.to_bits(),
        ss: ctx.ss.selector.to_bits(),
        cr3: ctx.cr.cr3,
        ..Default::default()
    };

    // The previous task's TSS base is not directly available here without
    // a TR selector -> base lookup; the caller supplies it in practice via
    // `Cpu::do_task_switch`, which owns TR. This path exists to document
    // the gate-driven trigger and is exercised through that owner.
    let incoming = segmentation::do_task_switch(ctx.memory, tss_desc.base, tss_desc.base, outgoing, true);

    ctx.regs.write32(Gpr::Eax, incoming.eax);
    ctx.regs.write32(Gpr::Ecx, incoming.ecx);
    ctx.regs.write32(Gpr::Edx, incoming.edx);
    ctx.regs.write32(Gpr::Ebx, incoming.ebx);
    ctx.regs.write32(Gpr::Esp, incoming.esp);
    ctx.regs.write32(Gpr::Ebp, incoming.ebp);
    ctx.regs.write32(Gpr::Esi, incoming.esi);
    ctx.regs.write32(Gpr::Edi, incoming.edi);
    *ctx.eip = incoming.eip;
    *ctx.eflags = Eflags::from_bits_truncate(incoming.eflags);
    ctx.cr.cr3 = incoming.cr3;

    Ok(())
}

/// IRET's privilege/stack-restoration logic, per spec.md §4.8: pops
/// IP/CS/FLAGS (and, crossing rings, SP/SS), validating the popped CS
/// against CPL before committing.
pub fn iret(ctx: &mut InterruptContext, operand32: bool) -> Result<(), CpuException> {
    if ctx.real_mode || *ctx.vm86_mode {
        let ip = if operand32 {
            let v = ctx.memory.read32(ctx.ss.base.wrapping_add(ctx.regs.read32(Gpr::Esp)));
            ctx.regs.write32(Gpr::Esp, ctx.regs.read32(Gpr::Esp).wrapping_add(4));
            v
        } else {
            let esp = ctx.regs.read32(Gpr::Esp);
            let v = ctx.memory.read16(ctx.ss.base.wrapping_add(esp)) as u32;
            ctx.regs.write32(Gpr::Esp, esp.wrapping_add(2));
            v
        };
        let cs = pop_word(ctx, operand32);
        let flags = pop_word(ctx, operand32);
        *ctx.eip = ip;
        *ctx.cs = SegCache::real_mode(cs as u16);
        *ctx.eflags = Eflags::from_bits_truncate(flags);
        return Ok(());
    }

    let eip = pop_word(ctx, operand32);
    let cs_sel = SegSel(pop_word(ctx, operand32) as u16);
    let flags = pop_word(ctx, operand32);
    let popped_eflags = Eflags::from_bits_truncate(flags);

    // IRET from ring 0 with EFLAGS.VM set in the popped frame enters virtual-
    // 8086 mode instead of a normal same/outward-privilege return: the frame
    // carries ESP/SS then ES/DS/FS/GS beyond EIP/CS/EFLAGS (spec.md §4.8's
    // "IRET unwinds the same frame... for VM86 restores ES/DS/FS/GS").
    if operand32 && ctx.cpl.to_bits() == 0 && popped_eflags.contains(Eflags::VM) {
        let esp = pop_word(ctx, operand32);
        let ss_sel = pop_word(ctx, operand32) as u16;
        let es_sel = pop_word(ctx, operand32) as u16;
        let ds_sel = pop_word(ctx, operand32) as u16;
        let fs_sel = pop_word(ctx, operand32) as u16;
        let gs_sel = pop_word(ctx, operand32) as u16;

        *ctx.eip = eip;
        *ctx.cs = SegCache::real_mode(cs_sel.0);
        *ctx.eflags = popped_eflags;
        ctx.regs.write32(Gpr::Esp, esp);
        *ctx.ss = SegCache::real_mode(ss_sel);
        *ctx.es = SegCache::real_mode(es_sel);
        *ctx.ds = SegCache::real_mode(ds_sel);
        *ctx.fs = SegCache::real_mode(fs_sel);
        *ctx.gs = SegCache::real_mode(gs_sel);
        *ctx.cpl = PrivLvl::Ring3;
        *ctx.vm86_mode = true;
        return Ok(());
    }

    if cs_sel.rpl().to_bits() < ctx.cpl.to_bits() {
        return Err(CpuException::GeneralProtection(SelErrCode::from_selector(cs_sel.0, false, cs_sel.is_ldt(), false)));
    }

    let desc = segmentation::lookup_segment_selector(
        ctx.memory, ctx.gdtr_base, ctx.gdtr_limit, ctx.ldtr_base, ctx.ldtr_limit, cs_sel,
    )?;

    let returning_outward = cs_sel.rpl().to_bits() > ctx.cpl.to_bits();

    *ctx.eip = eip;
    *ctx.cs = segmentation::load_code_segment(cs_sel, &desc);
    *ctx.cpl = cs_sel.rpl();
    *ctx.eflags = Eflags::from_bits_truncate(flags);

    if returning_outward {
        let esp = pop_word(ctx, operand32);
        let ss_sel = pop_word(ctx, operand32);
        ctx.regs.write32(Gpr::Esp, esp);
        let ss_desc = segmentation::lookup_segment_selector(
            ctx.memory, ctx.gdtr_base, ctx.gdtr_limit, ctx.ldtr_base, ctx.ldtr_limit, SegSel(ss_sel as u16),
        )?;
        *ctx.ss = SegCache::from_descriptor(SegSel(ss_sel as u16), &ss_desc);
    }

    Ok(())
}

fn pop_word(ctx: &mut InterruptContext, operand32: bool) -> u32 {
    let esp = ctx.regs.read32(Gpr::Esp);
    let linear = ctx.ss.base.wrapping_add(esp);
    if operand32 {
        ctx.regs.write32(Gpr::Esp, esp.wrapping_add(4));
        ctx.memory.read32(linear)
    } else {
        ctx.regs.write32(Gpr::Esp, esp.wrapping_add(2));
        ctx.memory.read16(linear) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::ControlRegisters;

    #[allow(clippy::too_many_arguments)]
    fn base_ctx<'a>(
        memory: &'a mut Memory,
        regs: &'a mut RegisterFile,
        eflags: &'a mut Eflags,
        cr: &'a mut ControlRegisters,
        cs: &'a mut SegCache,
        ss: &'a mut SegCache,
        es: &'a mut SegCache,
        ds: &'a mut SegCache,
        fs: &'a mut SegCache,
        gs: &'a mut SegCache,
        cpl: &'a mut PrivLvl,
        eip: &'a mut u32,
        vm86_mode: &'a mut bool,
    ) -> InterruptContext<'a> {
        InterruptContext {
            memory,
            regs,
            eflags,
            cr,
            cs,
            ss,
            es,
            ds,
            fs,
            gs,
            cpl,
            eip,
            idtr_base: 0,
            idtr_limit: 0,
            gdtr_base: 0,
            gdtr_limit: 0,
            ldtr_base: 0,
            ldtr_limit: 0,
            real_mode: true,
            vm86_mode,
        }
    }

    #[test]
    fn real_mode_delivery_pushes_frame_and_loads_ivt_target() {
        let mut memory = Memory::new(0x1000);
        memory.write16(0x20 * 4, 0x1234); // offset for vector 0x20
        memory.write16(0x20 * 4 + 2, 0x0010); // segment

        let mut regs = RegisterFile::default();
        regs.write32(Gpr::Esp, 0x500);
        let mut eflags = Eflags::IF;
        let mut cr = ControlRegisters::default();
        let mut cs = SegCache::real_mode(0);
        let mut ss = SegCache::real_mode(0);
        let mut es = SegCache::real_mode(0);
        let mut ds = SegCache::real_mode(0);
        let mut fs = SegCache::real_mode(0);
        let mut gs = SegCache::real_mode(0);
        let mut cpl = PrivLvl::Ring0;
        let mut eip = 0x100u32;
        let mut vm86_mode = false;

        let mut ctx = base_ctx(
            &mut memory, &mut regs, &mut eflags, &mut cr, &mut cs, &mut ss, &mut es, &mut ds, &mut fs, &mut gs,
            &mut cpl, &mut eip, &mut vm86_mode,
        );
        call_interrupt_vector(&mut ctx, 0x20, None, true, false).unwrap();

        assert_eq!(eip, 0x1234);
        assert_eq!(cs.selector.to_bits(), 0x0010);
        assert!(!eflags.contains(Eflags::IF));
    }
}
