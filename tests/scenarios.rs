//! End-to-end scenarios exercising the processor through its public API
//! only: build a `Cpu`, place code/data bytes in RAM, run a few
//! instructions, inspect the resulting architectural state.

use ia32core::cpu::{Cpu, CpuConfig};
use ia32core::error::{CpuException, PfErrCode};
use ia32core::registers::{Cr0, Eflags, Gpr, PrivLvl, SegReg};
use ia32core::segmentation::{Flags, SegCache};
use ia32core::snapshot::SnapshotInfo;

fn real_mode_cpu() -> Cpu {
    let mut cpu = Cpu::new(CpuConfig { memory_size: 0x10_0000 });
    cpu.segments[SegReg::Cs as usize] = SegCache::real_mode(0);
    cpu.segments[SegReg::Ds as usize] = SegCache::real_mode(0);
    cpu.segments[SegReg::Ss as usize] = SegCache::real_mode(0);
    cpu.regs.write32(Gpr::Esp, 0xFFF0);
    cpu.eip = 0x7C00;
    cpu
}

#[test]
fn real_mode_far_call_pushes_return_frame_and_loads_target() {
    let mut cpu = real_mode_cpu();

    // CALL FAR 0x3000:0x2000
    cpu.memory.write8(0x7C00, 0x9A);
    cpu.memory.write_blob(0x7C01, &0x0000_2000u32.to_le_bytes());
    cpu.memory.write_blob(0x7C05, &0x3000u16.to_le_bytes());

    cpu.run_cycles(1);

    assert_eq!(cpu.eip, 0x2000);
    assert_eq!(cpu.segments[SegReg::Cs as usize].base, 0x3000 << 4);
    assert_eq!(cpu.segments[SegReg::Cs as usize].selector.to_bits(), 0x3000);
    assert_eq!(cpu.cpl, PrivLvl::Ring0);

    // Return frame: the code segment is 16-bit default (no 0x66 prefix, CS
    // not `BIG`), so the pushed frame is 16-bit IP + 16-bit CS (4 bytes),
    // not a 32-bit EIP. Old IP (0x7C07, past the 7-byte instruction) pushed
    // last so it sits at the lowest address, old CS (0) just above it.
    let esp = cpu.regs.read32(Gpr::Esp);
    assert_eq!(esp, 0xFFF0 - 4);
    assert_eq!(cpu.memory.read16(esp), 0x7C07);
    assert_eq!(cpu.memory.read16(esp + 2), 0x0000);
}

#[test]
fn user_mode_access_to_not_present_page_faults_with_user_code() {
    let mut cpu = real_mode_cpu();
    cpu.cr.cr0 |= Cr0::PG | Cr0::PE;
    cpu.cr.cr3 = 0x2000; // page directory, left zeroed -> PDE not present
    cpu.cpl = PrivLvl::Ring3;

    let err = cpu.read_mem8(SegReg::Ds, 0x1000).unwrap_err();
    match err {
        CpuException::PageFault { addr, code } => {
            assert_eq!(addr, 0x1000);
            assert_eq!(code.bits, PfErrCode::USER.bits);
        }
        other => panic!("expected page fault, got {other:?}"),
    }
    assert_eq!(err.vector(), 14);
}

#[test]
fn add_eax_1_on_max_positive_sets_sf_and_of_not_zf_not_cf() {
    let mut cpu = real_mode_cpu();
    cpu.regs.write32(Gpr::Eax, 0x7FFF_FFFF);

    // 66 05 imm32 -> ADD EAX, imm32 in a 16-bit-default code segment.
    cpu.memory.write8(0x7C00, 0x66);
    cpu.memory.write8(0x7C01, 0x05);
    cpu.memory.write_blob(0x7C02, &1u32.to_le_bytes());

    cpu.run_cycles(1);
    cpu.sync_flags();

    assert_eq!(cpu.regs.read32(Gpr::Eax), 0x8000_0000);
    assert!(cpu.eflags.contains(Eflags::SF));
    assert!(cpu.eflags.contains(Eflags::OF));
    assert!(!cpu.eflags.contains(Eflags::ZF));
    assert!(!cpu.eflags.contains(Eflags::CF));
}

#[test]
fn rep_movsb_with_df_clear_copies_five_bytes_forward() {
    let mut cpu = real_mode_cpu();
    cpu.memory.write_blob(0x8000, b"HELLO");
    cpu.regs.write32(Gpr::Esi, 0x8000);
    cpu.regs.write32(Gpr::Edi, 0x9000);
    cpu.regs.write32(Gpr::Ecx, 5);
    cpu.eflags.remove(Eflags::DF);

    cpu.memory.write8(0x7C00, 0xF3); // REP
    cpu.memory.write8(0x7C01, 0xA4); // MOVSB
    cpu.run_cycles(1);

    assert_eq!(cpu.regs.read32(Gpr::Ecx), 0);
    assert_eq!(cpu.regs.read32(Gpr::Esi), 0x8005);
    assert_eq!(cpu.regs.read32(Gpr::Edi), 0x9005);
    for (i, b) in b"HELLO".iter().enumerate() {
        assert_eq!(cpu.memory.read8(0x9000 + i as u32), *b);
    }
}

#[test]
fn ring0_iret_with_vm_flag_set_enters_vm86_mode() {
    let mut cpu = real_mode_cpu();
    // Protected mode with a 32-bit default code segment, so IRETD takes the
    // privilege-checked path and pops the 32-bit VM86 frame instead of the
    // real-mode short-circuit.
    cpu.real_mode = false;
    cpu.cr.cr0 |= Cr0::PE;
    cpu.segments[SegReg::Cs as usize] = SegCache { flags: Flags::BIG, ..SegCache::real_mode(0) };
    cpu.regs.write32(Gpr::Esp, 0x500);

    let frame_base = 0x500u32;
    let new_eflags = (Eflags::VM | Eflags::IOPL_MASK).bits;
    cpu.memory.write_blob(frame_base, &0x0000_1000u32.to_le_bytes()); // EIP
    cpu.memory.write_blob(frame_base + 4, &0x0000_2000u32.to_le_bytes()); // CS
    cpu.memory.write_blob(frame_base + 8, &new_eflags.to_le_bytes()); // EFLAGS
    cpu.memory.write_blob(frame_base + 12, &0x0000_8000u32.to_le_bytes()); // ESP
    cpu.memory.write_blob(frame_base + 16, &0x0000_3000u32.to_le_bytes()); // SS
    cpu.memory.write_blob(frame_base + 20, &0x0000_4000u32.to_le_bytes()); // ES
    cpu.memory.write_blob(frame_base + 24, &0x0000_4000u32.to_le_bytes()); // DS
    cpu.memory.write_blob(frame_base + 28, &0x0000_4000u32.to_le_bytes()); // FS
    cpu.memory.write_blob(frame_base + 32, &0x0000_4000u32.to_le_bytes()); // GS

    cpu.memory.write8(0x7C00, 0xCF); // IRETD

    cpu.run_cycles(1);

    assert_eq!(cpu.cpl, PrivLvl::Ring3);
    assert!(cpu.vm86_mode);
    assert_eq!(cpu.eip, 0x1000);
    assert_eq!(cpu.regs.read32(Gpr::Esp), 0x8000);
    assert_eq!(cpu.segments[SegReg::Cs as usize].base, 0x2000 << 4);
    assert_eq!(cpu.segments[SegReg::Ss as usize].base, 0x3000 << 4);
    for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
        assert_eq!(cpu.segments[seg as usize].base, 0x4000 << 4);
    }
}

#[test]
fn snapshot_round_trip_preserves_registers_and_ram_across_10000_cycles() {
    fn fill_with_nops(cpu: &mut Cpu, start: u32, count: u32) {
        for i in 0..count {
            cpu.memory.write8(start.wrapping_add(i), 0x90);
        }
    }

    let mut cpu = real_mode_cpu();
    cpu.memory.write_blob(0x9000, b"snapshot-me");
    cpu.regs.write32(Gpr::Eax, 0x1122_3344);
    fill_with_nops(&mut cpu, 0x7C00, 10_000);
    cpu.run_cycles(10_000);

    let info = SnapshotInfo { emulator_version: "test".into(), description: "round trip".into() };
    let blob = cpu.save_state(&info).unwrap();

    let mut restored = Cpu::new(CpuConfig { memory_size: 0x10_0000 });
    restored.restore_state(&blob).unwrap();
    restored.segments[SegReg::Cs as usize] = SegCache::real_mode(0);
    restored.eip = cpu.eip;

    assert_eq!(restored.regs.read32(Gpr::Eax), 0x1122_3344);
    assert_eq!(restored.memory.read8(0x9000), b's');
    assert_eq!(restored.memory.get_state(), cpu.memory.get_state());

    // Both continue identically for another 10,000 cycles of NOPs.
    fill_with_nops(&mut cpu, cpu.eip, 10_000);
    fill_with_nops(&mut restored, restored.eip, 10_000);
    cpu.run_cycles(10_000);
    restored.run_cycles(10_000);

    assert_eq!(restored.regs, cpu.regs);
    assert_eq!(restored.eip, cpu.eip);
}

