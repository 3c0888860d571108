//! Software TLB and two-level page walker, per spec.md §3/§4.2.
//!
//! Grounded on the teacher's AMD64 `paging` module's index-extraction style
//! (`pt_index`/`pdt_index`) and `PTE` bitflags, narrowed from the four-level
//! long-mode format to IA-32's two-level 4 KiB/4 MiB format, and extended
//! with the 2^20-entry flat TLB arrays `spec.md` §3 requires (AMD64 uses
//! hardware TLBs, so the teacher has no equivalent software structure here —
//! this part is grounded directly on spec.md's algorithm description).

use crate::error::{CpuException, PfErrCode};
use crate::memory::Memory;
use crate::registers::{Cr0, Cr4};

/// Number of virtual pages addressable by 32-bit linear addresses (2^20).
pub const TLB_ENTRIES: usize = 1 << 20;

bitflags::bitflags! {
    /// Page Table / Page Directory Entry flags (IA-32, non-PAE).
    pub struct Pte: u32 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// PS: for a PDE, set => this entry maps a 4 MiB page directly.
        const PAGE_SIZE = 1 << 7;
        const GLOBAL = 1 << 8;
    }

    /// Permission bits cached per-TLB-entry: which (privilege, access) class
    /// combinations are allowed without a fresh page walk.
    pub struct TlbPerm: u8 {
        const SYSTEM_READ  = 1 << 0;
        const SYSTEM_WRITE = 1 << 1;
        const USER_READ    = 1 << 2;
        const USER_WRITE   = 1 << 3;
    }
}

const PTE_BASE_4K_MASK: u32 = 0xFFFF_F000;
const PDE_BASE_4M_MASK: u32 = 0xFFC0_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// The software TLB: parallel `tlb_data`/`tlb_info`/`tlb_info_global` arrays
/// indexed by 20-bit virtual page number, per spec.md §3.
pub struct Tlb {
    /// `tlb_data[p] = physical_page_base XOR (p << 12)`.
    tlb_data: Vec<u32>,
    tlb_info: Vec<TlbPerm>,
    tlb_info_global: Vec<TlbPerm>,
    /// `(last_virt_eip, eip_phys)` instruction-pointer translation cache
    /// (spec.md §3).
    ip_cache: Option<(u32, u32)>,
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            tlb_data: vec![0; TLB_ENTRIES],
            tlb_info: vec![TlbPerm::empty(); TLB_ENTRIES],
            tlb_info_global: vec![TlbPerm::empty(); TLB_ENTRIES],
            ip_cache: None,
        }
    }

    /// Full invalidation: clears both permission arrays and the data array.
    pub fn full_clear(&mut self) {
        self.tlb_info.iter_mut().for_each(|p| *p = TlbPerm::empty());
        self.tlb_info_global.iter_mut().for_each(|p| *p = TlbPerm::empty());
        self.tlb_data.iter_mut().for_each(|d| *d = 0);
        self.ip_cache = None;
    }

    /// Partial invalidation (CR3 reload): clears `tlb_info` but preserves
    /// entries recorded as global in `tlb_info_global`.
    pub fn clear(&mut self) {
        for page in 0..TLB_ENTRIES {
            if self.tlb_info_global[page].is_empty() {
                self.tlb_info[page] = TlbPerm::empty();
            } else {
                self.tlb_info[page] = self.tlb_info_global[page];
            }
        }
        self.ip_cache = None;
    }

    /// `invlpg`: clears a single page's TLB entry.
    pub fn invlpg(&mut self, addr: u32) {
        let page = (addr >> 12) as usize;
        self.tlb_info[page] = TlbPerm::empty();
        self.tlb_info_global[page] = TlbPerm::empty();
        if let Some((cached_page, _)) = self.ip_cache {
            if cached_page == addr & !0xFFF {
                self.ip_cache = None;
            }
        }
    }

    pub fn invalidate_ip_cache(&mut self) {
        self.ip_cache = None;
    }

    fn required_perm(user: bool, write: bool) -> TlbPerm {
        match (user, write) {
            (false, false) => TlbPerm::SYSTEM_READ,
            (false, true) => TlbPerm::SYSTEM_WRITE,
            (true, false) => TlbPerm::USER_READ,
            (true, true) => TlbPerm::USER_WRITE,
        }
    }

    fn lookup(&self, page: usize, need: TlbPerm) -> Option<u32> {
        if self.tlb_info[page].contains(need) {
            Some(self.tlb_data[page])
        } else {
            None
        }
    }

    fn install(&mut self, page: usize, phys_base: u32, perm: TlbPerm, global: bool) {
        self.tlb_data[page] = phys_base ^ ((page as u32) << 12);
        self.tlb_info[page] |= perm;
        if global {
            self.tlb_info_global[page] |= perm;
        }
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

/// Paging-relevant CPU state the walker needs read access to.
pub struct PagingState<'a> {
    pub cr0: Cr0,
    pub cr3: u32,
    pub cr4: Cr4,
    pub cpl: u8,
    pub memory: &'a mut Memory,
}

impl Tlb {
    /// `do_page_translation`, per spec.md §4.2's numbered algorithm.
    /// Returns the physical base address (offset bits not yet applied) and
    /// records whether the mapping covers a 4 MiB page for the caller's
    /// cross-page-boundary bookkeeping.
    fn do_page_translation(
        &mut self,
        state: &mut PagingState,
        addr: u32,
        kind: AccessKind,
        user: bool,
    ) -> Result<u32, CpuException> {
        let page = addr >> 12;
        let pde_addr = (state.cr3 & 0xFFFF_F000) + (page >> 10) * 4;
        let mut pde = Pte::from_bits_truncate(state.memory.read32(pde_addr));

        let pf = |present: bool, write: bool, user: bool| CpuException::PageFault {
            addr,
            code: {
                let mut c = PfErrCode::empty();
                if present {
                    c |= PfErrCode::PRESENT;
                }
                if write {
                    c |= PfErrCode::WRITE;
                }
                if user {
                    c |= PfErrCode::USER;
                }
                c
            },
        };

        let writing = kind == AccessKind::Write;

        if !pde.contains(Pte::PRESENT) {
            return Err(pf(false, writing, user));
        }
        if writing && !pde.contains(Pte::WRITE) && (user || state.cr0.contains(Cr0::WP)) {
            return Err(pf(true, true, user));
        }
        if user && !pde.contains(Pte::USER) {
            return Err(pf(true, writing, user));
        }

        let huge_pages_enabled = state.cr4.contains(Cr4::PSE);

        if pde.contains(Pte::PAGE_SIZE) && huge_pages_enabled {
            pde |= Pte::ACCESSED;
            if writing {
                pde |= Pte::DIRTY;
            }
            state.memory.write32(pde_addr, pde.bits);

            let phys_base = (pde.bits & PDE_BASE_4M_MASK) | (addr & 0x003F_F000);
            let perm = Self::perm_for(pde.contains(Pte::WRITE), pde.contains(Pte::USER), state.cr0.contains(Cr0::WP));
            self.install(page as usize, phys_base & 0xFFFF_F000, perm, pde.contains(Pte::GLOBAL) && state.cr4.contains(Cr4::PGE));
            return Ok(phys_base);
        }

        let pte_addr = (pde.bits & 0xFFFF_F000) + (page & 0x3FF) * 4;
        let mut pte = Pte::from_bits_truncate(state.memory.read32(pte_addr));

        if !pte.contains(Pte::PRESENT) {
            return Err(pf(false, writing, user));
        }
        if writing && !pte.contains(Pte::WRITE) && (user || state.cr0.contains(Cr0::WP)) {
            return Err(pf(true, true, user));
        }
        if user && !pte.contains(Pte::USER) {
            return Err(pf(true, writing, user));
        }

        pde |= Pte::ACCESSED;
        state.memory.write32(pde_addr, pde.bits);
        pte |= Pte::ACCESSED;
        if writing {
            pte |= Pte::DIRTY;
        }
        state.memory.write32(pte_addr, pte.bits);

        let phys_base = pte.bits & PTE_BASE_4K_MASK;
        let effective_write = pte.contains(Pte::WRITE) && pde.contains(Pte::WRITE);
        let effective_user = pte.contains(Pte::USER) && pde.contains(Pte::USER);
        let perm = Self::perm_for(effective_write, effective_user, state.cr0.contains(Cr0::WP));
        self.install(page as usize, phys_base, perm, pte.contains(Pte::GLOBAL) && state.cr4.contains(Cr4::PGE));

        Ok(phys_base)
    }

    fn perm_for(writable: bool, userland: bool, wp: bool) -> TlbPerm {
        let mut perm = TlbPerm::SYSTEM_READ;
        if !wp || writable {
            perm |= TlbPerm::SYSTEM_WRITE;
        }
        if userland {
            perm |= TlbPerm::USER_READ;
            if writable {
                perm |= TlbPerm::USER_WRITE;
            }
        }
        perm
    }

    /// Translates a virtual address for a given access class, walking the
    /// page tables (and populating the TLB) on a miss. Returns the physical
    /// address with the page offset re-applied.
    pub fn translate(
        &mut self,
        state: &mut PagingState,
        vaddr: u32,
        kind: AccessKind,
        user: bool,
    ) -> Result<u32, CpuException> {
        if !state.cr0.contains(Cr0::PG) {
            return Ok(vaddr);
        }

        let page = (vaddr >> 12) as usize;
        let need = Self::required_perm(user, kind == AccessKind::Write);

        let base = if let Some(entry) = self.lookup(page, need) {
            entry ^ ((page as u32) << 12)
        } else {
            self.do_page_translation(state, vaddr, kind, user)?
        };

        Ok(base | (vaddr & 0xFFF))
    }

    pub fn translate_read(&mut self, state: &mut PagingState, vaddr: u32) -> Result<u32, CpuException> {
        let user = state.cpl == 3;
        self.translate(state, vaddr, AccessKind::Read, user)
    }

    pub fn translate_write(&mut self, state: &mut PagingState, vaddr: u32) -> Result<u32, CpuException> {
        let user = state.cpl == 3;
        self.translate(state, vaddr, AccessKind::Write, user)
    }

    pub fn translate_system_read(&mut self, state: &mut PagingState, vaddr: u32) -> Result<u32, CpuException> {
        self.translate(state, vaddr, AccessKind::Read, false)
    }

    pub fn translate_system_write(&mut self, state: &mut PagingState, vaddr: u32) -> Result<u32, CpuException> {
        self.translate(state, vaddr, AccessKind::Write, false)
    }

    /// Pre-faults up to two pages so a subsequent sub-page-crossing write
    /// never leaves partial state (spec.md §4.2).
    pub fn writable_or_pagefault(&mut self, state: &mut PagingState, vaddr: u32, size: u32) -> Result<(), CpuException> {
        self.translate_write(state, vaddr)?;
        let last_byte = vaddr.wrapping_add(size.saturating_sub(1));
        if last_byte >> 12 != vaddr >> 12 {
            self.translate_write(state, last_byte)?;
        }
        Ok(())
    }

    /// Caches the translation of the executing code page for sequential
    /// byte fetches, per spec.md §3's instruction-pointer cache.
    pub fn translate_eip(&mut self, state: &mut PagingState, eip_linear: u32) -> Result<u32, CpuException> {
        let page = eip_linear & !0xFFF;
        if let Some((cached_page, phys)) = self.ip_cache {
            if cached_page == page {
                return Ok(phys | (eip_linear & 0xFFF));
            }
        }
        let phys = self.translate_system_read(state, eip_linear)?;
        self.ip_cache = Some((page, phys & !0xFFF));
        Ok(phys)
    }
}

/// Reads a word/dword that may straddle two physical pages, stitching bytes
/// in the correct order (spec.md §4.2's `virt_boundary_read{16,32}`).
pub fn virt_boundary_read16(mem: &mut Memory, p0: u32, p1: u32, crosses: bool) -> u16 {
    if !crosses {
        mem.read16(p0)
    } else {
        mem.read8(p0) as u16 | (mem.read8(p1) as u16) << 8
    }
}

pub fn virt_boundary_read32(mem: &mut Memory, addrs: [u32; 4], crosses: bool, base: u32) -> u32 {
    if !crosses {
        mem.read32(base)
    } else {
        addrs.iter().enumerate().fold(0u32, |acc, (i, &a)| acc | (mem.read8(a) as u32) << (8 * i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident_map(mem: &mut Memory, pd_base: u32) {
        // Single 4 MiB identity-mapped PDE covering [0, 4MiB).
        let pde = Pte::PRESENT | Pte::WRITE | Pte::USER | Pte::PAGE_SIZE;
        mem.write32(pd_base, pde.bits);
    }

    #[test]
    fn identity_mapped_4mb_page_translates() {
        let mut mem = Memory::new(0x40_0000 + 0x1000);
        ident_map(&mut mem, 0x3F_F000);
        let mut tlb = Tlb::new();
        let mut state = PagingState {
            cr0: Cr0::PG | Cr0::PE,
            cr3: 0x3F_F000,
            cr4: Cr4::PSE,
            cpl: 0,
            memory: &mut mem,
        };
        let phys = tlb.translate_read(&mut state, 0x1234).unwrap();
        assert_eq!(phys, 0x1234);
    }

    #[test]
    fn not_present_pde_faults() {
        let mut mem = Memory::new(0x40_0000 + 0x1000);
        // PDE left zeroed => not present.
        let mut tlb = Tlb::new();
        let mut state = PagingState {
            cr0: Cr0::PG | Cr0::PE,
            cr3: 0x3F_F000,
            cr4: Cr4::empty(),
            cpl: 3,
            memory: &mut mem,
        };
        let err = tlb.translate_read(&mut state, 0x1000).unwrap_err();
        match err {
            CpuException::PageFault { addr, code } => {
                assert_eq!(addr, 0x1000);
                assert_eq!(code.bits, PfErrCode::USER.bits);
            }
            _ => panic!("expected page fault"),
        }
    }

    #[test]
    fn tlb_entry_matches_walk_xor_identity() {
        let mut mem = Memory::new(0x40_0000 + 0x1000);
        ident_map(&mut mem, 0x3F_F000);
        let mut tlb = Tlb::new();
        let mut state = PagingState {
            cr0: Cr0::PG | Cr0::PE,
            cr3: 0x3F_F000,
            cr4: Cr4::PSE,
            cpl: 0,
            memory: &mut mem,
        };
        tlb.translate_read(&mut state, 0x2000).unwrap();
        let page = 0x2000usize >> 12;
        assert!(tlb.tlb_info[page].contains(TlbPerm::SYSTEM_READ));
        assert_eq!(tlb.tlb_data[page] ^ ((page as u32) << 12), 0x2000 & 0xFFFF_F000);
    }
}
