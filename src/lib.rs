//! An IA-32 (i386-class) protected-mode CPU core: register file, segment
//! and paging MMU, lazy-flag ALU, instruction decode/dispatch, interrupt
//! delivery, x87 FPU, I/O port bus, and snapshot save/restore.
//!
//! The core is hosted (not `no_std`): it owns a flat `Vec<u8>` physical
//! memory and is driven one cycle at a time by an embedder through
//! [`cpu::Cpu::run_cycles`], which never blocks and never touches the host
//! clock or filesystem, per spec.md §5/§9.

pub mod alu;
pub mod bus;
pub mod cpu;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod flags;
pub mod fpu;
pub mod interrupts;
pub mod memory;
pub mod ports;
pub mod registers;
pub mod segmentation;
pub mod snapshot;
pub mod strings;
pub mod tlb;

pub use cpu::{Cpu, CpuConfig};
pub use error::CpuException;
pub use registers::PrivLvl;
