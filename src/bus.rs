//! Collaborator glue: the interrupt sink devices use to signal the CPU,
//! per spec.md §9's redesign note ("the CPU owns the bus connector and
//! exposes a narrow `InterruptSink` to devices, instead of devices holding
//! a back-pointer into the CPU").
//!
//! No teacher analog (bare-metal code talks to the interrupt controller
//! directly via `interrupts::cli`/`sti`); grounded on the
//! `wilsonzlin-aero` `aero_cpu_core::PortIo`-style trait-at-the-seam
//! pattern from `other_examples` for how a hosted emulator core exposes a
//! narrow capability to its collaborators instead of a full back-reference.

use std::cell::Cell;
use std::rc::Rc;

/// The narrow capability a device model needs to request attention from
/// the CPU: raising a hardware interrupt request line and (for the 8259-
/// style single-line case) nothing else. Devices never see `Cpu` itself.
pub trait InterruptSink {
    fn raise_irq(&self, line: u8);
    fn lower_irq(&self, line: u8);
}

/// Shared pending-IRQ bitmap the CPU polls once per cycle and any number of
/// devices can set bits in concurrently (single-threaded `Rc<Cell<_>>`,
/// matching this crate's synchronous, non-`Send` execution model).
#[derive(Clone)]
pub struct BusConnector {
    pending_irqs: Rc<Cell<u32>>,
}

impl BusConnector {
    pub fn new() -> Self {
        Self { pending_irqs: Rc::new(Cell::new(0)) }
    }

    /// Hands out a cloneable `InterruptSink` handle for a device model to
    /// hold, decoupling device code from the concrete `Cpu` type.
    pub fn sink(&self) -> BusSink {
        BusSink { pending_irqs: self.pending_irqs.clone() }
    }

    /// Takes and clears the pending-IRQ bitmap; called once per cycle by
    /// the CPU's interrupt-polling step.
    pub fn take_pending(&self) -> u32 {
        self.pending_irqs.replace(0)
    }

    pub fn has_pending(&self) -> bool {
        self.pending_irqs.get() != 0
    }

    /// Merges lines back into the pending bitmap, used by the CPU's
    /// interrupt-polling step to put back lines it took via
    /// `take_pending` but did not deliver this cycle.
    pub fn requeue_pending(&self, bits: u32) {
        self.pending_irqs.set(self.pending_irqs.get() | bits);
    }
}

impl Default for BusConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct BusSink {
    pending_irqs: Rc<Cell<u32>>,
}

impl InterruptSink for BusSink {
    fn raise_irq(&self, line: u8) {
        let bit = 1u32 << (line & 0x1F);
        self.pending_irqs.set(self.pending_irqs.get() | bit);
    }

    fn lower_irq(&self, line: u8) {
        let bit = 1u32 << (line & 0x1F);
        self.pending_irqs.set(self.pending_irqs.get() & !bit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raised_irq_is_visible_through_take_pending() {
        let bus = BusConnector::new();
        let sink = bus.sink();
        sink.raise_irq(3);
        assert!(bus.has_pending());
        let pending = bus.take_pending();
        assert_eq!(pending, 1 << 3);
        assert!(!bus.has_pending());
    }

    #[test]
    fn lower_irq_clears_only_that_line() {
        let bus = BusConnector::new();
        let sink = bus.sink();
        sink.raise_irq(1);
        sink.raise_irq(5);
        sink.lower_irq(1);
        assert_eq!(bus.take_pending(), 1 << 5);
    }
}
