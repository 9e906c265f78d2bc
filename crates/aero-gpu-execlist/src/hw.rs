//! Boundary between the scheduler and the engine hardware.

use crate::csb::CsbEntry;
use crate::request::{ContextId, Seqno};

/// One execlist submit port element as written to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElspElement {
    pub context_id: ContextId,
    /// Ring offset the hardware executes up to.
    pub ring_tail: u32,
    /// Seqno the element's final breadcrumb writes to the completion counter.
    pub seqno: Seqno,
}

/// Register-level operations the scheduler needs from an engine.
///
/// Implementations may be a real MMIO layer or a software model such as
/// [`crate::sim::SimulatedEngine`]. All calls are made with the engine lock held.
pub trait EngineHw {
    /// Writes the submit ports. `elements[0]` runs first; `None` leaves a port empty.
    fn submit_ports(&mut self, elements: &[Option<ElspElement>]);

    /// Submits the preempt-to-idle context, switching out everything in the ports.
    fn inject_preempt(&mut self, context_id: ContextId);

    /// Index of the most recent status buffer entry written by the hardware.
    fn csb_write_pointer(&self) -> u8;

    fn read_status_entry(&self, idx: u8) -> CsbEntry;

    /// Last seqno the hardware wrote to the status page.
    fn read_completion_counter(&self) -> Seqno;

    /// Enables the user interrupt raised by breadcrumbs.
    fn irq_enable(&mut self);
    fn irq_disable(&mut self);

    fn reset(&mut self);
}

impl<T: EngineHw + ?Sized> EngineHw for Box<T> {
    fn submit_ports(&mut self, elements: &[Option<ElspElement>]) {
        (**self).submit_ports(elements)
    }

    fn inject_preempt(&mut self, context_id: ContextId) {
        (**self).inject_preempt(context_id)
    }

    fn csb_write_pointer(&self) -> u8 {
        (**self).csb_write_pointer()
    }

    fn read_status_entry(&self, idx: u8) -> CsbEntry {
        (**self).read_status_entry(idx)
    }

    fn read_completion_counter(&self) -> Seqno {
        (**self).read_completion_counter()
    }

    fn irq_enable(&mut self) {
        (**self).irq_enable()
    }

    fn irq_disable(&mut self) {
        (**self).irq_disable()
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
