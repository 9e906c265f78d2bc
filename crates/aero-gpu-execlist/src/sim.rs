//! Software model of an execlist engine, for tests and headless builds.
//!
//! The model never executes anything on its own. Submit port writes are acknowledged right away
//! (an idle-to-active or lite-restore entry, as the hardware does); everything after that is
//! driven explicitly by tests through the helpers below, each of which appends the status buffer
//! entries real hardware would write for that event. The caller then runs the interrupt path.

use crate::csb::{CsbEntry, CsbStatus, GEN8_CSB_ENTRIES};
use crate::hw::{ElspElement, EngineHw};
use crate::port::EXECLIST_MAX_PORTS;
use crate::request::{ContextId, Seqno};

#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    csb: Vec<CsbEntry>,
    csb_write: u8,
    completion_counter: Seqno,
    /// What the hardware is currently executing, front first.
    running: Vec<ElspElement>,
    submissions: Vec<Vec<Option<ElspElement>>>,
    preempt_context: Option<ContextId>,
    preempt_injections: u32,
    irq_enabled: bool,
    resets: u32,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(GEN8_CSB_ENTRIES)
    }
}

impl SimulatedEngine {
    pub fn new(csb_entries: u8) -> Self {
        Self {
            csb: vec![CsbEntry::default(); csb_entries as usize],
            csb_write: csb_entries - 1,
            completion_counter: 0,
            running: Vec::with_capacity(EXECLIST_MAX_PORTS),
            submissions: Vec::new(),
            preempt_context: None,
            preempt_injections: 0,
            irq_enabled: false,
            resets: 0,
        }
    }

    /// Every submit port write so far, oldest first.
    pub fn submissions(&self) -> &[Vec<Option<ElspElement>>] {
        &self.submissions
    }

    pub fn last_submission(&self) -> Option<&[Option<ElspElement>]> {
        self.submissions.last().map(Vec::as_slice)
    }

    pub fn running(&self) -> &[ElspElement] {
        &self.running
    }

    pub fn preempt_pending(&self) -> bool {
        self.preempt_context.is_some()
    }

    pub fn preempt_injections(&self) -> u32 {
        self.preempt_injections
    }

    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn completion_counter(&self) -> Seqno {
        self.completion_counter
    }

    pub fn set_completion_counter(&mut self, seqno: Seqno) {
        self.completion_counter = seqno;
    }

    /// Appends an arbitrary status entry.
    pub fn push_raw(&mut self, entry: CsbEntry) {
        self.csb_write = (self.csb_write + 1) % self.csb.len() as u8;
        self.csb[self.csb_write as usize] = entry;
    }

    fn push(&mut self, status: CsbStatus, context_id: ContextId) {
        self.push_raw(CsbEntry::new(status, context_id));
    }

    /// The front context ran to its final breadcrumb.
    ///
    /// Advances the completion counter to the element's seqno and switches to the next port.
    pub fn complete_front(&mut self) -> Option<ElspElement> {
        if self.running.is_empty() {
            return None;
        }
        let done = self.running.remove(0);
        self.completion_counter = done.seqno;
        let switch = if self.running.is_empty() {
            CsbStatus::ACTIVE_IDLE
        } else {
            CsbStatus::ELEMENT_SWITCH
        };
        self.push(CsbStatus::COMPLETE | switch, done.context_id);
        Some(done)
    }

    /// Reports a lite restore of the front context without a submit port write.
    pub fn lite_restore(&mut self) {
        if let Some(front) = self.running.first() {
            let context_id = front.context_id;
            self.push(CsbStatus::PREEMPTED | CsbStatus::LITE_RESTORE, context_id);
        }
    }

    /// The preempt-to-idle context ran: every running context is switched out.
    ///
    /// Returns `false` if no preemption was requested.
    pub fn ack_preemption(&mut self) -> bool {
        let Some(preempt) = self.preempt_context.take() else {
            return false;
        };
        if let Some(front) = self.running.first() {
            let context_id = front.context_id;
            self.push(CsbStatus::PREEMPTED, context_id);
        }
        self.running.clear();
        self.push(CsbStatus::COMPLETE | CsbStatus::ACTIVE_IDLE, preempt);
        true
    }
}

impl EngineHw for SimulatedEngine {
    fn submit_ports(&mut self, elements: &[Option<ElspElement>]) {
        self.submissions.push(elements.to_vec());
        let next: Vec<ElspElement> = elements.iter().flatten().copied().collect();
        let old = self.running.first().map(|e| e.context_id);
        let new = next.first().map(|e| e.context_id);
        match (old, new) {
            (None, Some(front)) => self.push(CsbStatus::IDLE_ACTIVE, front),
            (Some(old), Some(new)) if old == new => {
                self.push(CsbStatus::PREEMPTED | CsbStatus::LITE_RESTORE, old)
            }
            (Some(old), _) => self.push(CsbStatus::PREEMPTED, old),
            (None, None) => {}
        }
        self.running = next;
    }

    fn inject_preempt(&mut self, context_id: ContextId) {
        self.preempt_context = Some(context_id);
        self.preempt_injections += 1;
    }

    fn csb_write_pointer(&self) -> u8 {
        self.csb_write
    }

    fn read_status_entry(&self, idx: u8) -> CsbEntry {
        self.csb
            .get(idx as usize)
            .copied()
            .unwrap_or_default()
    }

    fn read_completion_counter(&self) -> Seqno {
        self.completion_counter
    }

    fn irq_enable(&mut self) {
        self.irq_enabled = true;
    }

    fn irq_disable(&mut self) {
        self.irq_enabled = false;
    }

    fn reset(&mut self) {
        let entries = self.csb.len();
        self.csb.iter_mut().for_each(|e| *e = CsbEntry::default());
        self.csb_write = (entries - 1) as u8;
        self.running.clear();
        self.preempt_context = None;
        self.irq_enabled = false;
        self.resets += 1;
    }
}
